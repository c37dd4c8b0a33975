//! Tree and transaction behavior of the directory.

use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;
use synctree_core::{
    BaseTransaction, CoreError, Directory, DirectoryManager, Config, Metahandle, ReadNode,
    SyncId, WriteNode, WriterTag,
};
use tempfile::tempdir;

fn folder(dir: &Directory, parent: Metahandle, title: &str) -> Metahandle {
    dir.write(WriterTag::SyncApi, |wtx| {
        let mut node = WriteNode::init_by_creation(wtx, parent, None)?;
        node.set_title(title)?;
        Ok(node.id())
    })
    .unwrap()
}

/// Checks that every live child list is a well-formed doubly linked list.
fn assert_sibling_lists_consistent(dir: &Directory) {
    let rtx = dir.read().unwrap();
    let table = rtx.table();
    for entry in table.iter().filter(|e| e.is_dir && e.is_live()) {
        let children = table.child_handles(&entry.id);
        let live_children = table
            .iter()
            .filter(|e| e.is_live() && !e.is_root() && e.parent_id == entry.id)
            .count();
        assert_eq!(children.len(), live_children, "list of {} is broken", entry.id);

        let mut prev: Option<SyncId> = None;
        for mh in children {
            let child = table.get(mh).unwrap();
            assert_eq!(child.prev_id, prev);
            prev = Some(child.id.clone());
        }
    }
    for tombstone in table.iter().filter(|e| e.is_del) {
        assert!(tombstone.prev_id.is_none() && tombstone.next_id.is_none());
    }
}

#[test]
fn first_child_scenario() {
    let dir = Directory::open_in_memory("scenario@example.com").unwrap();
    let a = folder(&dir, Metahandle::ROOT, "Folder");
    let b = folder(&dir, a, "Only child");

    {
        let rtx = dir.read().unwrap();
        assert_eq!(ReadNode::by_id(&rtx, a).unwrap().first_child_id(), b);
    }

    dir.write(WriterTag::SyncApi, |wtx| WriteNode::init_by_id(wtx, b)?.remove())
        .unwrap();

    let rtx = dir.read().unwrap();
    assert_eq!(
        ReadNode::by_id(&rtx, a).unwrap().first_child_id(),
        Metahandle::INVALID
    );
}

#[test]
fn reparent_under_descendant_leaves_directory_unchanged() {
    let dir = Directory::open_in_memory("cycle@example.com").unwrap();
    let a = folder(&dir, Metahandle::ROOT, "a");
    let b = folder(&dir, a, "b");
    let c = folder(&dir, b, "c");
    let before: Vec<_> = {
        let rtx = dir.read().unwrap();
        let mut entries: Vec<_> = rtx.table().iter().cloned().collect();
        entries.sort_by_key(|e| e.metahandle);
        entries
    };

    let result = dir.write(WriterTag::SyncApi, |wtx| {
        // An unrelated edit first, which must be undone as well.
        WriteNode::init_by_id(wtx, c)?.set_title("renamed")?;
        WriteNode::init_by_id(wtx, a)?.set_position(c, None)
    });
    assert!(matches!(result, Err(CoreError::CycleDetected { .. })));

    let rtx = dir.read().unwrap();
    let mut after: Vec<_> = rtx.table().iter().cloned().collect();
    after.sort_by_key(|e| e.metahandle);
    assert_eq!(before, after);
}

#[test]
fn poisoned_transaction_cannot_commit() {
    let dir = Directory::open_in_memory("poison@example.com").unwrap();
    let a = folder(&dir, Metahandle::ROOT, "a");

    let mut wtx = dir.begin_write(WriterTag::SyncApi).unwrap();
    let created = wtx.create(&SyncId::root(), "x").unwrap();
    let err = wtx.entry_mut(a).unwrap().put_parent_id(&SyncId::from("missing"));
    assert!(matches!(err, Err(CoreError::IdNotFound(_))));
    assert!(!wtx.is_poisoned());

    let a_id = wtx.entry(a).unwrap().id.clone();
    assert!(wtx.entry_mut(a).unwrap().put_parent_id(&a_id).is_err());
    assert!(wtx.is_poisoned());
    assert!(matches!(
        wtx.commit(),
        Err(CoreError::TransactionAborted { .. })
    ));

    assert!(dir.read().unwrap().entry(created).is_none());
}

#[test]
fn root_is_immutable() {
    let dir = Directory::open_in_memory("root@example.com").unwrap();
    let result = dir.write(WriterTag::Syncer, |wtx| {
        wtx.entry_mut(Metahandle::ROOT)?.put_name("renamed")
    });
    assert!(matches!(result, Err(CoreError::RootImmutable)));
    assert_eq!(dir.read().unwrap().root().name, "");
}

#[test]
fn concurrent_duplicate_server_ids_leave_one_entry() {
    let dir = Arc::new(Directory::open_in_memory("race@example.com").unwrap());
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let dir = Arc::clone(&dir);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                dir.write(WriterTag::Syncer, |wtx| {
                    wtx.create_update_item(SyncId::from("server-7"))
                })
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(CoreError::DuplicateId(_)))));

    let rtx = dir.read().unwrap();
    let matching = rtx
        .table()
        .iter()
        .filter(|e| e.id == SyncId::from("server-7"))
        .count();
    assert_eq!(matching, 1);
    assert_eq!(rtx.table().len(), 2);
}

#[test]
fn readers_never_see_partial_writes() {
    let dir = Arc::new(Directory::open_in_memory("iso@example.com").unwrap());
    let writer = {
        let dir = Arc::clone(&dir);
        thread::spawn(move || {
            for _ in 0..50 {
                dir.write(WriterTag::SyncApi, |wtx| {
                    let a = wtx.create(&SyncId::root(), "a")?;
                    let b = wtx.create(&SyncId::root(), "b")?;
                    wtx.entry_mut(a)?.put_is_unsynced(true)?;
                    wtx.entry_mut(b)?.put_is_unsynced(true)?;
                    Ok(())
                })
                .unwrap();
            }
        })
    };
    for _ in 0..50 {
        let rtx = dir.read().unwrap();
        // Entries arrive in pairs, both dirty.
        assert_eq!(rtx.table().unsynced_handles().len() % 2, 0);
        assert_eq!((rtx.table().len() - 1) % 2, 0);
    }
    writer.join().unwrap();
}

#[test]
fn manager_persists_across_reopen() {
    let temp = tempdir().unwrap();
    let a = {
        let manager = DirectoryManager::new(temp.path(), Config::default());
        let dir = manager.open("bob@example.com").unwrap();
        let a = folder(&dir, Metahandle::ROOT, "Saved");
        manager.close_all().unwrap();
        a
    };

    let manager = DirectoryManager::new(temp.path(), Config::default());
    let dir = manager.open("bob@example.com").unwrap();
    let rtx = dir.read().unwrap();
    let node = ReadNode::by_id(&rtx, a).unwrap();
    assert_eq!(node.title(), "Saved");
    assert!(node.kernel().is_unsynced);

    // Handles keep growing after a reopen.
    drop(rtx);
    let b = folder(&dir, Metahandle::ROOT, "Next");
    assert!(b > a);
}

#[derive(Debug, Clone)]
enum Op {
    Create { parent: usize, pred: Option<usize> },
    Move { node: usize, parent: usize, pred: Option<usize> },
    Remove { node: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..16, prop::option::of(0usize..16))
            .prop_map(|(parent, pred)| Op::Create { parent, pred }),
        (0usize..16, 0usize..16, prop::option::of(0usize..16))
            .prop_map(|(node, parent, pred)| Op::Move { node, parent, pred }),
        (0usize..16).prop_map(|node| Op::Remove { node }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn random_edits_keep_sibling_lists_consistent(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let dir = Directory::open_in_memory("prop@example.com").unwrap();
        let mut nodes = vec![Metahandle::ROOT];
        let pick = |nodes: &[Metahandle], i: usize| nodes[i % nodes.len()];

        for op in ops {
            // Individual operations may legitimately fail (cycles, bad
            // predecessors, deleted targets); failures roll back.
            let _ = dir.write(WriterTag::SyncApi, |wtx| match &op {
                Op::Create { parent, pred } => {
                    let parent = pick(&nodes, *parent);
                    let pred = pred.map(|p| pick(&nodes, p));
                    WriteNode::init_by_creation(wtx, parent, pred).map(|n| Some(n.id()))
                }
                Op::Move { node, parent, pred } => {
                    let node = pick(&nodes, *node);
                    let parent = pick(&nodes, *parent);
                    let pred = pred.map(|p| pick(&nodes, p));
                    WriteNode::init_by_id(wtx, node)?.set_position(parent, pred).map(|_| None)
                }
                Op::Remove { node } => {
                    let node = pick(&nodes, *node);
                    WriteNode::init_by_id(wtx, node)?.remove().map(|_| None)
                }
            })
            .map(|created| nodes.extend(created));
        }

        assert_sibling_lists_consistent(&dir);
    }
}
