//! Dump command implementation.

use super::load_table;
use serde::Serialize;
use std::path::Path;
use synctree_core::{server_name_to_sync_api_name, EntryTable, SyncId};

/// One live entry in tree order.
#[derive(Debug, Serialize)]
pub struct DumpedEntry {
    /// Nesting depth; children of the root are at 0.
    pub depth: usize,
    /// Metahandle.
    pub handle: i64,
    /// Server id.
    pub id: String,
    /// Title as shown to users.
    pub title: String,
    /// Folder or leaf.
    pub is_dir: bool,
    /// Waiting to be committed.
    pub unsynced: bool,
    /// URL payload, empty for folders.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Ordinal position, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<String>,
}

/// Walks the live tree depth-first in sibling order.
pub fn collect(table: &EntryTable) -> Vec<DumpedEntry> {
    let mut out = Vec::new();
    walk(table, &SyncId::root(), 0, &mut out);
    out
}

fn walk(table: &EntryTable, parent: &SyncId, depth: usize, out: &mut Vec<DumpedEntry>) {
    for mh in table.child_handles(parent) {
        let Some(entry) = table.get(mh) else {
            continue;
        };
        out.push(DumpedEntry {
            depth,
            handle: mh.as_i64(),
            id: entry.id.to_string(),
            title: server_name_to_sync_api_name(&entry.name),
            is_dir: entry.is_dir,
            unsynced: entry.is_unsynced,
            url: entry.url.clone(),
            ordinal: entry.ordinal.as_ref().map(|o| o.to_hex()),
        });
        if entry.is_dir {
            walk(table, &entry.id, depth + 1, out);
        }
    }
}

/// Runs the dump command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_table(path)?;
    let entries = collect(&table);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => {
            for entry in &entries {
                let marker = if entry.is_dir { "+" } else { "-" };
                let dirty = if entry.unsynced { " *" } else { "" };
                println!(
                    "{:indent$}{marker} {} [{}]{dirty}",
                    "",
                    entry.title,
                    entry.id,
                    indent = entry.depth * 2
                );
            }
            println!();
            println!("{} live entries", entries.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use synctree_core::{BaseTransaction, Directory, Metahandle, WriteNode, WriterTag};

    #[test]
    fn lists_children_after_their_parent_in_sibling_order() {
        let dir = Directory::open_in_memory("alice").unwrap();
        dir.write(WriterTag::SyncApi, |wtx| {
            let mut a = WriteNode::init_by_creation(wtx, Metahandle::ROOT, None)?;
            a.set_title("A")?;
            let a = a.id();
            let mut b = WriteNode::init_by_creation(wtx, Metahandle::ROOT, Some(a))?;
            b.set_title("B")?;
            let mut child = WriteNode::init_by_creation(wtx, a, None)?;
            child.set_title("A1")?;
            Ok(())
        })
        .unwrap();

        let trans = dir.read().unwrap();
        let titles: Vec<(usize, String)> = collect(trans.table())
            .into_iter()
            .map(|e| (e.depth, e.title))
            .collect();
        assert_eq!(
            titles,
            vec![(0, "A".to_owned()), (1, "A1".to_owned()), (0, "B".to_owned())]
        );
    }
}
