//! Inspect command implementation.

use super::load_table;
use serde::Serialize;
use std::path::Path;
use synctree_core::EntryTable;

/// Directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Directory path.
    pub path: String,
    /// Entries other than the root, tombstones included.
    pub entry_count: usize,
    /// Live entries other than the root.
    pub live_count: usize,
    /// Tombstones.
    pub tombstone_count: usize,
    /// Entries waiting to be committed.
    pub unsynced_count: usize,
    /// Download cursor.
    pub download_cursor: u64,
    /// Whether the initial download has completed.
    pub initial_sync_ended: bool,
    /// Server store birthday.
    pub store_birthday: Option<String>,
}

impl InspectResult {
    /// Summarizes `table`.
    pub fn from_table(path: &Path, table: &EntryTable) -> Self {
        let entries = table.iter().filter(|e| !e.is_root());
        let (mut entry_count, mut live_count, mut tombstone_count, mut unsynced_count) =
            (0, 0, 0, 0);
        for entry in entries {
            entry_count += 1;
            if entry.is_del {
                tombstone_count += 1;
            } else {
                live_count += 1;
            }
            if entry.is_unsynced {
                unsynced_count += 1;
            }
        }
        let info = table.info();
        Self {
            path: path.display().to_string(),
            entry_count,
            live_count,
            tombstone_count,
            unsynced_count,
            download_cursor: info.download_cursor,
            initial_sync_ended: info.initial_sync_ended,
            store_birthday: info.store_birthday.clone(),
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_table(path)?;
    let result = InspectResult::from_table(path, &table);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("synctree Directory Inspection");
    println!("=============================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Entries:");
    println!("  Total:      {}", result.entry_count);
    println!("  Live:       {}", result.live_count);
    println!("  Tombstones: {}", result.tombstone_count);
    println!("  Unsynced:   {}", result.unsynced_count);
    println!();
    println!("Sync:");
    println!("  Download cursor:    {}", result.download_cursor);
    println!("  Initial sync ended: {}", result.initial_sync_ended);
    println!(
        "  Store birthday:     {}",
        result.store_birthday.as_deref().unwrap_or("-")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use synctree_core::{Directory, Metahandle, WriteNode, WriterTag};
    use tempfile::tempdir;

    #[test]
    fn counts_live_tombstoned_and_unsynced() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("alice");
        {
            let dir = Directory::open(&path, "alice", Default::default()).unwrap();
            dir.write(WriterTag::SyncApi, |wtx| {
                let keep = WriteNode::init_by_creation(wtx, Metahandle::ROOT, None)?.id();
                let mut gone = WriteNode::init_by_creation(wtx, Metahandle::ROOT, Some(keep))?;
                gone.remove()?;
                wtx.set_download_cursor(7);
                Ok(())
            })
            .unwrap();
            dir.close().unwrap();
        }

        let table = load_table(&path).unwrap();
        let result = InspectResult::from_table(&path, &table);
        assert_eq!(result.entry_count, 2);
        assert_eq!(result.live_count, 1);
        assert_eq!(result.tombstone_count, 1);
        assert_eq!(result.unsynced_count, 2);
        assert_eq!(result.download_cursor, 7);
        assert!(!result.initial_sync_ended);
    }

    #[test]
    fn missing_directory_is_reported() {
        let temp = tempdir().unwrap();
        assert!(matches!(
            load_table(&temp.path().join("nobody")),
            Err(super::super::CommandError::NotFound(_))
        ));
    }
}
