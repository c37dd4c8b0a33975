//! # synctree core
//!
//! Transactional local store for a synchronized tree of entries.
//!
//! This crate provides:
//! - [`Ordinal`], an arbitrary-precision sibling position key
//! - The entry model and [`Directory`] store, indexed by metahandle, server
//!   id and unique tag
//! - Scoped read / write transactions with rollback
//! - A change listener contract fired exactly once per changed transaction
//! - A node-level API ([`ReadNode`], [`WriteNode`]) for application code
//!
//! ## Key Invariants
//!
//! - Parent links never form a cycle
//! - The root is never deleted, renamed or moved
//! - Live siblings form one doubly linked list per parent; tombstones are
//!   unlinked but stay addressable by handle and id
//! - Every local change sets the dirty flag; only the sync loop clears it

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_event;
mod config;
mod dir;
mod directory;
mod entry;
mod error;
mod manager;
mod node;
mod ordinal;
mod transaction;
mod types;

pub use change_event::{CalculateChangesEvent, DirectoryChangeListener};
pub use config::Config;
pub use dir::{read_snapshot, DirectoryLocation, SNAPSHOT_FILE};
pub use directory::Directory;
pub use entry::{
    is_name_server_illegal_after_trimming, server_name_to_sync_api_name,
    sync_api_name_to_server_name, DirectoryInfo, EntryKernel, EntryTable,
    DEFAULT_NAME_FOR_NEW_NODES,
};
pub use error::{CoreError, CoreResult};
pub use manager::DirectoryManager;
pub use node::{ReadNode, WriteNode};
pub use ordinal::Ordinal;
pub use transaction::{BaseTransaction, MutableEntry, ReadTransaction, WriteTransaction};
pub use types::{Metahandle, SyncId, WriterTag};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
