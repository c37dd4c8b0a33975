//! Directory entries.
//!
//! An entry is one node of the synchronized tree. Its identity (the
//! [`Metahandle`](crate::Metahandle)) never changes; every other field is
//! mutated only through a write transaction.

mod kernel;
mod name;
mod table;

pub use kernel::EntryKernel;
pub use name::{
    is_name_server_illegal_after_trimming, server_name_to_sync_api_name,
    sync_api_name_to_server_name, DEFAULT_NAME_FOR_NEW_NODES,
};
pub use table::{DirectoryInfo, EntryTable};
