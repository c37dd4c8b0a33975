//! Translation between local names and server-legal names.
//!
//! The server reserves `""`, `"."` and `".."`. A local name that equals one
//! of those after trimming trailing spaces is stored with one extra trailing
//! space, and the space is removed again on the way out. The mapping is a
//! bijection, so names round-trip losslessly.

/// Name given to entries before the caller names them.
pub const DEFAULT_NAME_FOR_NEW_NODES: &str = " ";

const FORBIDDEN_SERVER_NAMES: [&str; 3] = ["", ".", ".."];

/// Returns true if `name` is a reserved name followed by zero or more spaces.
#[must_use]
pub fn is_name_server_illegal_after_trimming(name: &str) -> bool {
    let trimmed = name.trim_end_matches(' ');
    FORBIDDEN_SERVER_NAMES.contains(&trimmed)
}

/// Converts a local name to the form stored and sent to the server.
#[must_use]
pub fn sync_api_name_to_server_name(name: &str) -> String {
    let mut out = name.to_owned();
    if is_name_server_illegal_after_trimming(&out) {
        out.push(' ');
    }
    out
}

/// Converts a stored name back to the local form.
#[must_use]
pub fn server_name_to_sync_api_name(name: &str) -> String {
    match name.strip_suffix(' ') {
        Some(stripped) if is_name_server_illegal_after_trimming(name) => stripped.to_owned(),
        _ => name.to_owned(),
    }
}
