//! Ordinal helper commands.

use synctree_core::{CoreResult, Ordinal};

/// Hex ordinal strictly between two hex ordinals, in either order.
pub fn between(first: &str, second: &str) -> CoreResult<String> {
    let first = Ordinal::from_hex(first)?;
    let second = Ordinal::from_hex(second)?;
    Ok(first.create_between(&second)?.to_hex())
}

/// Hex ordinal for an integer position.
pub fn from_int(value: i64) -> String {
    Ordinal::from_i64(value).to_hex()
}
