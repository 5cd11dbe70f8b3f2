//! Stable digests used as cache keys.
//!
//! - [`json_digest`]: SHA-256 of compact JSON with sorted object keys
//! - [`atoms_content_digest`]: SHA-256 over `(atom_id, sha256(text))` pairs,
//!   in the order the atoms are given to the unit

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::atom::Atom;
use crate::domain::error::Result;

/// Hex SHA-256 of a UTF-8 string.
pub fn sha256_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Compact JSON with object keys sorted at every depth.
///
/// `serde_json::Value` objects are backed by a sorted map, so routing the
/// payload through `to_value` is enough to canonicalize key order.
pub fn canonical_json<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    let value = serde_json::to_value(payload)?;
    Ok(serde_json::to_string(&value)?)
}

/// Hex SHA-256 of [`canonical_json`].
pub fn json_digest<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    Ok(sha256_text(&canonical_json(payload)?))
}

/// Order-sensitive digest of the atoms handed to one unit of work.
///
/// Prompt order changes model output, so reordering the same atoms yields a
/// different digest.
pub fn atoms_content_digest<'a>(atoms: impl IntoIterator<Item = &'a Atom>) -> String {
    let pairs: Vec<serde_json::Value> = atoms
        .into_iter()
        .map(|atom| {
            serde_json::Value::Array(vec![
                serde_json::Value::String(atom.atom_id.clone()),
                serde_json::Value::String(sha256_text(&atom.text)),
            ])
        })
        .collect();
    sha256_text(&serde_json::Value::Array(pairs).to_string())
}
