//! Order-independent hashing for mergeable content.
//!
//! Every stamped container's hash is the XOR of its children's
//! id-qualified hashes, XORed with the hash of its own time. XOR keeps the
//! composition independent of iteration order, and qualifying each child
//! hash with its id keeps different key sets from colliding. Because XOR is
//! its own inverse, a parent can be updated in place when one child changes.

use crate::{Cell, Hash};

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a over the UTF-16 code units of `text`.
pub fn get_hash(text: &str) -> Hash {
    text.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash of a cell (or tombstone) stamped at `time`.
pub fn get_cell_hash(cell: Option<&Cell>, time: &str) -> Hash {
    let json = cell.map_or_else(|| "null".to_string(), Cell::to_json_string);
    get_hash(&format!("{json}:{time}"))
}

/// A child's contribution to its parent's hash.
pub fn get_child_in_parent_hash(id: &str, hash: Hash) -> Hash {
    get_hash(&format!("{id}:{hash}"))
}

/// A container time's contribution to the container's hash.
pub fn get_time_hash(time: &str) -> Hash {
    get_hash(time)
}

/// Compose a container hash from its children and its time.
pub fn get_container_hash<'a>(children: impl IntoIterator<Item = (&'a str, Hash)>, time: &str) -> Hash {
    children
        .into_iter()
        .fold(get_time_hash(time), |hash, (id, child)| {
            hash ^ get_child_in_parent_hash(id, child)
        })
}

/// Add a hash to, or remove it from, a composed hash.
pub fn add_or_remove_hash(hash: Hash, other: Hash) -> Hash {
    hash ^ other
}
