//! `ObjString`: an immutable, interned, hash-precomputed byte string.
//!
//! `ObjString` is the one object variant that lives in `lox-core` rather
//! than `lox-runtime`: it has no outgoing references (the collector's trace
//! step is a no-op for it, per the data model), so it never needs to know
//! about `Obj{Function,Closure,...}`, and the hash table below needs it
//! directly as its key type.
//!
//! Construction (the `take`/`copy` distinction, interning, hashing) is the
//! memory manager's job — see `lox-runtime::heap::Heap::{take_string,
//! copy_string}` — because interning consults the heap's intern table and
//! installing a new string requires linking it onto the heap's allocation
//! list. This module only defines the data layout and the FNV-1a hash used
//! throughout.

use crate::gc_header::{GcHeader, ObjKind};

#[repr(C)]
pub struct ObjString {
    pub header: GcHeader,
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl ObjString {
    /// Construct a detached `ObjString`. Not linked onto any allocation
    /// list and not interned — the heap does that.
    pub fn new(bytes: Box<[u8]>) -> Self {
        let hash = fnv1a_hash(&bytes);
        ObjString {
            header: GcHeader::new(ObjKind::String),
            bytes,
            hash,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf-8>")
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// FNV-1a, the hash clox uses for string interning: cheap, and good enough
/// for a table whose keys are already canonicalized by interning.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(fnv1a_hash(b"hello"), fnv1a_hash(b"hello"));
        assert_ne!(fnv1a_hash(b"hello"), fnv1a_hash(b"world"));
    }

    #[test]
    fn empty_string_has_a_hash() {
        let s = ObjString::new(Box::from(&b""[..]));
        assert_eq!(s.hash, fnv1a_hash(b""));
        assert!(s.is_empty());
    }
}
