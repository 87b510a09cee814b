//! Keycode is an order-preserving encoding used for keys in the key/value
//! stores. Unlike bincode's variable-length integers, the byte order of
//! encoded keys must match the logical order of their values, since storage
//! engines iterate in lexicographical key order (e.g. log scans by index).
//!
//! Keys are built from a single tag byte identifying the keyspace, followed by
//! fixed-width big-endian integers and/or raw UTF-8 string bytes. A string can
//! only appear as the final component, so it needs no terminator or escaping.

use crate::error::Result;
use crate::errdata;

/// Encodes a u64 in big-endian byte order, preserving ordering.
pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decodes a big-endian u64 from the front of the given bytes, returning the
/// value and the remainder.
pub fn take_u64(bytes: &[u8]) -> Result<(u64, &[u8])> {
    if bytes.len() < 8 {
        return errdata!("u64 key component requires 8 bytes, got {}", bytes.len());
    }
    let (head, tail) = bytes.split_at(8);
    Ok((u64::from_be_bytes(head.try_into().expect("split length must be 8")), tail))
}

/// Decodes the tag byte from the front of a key.
pub fn take_tag(bytes: &[u8]) -> Result<(u8, &[u8])> {
    match bytes.split_first() {
        Some((tag, tail)) => Ok((*tag, tail)),
        None => errdata!("empty key"),
    }
}
