//! Binary data encodings for durable storage.
//!
//! - keycode: order-preserving encoding, used for keys in the key/value store.
//! - bincode: compact encoding, used for values in the key/value store.
//!
//! The wire format between nodes and clients is JSON (see the server module)
//! and is unrelated to these encodings.

pub mod bincode;
pub mod keycode;

use crate::error::Result;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A value that can be encoded to and from a durable binary representation.
/// Blanket-implemented via bincode for any serde-compatible type that opts in.
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value. Errors are considered bugs and panic.
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }

    /// Decodes the value from a binary representation.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}
