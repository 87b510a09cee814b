//! Durable key/value storage engines backing the replicated log and the
//! applied message store. For details, see the [`engine`], [`file`], and
//! [`memory`] module documentation.

pub mod engine;
pub mod file;
pub mod memory;

pub use engine::{Engine, ScanIterator, Status};
pub use file::FileLog;
pub use memory::Memory;
