#![warn(clippy::all)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::module_inception)]
#![allow(clippy::type_complexity)]

pub mod encoding;
pub mod error;
pub mod ordering;
pub mod raft;
pub mod server;
pub mod storage;
pub mod store;
pub mod time;

pub use error::{Error, Result};
pub use server::Server;
