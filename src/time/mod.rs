//! The time-synchronization subsystem: NTP-style clock-offset sampling
//! against cluster peers, drift-rate estimation, and timestamp correction.
//!
//! The [`sync`] module runs the periodic sampling rounds and maintains the
//! shared [`Clock`]; the [`correct`] module applies (and validates) the
//! resulting corrections to message timestamps.

pub mod correct;
pub mod sync;

pub use correct::{CorrectionStats, Corrector};
pub use sync::{Clock, SyncOptions, TimeStats};

/// Returns the local wall-clock time as Unix seconds.
pub fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs_f64()
}
