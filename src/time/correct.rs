//! Timestamp validation and correction.
//!
//! Given a raw timestamp produced Δt seconds ago, the corrected value is
//! raw + clock_offset + drift_rate · Δt. Timestamps more than a bounded
//! amount in the future (per the corrected local clock) or excessively old
//! are rejected with a recoverable error rather than silently clamped.

use super::{now, Clock};
use crate::errinput;
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// The default bound on how far ahead of the corrected clock a timestamp may
/// be, in seconds.
pub const DEFAULT_MAX_FUTURE_SKEW: f64 = 5.0;

/// The default bound on how far behind the corrected clock a timestamp may
/// be, in seconds. Guards against stale clients and clock jumps.
pub const DEFAULT_MAX_PAST_SKEW: f64 = 60.0;

/// Aggregate correction statistics, for the time stats endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionStats {
    /// The number of corrections applied.
    pub corrections_applied: u64,
    /// The mean absolute correction magnitude.
    pub average_magnitude: f64,
    /// The largest absolute correction magnitude.
    pub max_magnitude: f64,
    /// The number of timestamps rejected by validation.
    pub rejected: u64,
}

#[derive(Default)]
struct Totals {
    applied: u64,
    total_magnitude: f64,
    max_magnitude: f64,
    rejected: u64,
}

/// Applies clock-offset and drift-aware corrections to timestamps. Clones
/// share the underlying clock and statistics, so the apply pipeline and the
/// correction endpoint see one set of numbers.
#[derive(Clone)]
pub struct Corrector {
    clock: Clock,
    max_future_skew: f64,
    max_past_skew: f64,
    totals: Arc<Mutex<Totals>>,
}

impl Corrector {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            max_future_skew: DEFAULT_MAX_FUTURE_SKEW,
            max_past_skew: DEFAULT_MAX_PAST_SKEW,
            totals: Arc::new(Mutex::new(Totals::default())),
        }
    }

    /// Validates a raw timestamp against the corrected local clock.
    pub fn validate(&self, ts: f64) -> Result<()> {
        if !ts.is_finite() {
            let mut totals = self.totals.lock().expect("lock poisoned");
            totals.rejected += 1;
            return errinput!("timestamp must be a finite number");
        }
        let reference = self.clock.synchronized_time();
        if ts - reference > self.max_future_skew {
            let mut totals = self.totals.lock().expect("lock poisoned");
            totals.rejected += 1;
            return errinput!("timestamp is implausibly ahead of the local clock");
        }
        if reference - ts > self.max_past_skew {
            let mut totals = self.totals.lock().expect("lock poisoned");
            totals.rejected += 1;
            return errinput!("timestamp is excessively old");
        }
        Ok(())
    }

    /// Validates and corrects a raw timestamp, returning the corrected
    /// value.
    pub fn correct(&self, ts: f64) -> Result<f64> {
        self.validate(ts)?;
        Ok(self.apply(ts))
    }

    /// Corrects a raw timestamp without validation. Used by the apply
    /// pipeline for committed entries, which can no longer be rejected.
    pub fn apply(&self, ts: f64) -> f64 {
        let age = (now() - ts).max(0.0);
        let corrected = ts + self.clock.offset() + self.clock.drift_rate() * age;
        let mut totals = self.totals.lock().expect("lock poisoned");
        totals.applied += 1;
        let magnitude = (corrected - ts).abs();
        totals.total_magnitude += magnitude;
        totals.max_magnitude = totals.max_magnitude.max(magnitude);
        corrected
    }

    /// Inverts a correction applied at the given age: with a stable offset
    /// and zero drift this round-trips to the original raw timestamp.
    pub fn invert(&self, corrected: f64) -> f64 {
        let offset = self.clock.offset();
        let raw = corrected - offset;
        let age = (now() - raw).max(0.0);
        corrected - offset - self.clock.drift_rate() * age
    }

    /// Returns a snapshot of the correction statistics.
    pub fn stats(&self) -> CorrectionStats {
        let totals = self.totals.lock().expect("lock poisoned");
        CorrectionStats {
            corrections_applied: totals.applied,
            average_magnitude: if totals.applied == 0 {
                0.0
            } else {
                totals.total_magnitude / totals.applied as f64
            },
            max_magnitude: totals.max_magnitude,
            rejected: totals.rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::sync::{Sample, SyncOptions};
    use crate::Error;

    /// Builds a corrector whose clock has the given consensus offset.
    fn corrector(offset: f64) -> Corrector {
        let clock = Clock::new(SyncOptions { max_offset: 10.0, ..SyncOptions::default() });
        if offset != 0.0 {
            clock.record_round(vec![(
                "peer".to_string(),
                Sample { offset, delay: 0.01, at: now() },
            )]);
        }
        Corrector::new(clock)
    }

    /// Correction applies the clock offset.
    #[test]
    fn applies_offset() {
        let corrector = corrector(0.5);
        let ts = now() - 1.0;
        let corrected = corrector.correct(ts).unwrap();
        assert!((corrected - (ts + 0.5)).abs() < 1e-9);
    }

    /// Correcting then inverting with a stable offset and zero drift yields
    /// the original timestamp within floating-point epsilon.
    #[test]
    fn round_trip() {
        let corrector = corrector(0.25);
        let ts = now() - 2.0;
        let corrected = corrector.correct(ts).unwrap();
        let raw = corrector.invert(corrected);
        assert!((raw - ts).abs() < 1e-9);
    }

    /// Future-dated timestamps beyond the bound are rejected, not clamped.
    #[test]
    fn rejects_future() {
        let corrector = corrector(0.0);
        let err = corrector.correct(now() + 60.0);
        assert!(matches!(err, Err(Error::InvalidInput(_))));
        // Just slightly ahead is tolerated.
        assert!(corrector.correct(now() + 1.0).is_ok());
        assert_eq!(corrector.stats().rejected, 1);
    }

    /// Excessively old timestamps are rejected.
    #[test]
    fn rejects_ancient() {
        let corrector = corrector(0.0);
        let err = corrector.correct(now() - 3600.0);
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }

    /// Non-finite timestamps are rejected.
    #[test]
    fn rejects_non_finite() {
        let corrector = corrector(0.0);
        assert!(corrector.correct(f64::NAN).is_err());
        assert!(corrector.correct(f64::INFINITY).is_err());
    }

    /// Statistics aggregate applied corrections.
    #[test]
    fn stats() {
        let corrector = corrector(0.5);
        corrector.correct(now() - 1.0).unwrap();
        corrector.correct(now() - 2.0).unwrap();
        let stats = corrector.stats();
        assert_eq!(stats.corrections_applied, 2);
        assert!(stats.max_magnitude > 0.0);
        assert!(stats.average_magnitude > 0.0);
    }
}
