//! NTP-style time synchronization with cluster peers.
//!
//! Every sync interval, the node exchanges four timestamps with each alive
//! peer: local send t1, peer receive t2, peer send t3, local receive t4,
//! yielding offset = ((t2 - t1) + (t3 - t4)) / 2 and
//! delay = (t4 - t1) - (t3 - t2). Implausible samples are discarded. The
//! cluster clock offset is the median of per-peer median offsets, the drift
//! rate is a least-squares fit over the consensus offset history, and the
//! accuracy estimate is the median absolute deviation of the current
//! samples.

use super::now;
use crate::error::Result;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Time synchronization options.
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// The interval between synchronization rounds.
    pub interval: Duration,
    /// The per-peer request deadline.
    pub timeout: Duration,
    /// Samples with an absolute offset above this are discarded, and the
    /// clock is not considered synchronized beyond it.
    pub max_offset: f64,
    /// Samples with a round-trip delay above this (or non-positive) are
    /// discarded.
    pub max_delay: f64,
    /// The number of samples retained per peer.
    pub samples_per_peer: usize,
    /// The number of consensus offsets retained for drift regression.
    pub history_size: usize,
    /// The clock counts as synchronized while the residual spread (MAD) is
    /// at or below this.
    pub accuracy_threshold: f64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(2),
            max_offset: 1.0,
            max_delay: 1.0,
            samples_per_peer: 32,
            history_size: 20,
            accuracy_threshold: 0.25,
        }
    }
}

/// A single offset/delay measurement against a peer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// The estimated clock offset to add to local time.
    pub offset: f64,
    /// The estimated network round-trip delay.
    pub delay: f64,
    /// The local time the sample was taken.
    pub at: f64,
}

/// The mutable synchronization state, behind the shared [`Clock`].
#[derive(Default)]
struct SyncState {
    /// The consensus clock offset: add to local time for cluster time.
    clock_offset: f64,
    /// First-order clock drift in seconds per second.
    drift_rate: f64,
    /// The median network delay of the last round.
    network_delay: f64,
    /// Residual error estimate (median absolute deviation of samples).
    sync_accuracy: f64,
    /// The local time of the last successful round.
    last_sync: f64,
    /// Bounded per-peer sample history.
    samples: HashMap<String, VecDeque<Sample>>,
    /// Bounded (time, consensus offset) history for drift regression.
    history: VecDeque<(f64, f64)>,
    /// Synchronization round counters.
    attempts: u64,
    successes: u64,
}

/// A snapshot of the synchronization state, for the stats endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeStats {
    pub synchronized: bool,
    pub clock_offset: f64,
    pub drift_rate: f64,
    pub network_delay: f64,
    pub sync_accuracy: f64,
    pub predicted_offset: f64,
    pub last_sync_time: f64,
    pub offset_history_size: usize,
    pub sync_attempts: u64,
    pub successful_syncs: u64,
    pub success_rate: f64,
    pub peer_offsets: BTreeMap<String, f64>,
    pub peer_delays: BTreeMap<String, f64>,
}

/// The shared cluster clock. Sampling rounds update it; the corrector and
/// status endpoints read snapshot copies. Lock hold times are short and
/// never span IO.
#[derive(Clone)]
pub struct Clock {
    opts: SyncOptions,
    state: Arc<RwLock<SyncState>>,
}

impl Clock {
    pub fn new(opts: SyncOptions) -> Self {
        Self { opts, state: Arc::new(RwLock::new(SyncState::default())) }
    }

    /// Returns the current consensus clock offset.
    pub fn offset(&self) -> f64 {
        self.state.read().expect("lock poisoned").clock_offset
    }

    /// Returns the current drift rate in seconds per second.
    pub fn drift_rate(&self) -> f64 {
        self.state.read().expect("lock poisoned").drift_rate
    }

    /// Returns the current local time corrected to cluster time.
    pub fn synchronized_time(&self) -> f64 {
        now() + self.offset()
    }

    /// Whether the clock currently counts as synchronized: at least one peer
    /// has produced valid samples recently, and the residual spread is below
    /// the configured threshold.
    pub fn is_synchronized(&self) -> bool {
        let state = self.state.read().expect("lock poisoned");
        !state.samples.is_empty()
            && now() - state.last_sync < 2.0 * self.opts.interval.as_secs_f64()
            && state.sync_accuracy <= self.opts.accuracy_threshold
            && state.clock_offset.abs() <= self.opts.max_offset
    }

    /// Validates and records a round of per-peer samples, recomputing the
    /// consensus offset, drift rate, and accuracy. Returns whether any valid
    /// samples were obtained.
    pub fn record_round(&self, round: Vec<(String, Sample)>) -> bool {
        let at = now();
        let mut state = self.state.write().expect("lock poisoned");
        state.attempts += 1;
        if round.is_empty() {
            warn!("Time sync round produced no valid samples");
            return false;
        }

        for (peer, sample) in round {
            debug!("Time sample from {peer}: offset={:.6} delay={:.6}", sample.offset, sample.delay);
            let samples = state.samples.entry(peer).or_default();
            samples.push_back(sample);
            while samples.len() > self.opts.samples_per_peer {
                samples.pop_front();
            }
        }

        // Consensus offset: the median of per-peer median offsets, robust
        // against a single skewed peer.
        let peer_medians: Vec<f64> = state
            .samples
            .values()
            .map(|s| median(s.iter().map(|s| s.offset)))
            .collect();
        state.clock_offset = median(peer_medians.iter().copied());
        state.network_delay =
            median(state.samples.values().map(|s| median(s.iter().map(|s| s.delay))));

        // Residual spread across all retained samples.
        let offsets: Vec<f64> =
            state.samples.values().flatten().map(|s| s.offset).collect();
        let center = median(offsets.iter().copied());
        state.sync_accuracy = median(offsets.iter().map(|o| (o - center).abs()));

        // Drift: least-squares slope over the consensus offset history.
        let consensus = state.clock_offset;
        state.history.push_back((at, consensus));
        while state.history.len() > self.opts.history_size {
            state.history.pop_front();
        }
        state.drift_rate = if state.history.len() >= 3 {
            regression_slope(state.history.iter().copied())
        } else {
            0.0
        };
        if state.drift_rate.abs() > 1e-6 {
            warn!("Significant clock drift detected: {:.9} s/s", state.drift_rate);
        }

        state.last_sync = at;
        state.successes += 1;
        info!(
            "Time synchronized: offset={:.6}s accuracy={:.6}s drift={:.9}s/s",
            state.clock_offset, state.sync_accuracy, state.drift_rate
        );
        true
    }

    /// Returns a snapshot of the synchronization state.
    pub fn stats(&self) -> TimeStats {
        let at = now();
        let state = self.state.read().expect("lock poisoned");
        let latest = |samples: &VecDeque<Sample>| samples.back().copied();
        TimeStats {
            synchronized: !state.samples.is_empty()
                && at - state.last_sync < 2.0 * self.opts.interval.as_secs_f64()
                && state.sync_accuracy <= self.opts.accuracy_threshold
                && state.clock_offset.abs() <= self.opts.max_offset,
            clock_offset: state.clock_offset,
            drift_rate: state.drift_rate,
            network_delay: state.network_delay,
            sync_accuracy: state.sync_accuracy,
            predicted_offset: state.clock_offset
                + state.drift_rate * (at - state.last_sync).max(0.0),
            last_sync_time: state.last_sync,
            offset_history_size: state.history.len(),
            sync_attempts: state.attempts,
            successful_syncs: state.successes,
            success_rate: state.successes as f64 / state.attempts.max(1) as f64,
            peer_offsets: state
                .samples
                .iter()
                .filter_map(|(p, s)| latest(s).map(|s| (p.clone(), s.offset)))
                .collect(),
            peer_delays: state
                .samples
                .iter()
                .filter_map(|(p, s)| latest(s).map(|s| (p.clone(), s.delay)))
                .collect(),
        }
    }

    /// Measures offset and delay against a single peer, returning None when
    /// the peer is unreachable or the sample is implausible.
    pub async fn sample_peer(&self, client: &reqwest::Client, peer: &str) -> Option<Sample> {
        #[derive(Deserialize)]
        struct TimeResponse {
            server_receive_time: f64,
            server_send_time: f64,
        }

        let t1 = now();
        let resp = match client
            .get(format!("{peer}/time"))
            .timeout(self.opts.timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => resp,
            Err(err) => {
                debug!("Time sync with {peer} failed: {err}");
                return None;
            }
        };
        let t4 = now();
        let body: TimeResponse = match resp.json().await {
            Ok(body) => body,
            Err(err) => {
                debug!("Time sync with {peer} returned invalid body: {err}");
                return None;
            }
        };
        let (t2, t3) = (body.server_receive_time, body.server_send_time);

        let offset = ((t2 - t1) + (t3 - t4)) / 2.0;
        let delay = (t4 - t1) - (t3 - t2);
        if delay <= 0.0 || delay > self.opts.max_delay || offset.abs() > self.opts.max_offset {
            warn!("Rejected time sample from {peer}: offset={offset:.6} delay={delay:.6}");
            return None;
        }
        Some(Sample { offset, delay, at: t4 })
    }

    /// Runs one synchronization round against the given peers, recording any
    /// valid samples. Returns whether the round succeeded.
    pub async fn synchronize(&self, client: &reqwest::Client, peers: &[String]) -> Result<bool> {
        if peers.is_empty() {
            return Ok(false);
        }
        let mut round = Vec::new();
        for peer in peers {
            if let Some(sample) = self.sample_peer(client, peer).await {
                round.push((peer.clone(), sample));
            }
        }
        Ok(self.record_round(round))
    }

    /// Returns the configured sync interval.
    pub fn interval(&self) -> Duration {
        self.opts.interval
    }
}

/// Returns the median of the given values, or 0.0 when empty.
fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut values: Vec<f64> = values.collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Returns the least-squares slope of (x, y) points, or 0.0 when degenerate.
fn regression_slope(points: impl Iterator<Item = (f64, f64)>) -> f64 {
    let points: Vec<(f64, f64)> = points.collect();
    let n = points.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let x_mean = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let y_mean = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let numerator: f64 = points.iter().map(|(x, y)| (x - x_mean) * (y - y_mean)).sum();
    let denominator: f64 = points.iter().map(|(x, _)| (x - x_mean).powi(2)).sum();
    if denominator == 0.0 {
        return 0.0;
    }
    numerator / denominator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(offset: f64, delay: f64) -> Sample {
        Sample { offset, delay, at: now() }
    }

    #[test]
    fn median_values() {
        assert_eq!(median([].into_iter()), 0.0);
        assert_eq!(median([3.0].into_iter()), 3.0);
        assert_eq!(median([3.0, 1.0].into_iter()), 2.0);
        assert_eq!(median([5.0, 1.0, 3.0].into_iter()), 3.0);
    }

    #[test]
    fn regression() {
        // A perfect linear drift of 2 s/s.
        let points = [(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)];
        let slope = regression_slope(points.into_iter());
        assert!((slope - 2.0).abs() < 1e-9);

        // A flat series has no drift.
        let points = [(0.0, 1.0), (1.0, 1.0), (2.0, 1.0)];
        assert_eq!(regression_slope(points.into_iter()), 0.0);

        // Identical x values are degenerate.
        let points = [(1.0, 1.0), (1.0, 2.0)];
        assert_eq!(regression_slope(points.into_iter()), 0.0);
    }

    /// The consensus offset is the median of per-peer medians, resisting a
    /// single skewed peer.
    #[test]
    fn consensus_offset() {
        let clock = Clock::new(SyncOptions::default());
        assert!(clock.record_round(vec![
            ("a".to_string(), sample(0.010, 0.01)),
            ("b".to_string(), sample(0.012, 0.01)),
            ("c".to_string(), sample(0.900, 0.01)),
        ]));
        assert_eq!(clock.offset(), 0.012);
        assert!(clock.is_synchronized());
    }

    /// An empty round counts as a failed attempt and does not synchronize.
    #[test]
    fn empty_round() {
        let clock = Clock::new(SyncOptions::default());
        assert!(!clock.record_round(vec![]));
        assert!(!clock.is_synchronized());
        let stats = clock.stats();
        assert_eq!(stats.sync_attempts, 1);
        assert_eq!(stats.successful_syncs, 0);
    }

    /// Per-peer sample history is bounded.
    #[test]
    fn bounded_samples() {
        let opts = SyncOptions { samples_per_peer: 4, ..SyncOptions::default() };
        let clock = Clock::new(opts);
        for i in 0..10 {
            clock.record_round(vec![("a".to_string(), sample(i as f64 * 0.25, 0.01))]);
        }
        let stats = clock.stats();
        // The consensus offset reflects only the last 4 samples, offsets
        // 1.5..=2.25 in 0.25 steps.
        assert_eq!(clock.offset(), 1.875);
        assert_eq!(stats.peer_offsets["a"], 2.25);
    }

    /// The accuracy threshold gates the synchronized flag.
    #[test]
    fn accuracy_gate() {
        let opts = SyncOptions { accuracy_threshold: 0.001, ..SyncOptions::default() };
        let clock = Clock::new(opts);
        clock.record_round(vec![
            ("a".to_string(), sample(0.1, 0.01)),
            ("b".to_string(), sample(0.5, 0.01)),
        ]);
        assert!(!clock.is_synchronized());
    }
}
