//! The failure detector: periodic liveness probes against every peer.
//!
//! Each probe round issues a cheap heartbeat request to each peer. A peer
//! flips to dead after a small number of consecutive failures, and back to
//! alive on the next success; a fresh revival triggers the catch-up routine.
//! Probing is fully independent of the consensus RPCs and shares no locks
//! with them; consumers read snapshot copies of the health map.

use crate::time::now;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Consecutive probe failures before a peer is marked dead.
const FAILURE_THRESHOLD: u32 = 2;

/// The health of a single peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerHealth {
    /// Whether the peer currently counts as alive.
    pub alive: bool,
    /// The local time of the last successful probe, if any.
    pub last_ok: Option<f64>,
    /// The current run of consecutive probe failures.
    pub consecutive_failures: u32,
}

impl PeerHealth {
    /// Peers start out alive: declaring a peer dead requires observed
    /// failures, not merely the absence of history.
    fn new() -> Self {
        Self { alive: true, last_ok: None, consecutive_failures: 0 }
    }
}

/// The failure detector. Shared across tasks via Arc; the health map is
/// behind its own lock, held only for map reads and writes.
pub struct Detector {
    peers: Vec<String>,
    interval: Duration,
    client: reqwest::Client,
    health: RwLock<HashMap<String, PeerHealth>>,
}

impl Detector {
    pub fn new(peers: Vec<String>, interval: Duration, client: reqwest::Client) -> Self {
        let health = peers.iter().map(|p| (p.clone(), PeerHealth::new())).collect();
        Self { peers, interval, client, health: RwLock::new(health) }
    }

    /// Returns the peers currently considered alive.
    pub fn alive_peers(&self) -> Vec<String> {
        let health = self.health.read().expect("lock poisoned");
        self.peers.iter().filter(|p| health.get(*p).is_some_and(|h| h.alive)).cloned().collect()
    }

    /// Returns a snapshot of the health map, keyed by peer URL.
    pub fn snapshot(&self) -> BTreeMap<String, PeerHealth> {
        let health = self.health.read().expect("lock poisoned");
        health.iter().map(|(p, h)| (p.clone(), h.clone())).collect()
    }

    /// Probes a single peer's heartbeat endpoint.
    async fn probe(&self, peer: &str) -> bool {
        let timeout = self.interval.min(Duration::from_secs(2));
        match self
            .client
            .get(format!("{peer}/heartbeat"))
            .timeout(timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(_) => true,
            Err(err) => {
                debug!("Heartbeat probe of {peer} failed: {err}");
                false
            }
        }
    }

    /// Records a probe result, returning true if the peer freshly revived.
    fn record(&self, peer: &str, ok: bool) -> bool {
        let mut health = self.health.write().expect("lock poisoned");
        let entry = health.entry(peer.to_string()).or_insert_with(PeerHealth::new);
        if ok {
            let revived = !entry.alive;
            entry.alive = true;
            entry.last_ok = Some(now());
            entry.consecutive_failures = 0;
            if revived {
                info!("Peer {peer} recovered");
            }
            revived
        } else {
            entry.consecutive_failures += 1;
            if entry.alive && entry.consecutive_failures >= FAILURE_THRESHOLD {
                warn!("Peer {peer} marked dead after {} failures", entry.consecutive_failures);
                entry.alive = false;
            }
            false
        }
    }

    /// Marks a peer as failed from an external observation (e.g. a failed
    /// sync), counting it like a probe failure.
    pub fn report_failure(&self, peer: &str) {
        self.record(peer, false);
    }

    /// Runs one probe round, returning the peers that freshly revived.
    pub async fn probe_round(&self) -> Vec<String> {
        let mut revived = Vec::new();
        for peer in self.peers.clone() {
            let ok = self.probe(&peer).await;
            if self.record(&peer, ok) {
                revived.push(peer);
            }
        }
        revived
    }

    /// Runs probe rounds forever, announcing freshly revived peers on the
    /// given channel.
    pub async fn run(self: Arc<Self>, revived_tx: mpsc::UnboundedSender<String>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for peer in self.probe_round().await {
                if revived_tx.send(peer).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(peers: &[&str]) -> Detector {
        Detector::new(
            peers.iter().map(|p| p.to_string()).collect(),
            Duration::from_secs(5),
            reqwest::Client::new(),
        )
    }

    /// Peers start alive and flip to dead only after the failure threshold.
    #[test]
    fn failure_threshold() {
        let d = detector(&["http://a"]);
        assert_eq!(d.alive_peers(), vec!["http://a"]);

        assert!(!d.record("http://a", false));
        assert!(d.alive_peers().contains(&"http://a".to_string()));

        assert!(!d.record("http://a", false));
        assert!(d.alive_peers().is_empty());
        let health = d.snapshot();
        assert_eq!(health["http://a"].consecutive_failures, 2);
        assert!(!health["http://a"].alive);
    }

    /// A success after death revives the peer, exactly once.
    #[test]
    fn revival() {
        let d = detector(&["http://a"]);
        d.record("http://a", false);
        d.record("http://a", false);
        assert!(d.alive_peers().is_empty());

        // The first success revives; the next does not re-announce.
        assert!(d.record("http://a", true));
        assert!(!d.record("http://a", true));
        let health = d.snapshot();
        assert!(health["http://a"].alive);
        assert_eq!(health["http://a"].consecutive_failures, 0);
        assert!(health["http://a"].last_ok.is_some());
    }

    /// A success before the threshold resets the failure count.
    #[test]
    fn failure_reset() {
        let d = detector(&["http://a"]);
        d.record("http://a", false);
        assert!(!d.record("http://a", true));
        d.record("http://a", false);
        assert!(d.alive_peers().contains(&"http://a".to_string()));
    }
}
