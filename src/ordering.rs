//! The per-sender message reorder buffer.
//!
//! Applied messages land here after timestamp correction. Each sender gets a
//! bucket ordered by corrected timestamp (anonymous senders share one), and
//! messages are released into the delivery stream in non-decreasing
//! corrected-timestamp order per sender. A bucket's head releases as soon as
//! it is at or past the sender's release point: nothing earlier is pending
//! within its stream. A head behind the release point (a late arrival) waits
//! out a bounded hold-back window and is then released anyway, without
//! regressing the release point.
//!
//! The buffer is owned by the apply loop and mutated only there; readers get
//! snapshot copies via [`OrderingBuffer::stats`].

use crate::store::StoredMessage;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The default hold-back window in seconds: the maximum time a late message
/// waits behind its sender's release point before being released anyway.
pub const DEFAULT_HOLD_BACK: f64 = 5.0;

/// The default maximum number of buffered entries.
pub const DEFAULT_CAPACITY: usize = 1000;

/// The bucket key for messages without a sender.
const ANONYMOUS: &str = "";

/// A bucket ordering key: corrected timestamp with the message ID as a
/// tiebreaker. Implements total ordering over the timestamp floats.
#[derive(Clone, Debug, PartialEq)]
struct TsKey(f64, String);

impl Eq for TsKey {}

impl Ord for TsKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0).then_with(|| self.1.cmp(&other.1))
    }
}

impl PartialOrd for TsKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A buffered message with its local arrival time.
struct Pending {
    message: StoredMessage,
    arrival: f64,
}

/// A per-sender bucket of pending messages.
struct Bucket {
    /// Pending messages ordered by corrected timestamp.
    pending: BTreeMap<TsKey, Pending>,
    /// The corrected timestamp of the newest released message. Never
    /// decreases.
    last_delivered_ts: f64,
}

impl Bucket {
    fn new() -> Self {
        Self { pending: BTreeMap::new(), last_delivered_ts: f64::NEG_INFINITY }
    }
}

/// A snapshot of the buffer state, for the status endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// The number of buffered messages.
    pub buffer_size: usize,
    /// The buffer capacity.
    pub capacity: usize,
    /// Occupancy as a fraction of capacity.
    pub utilization: f64,
    /// The number of sender buckets with pending messages.
    pub senders: usize,
    /// Total messages accepted into the buffer.
    pub buffered: u64,
    /// Total messages released, in order or by window expiry.
    pub released: u64,
    /// Messages that arrived out of corrected-timestamp order.
    pub reordered: u64,
    /// Duplicate message IDs dropped.
    pub duplicates: u64,
    /// Messages released by the force-delivery escape hatch.
    pub forced: u64,
    /// Messages evicted due to a full buffer.
    pub dropped: u64,
    /// Average age of buffered messages in seconds.
    pub average_age: f64,
    /// Age of the oldest buffered message in seconds.
    pub max_age: f64,
    /// A sample of the next messages due for release.
    pub next_deliverable: Vec<NextDeliverable>,
}

/// A pending bucket head, due for release next within its sender's stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NextDeliverable {
    pub sender: String,
    pub msg_id: String,
    pub corrected_ts: f64,
    /// The local Unix time at which the message becomes releasable.
    pub deliverable_at: f64,
}

/// The reorder buffer. See the module documentation.
pub struct OrderingBuffer {
    /// Hold-back window in seconds.
    hold_back: f64,
    /// Maximum buffered entries before eviction.
    capacity: usize,
    /// Sender buckets.
    buckets: HashMap<String, Bucket>,
    /// Message IDs released recently, mapped to their release time. Used to
    /// drop duplicates; pruned periodically.
    delivered_ids: HashMap<String, f64>,
    /// Counters; see Stats.
    buffered: u64,
    released: u64,
    reordered: u64,
    duplicates: u64,
    forced: u64,
    dropped: u64,
}

impl OrderingBuffer {
    pub fn new(hold_back: f64, capacity: usize) -> Self {
        Self {
            hold_back,
            capacity,
            buckets: HashMap::new(),
            delivered_ids: HashMap::new(),
            buffered: 0,
            released: 0,
            reordered: 0,
            duplicates: 0,
            forced: 0,
            dropped: 0,
        }
    }

    /// Adds a message to its sender's bucket. Returns false if the message
    /// was a duplicate and was dropped.
    pub fn insert(&mut self, message: StoredMessage, now: f64) -> bool {
        let sender = message.sender.clone().unwrap_or_else(|| ANONYMOUS.to_string());
        let key = TsKey(message.corrected_ts, message.msg_id.clone());

        if self.delivered_ids.contains_key(&message.msg_id)
            || self.buckets.get(&sender).is_some_and(|b| b.pending.contains_key(&key))
        {
            debug!("Dropping duplicate message {}", message.msg_id);
            self.duplicates += 1;
            return false;
        }

        if self.size() >= self.capacity {
            self.evict_oldest();
        }

        let bucket = self.buckets.entry(sender).or_insert_with(Bucket::new);
        // Count arrivals that land behind already-seen timestamps.
        let out_of_order = message.corrected_ts < bucket.last_delivered_ts
            || bucket.pending.last_key_value().is_some_and(|(k, _)| key < *k);
        if out_of_order {
            self.reordered += 1;
        }
        bucket.pending.insert(key, Pending { message, arrival: now });
        self.buffered += 1;
        true
    }

    /// Releases all messages whose constraints are satisfied at the given
    /// time, in per-sender corrected-timestamp order.
    pub fn release_due(&mut self, now: f64) -> Vec<StoredMessage> {
        let mut released = Vec::new();
        for bucket in self.buckets.values_mut() {
            while let Some((key, pending)) = bucket.pending.first_key_value() {
                // An in-order head has no pending predecessor within its
                // stream and releases immediately; a head behind the release
                // point waits out the full hold-back window.
                let in_order = key.0 >= bucket.last_delivered_ts;
                if !in_order && now - pending.arrival < self.hold_back {
                    break;
                }
                if !in_order {
                    // A late release: the stream has already moved past this
                    // timestamp, so the release point is left untouched.
                    warn!(
                        "Releasing late message {} at {} behind stream position {}",
                        key.1, key.0, bucket.last_delivered_ts
                    );
                } else {
                    bucket.last_delivered_ts = key.0;
                }
                let (key, pending) = bucket.pending.pop_first().expect("head must exist");
                self.delivered_ids.insert(key.1, now);
                self.released += 1;
                released.push(pending.message);
            }
        }
        self.buckets.retain(|_, b| !b.pending.is_empty());
        self.prune_delivered(now);
        released
    }

    /// Releases every buffered message in per-sender corrected-timestamp
    /// order, ignoring the hold-back window. An operator escape hatch: it can
    /// release streams with gaps, so it is logged and counted.
    pub fn force_release(&mut self, now: f64) -> Vec<StoredMessage> {
        let mut released = Vec::new();
        for bucket in self.buckets.values_mut() {
            while let Some((key, pending)) = bucket.pending.pop_first() {
                bucket.last_delivered_ts = bucket.last_delivered_ts.max(key.0);
                self.delivered_ids.insert(key.1, now);
                self.released += 1;
                self.forced += 1;
                released.push(pending.message);
            }
        }
        self.buckets.retain(|_, b| !b.pending.is_empty());
        if !released.is_empty() {
            warn!("Force-delivered {} buffered messages", released.len());
        }
        // Present the combined stream in timestamp order.
        released.sort_by(|a, b| {
            a.corrected_ts.total_cmp(&b.corrected_ts).then_with(|| a.msg_id.cmp(&b.msg_id))
        });
        released
    }

    /// Returns the next local Unix time at which a release may become due,
    /// if anything is buffered. An in-order head is due at its arrival time,
    /// i.e. immediately.
    pub fn next_deadline(&self) -> Option<f64> {
        self.buckets
            .values()
            .filter_map(|b| {
                let (key, pending) = b.pending.first_key_value()?;
                let delay = if key.0 >= b.last_delivered_ts { 0.0 } else { self.hold_back };
                Some(pending.arrival + delay)
            })
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Returns a snapshot of the buffer state.
    pub fn stats(&self, now: f64) -> Stats {
        let ages: Vec<f64> = self
            .buckets
            .values()
            .flat_map(|b| b.pending.values().map(|p| now - p.arrival))
            .collect();
        let mut next_deliverable: Vec<NextDeliverable> = self
            .buckets
            .iter()
            .filter_map(|(sender, b)| {
                let (key, pending) = b.pending.first_key_value()?;
                let delay = if key.0 >= b.last_delivered_ts { 0.0 } else { self.hold_back };
                Some(NextDeliverable {
                    sender: sender.clone(),
                    msg_id: key.1.clone(),
                    corrected_ts: key.0,
                    deliverable_at: pending.arrival + delay,
                })
            })
            .collect();
        next_deliverable.sort_by(|a, b| a.deliverable_at.total_cmp(&b.deliverable_at));
        next_deliverable.truncate(5);

        Stats {
            buffer_size: ages.len(),
            capacity: self.capacity,
            utilization: ages.len() as f64 / self.capacity as f64,
            senders: self.buckets.len(),
            buffered: self.buffered,
            released: self.released,
            reordered: self.reordered,
            duplicates: self.duplicates,
            forced: self.forced,
            dropped: self.dropped,
            average_age: if ages.is_empty() { 0.0 } else { ages.iter().sum::<f64>() / ages.len() as f64 },
            max_age: ages.iter().copied().fold(0.0, f64::max),
            next_deliverable,
        }
    }

    /// Returns the number of buffered messages.
    fn size(&self) -> usize {
        self.buckets.values().map(|b| b.pending.len()).sum()
    }

    /// Evicts the oldest buffered message (by arrival) to make room.
    fn evict_oldest(&mut self) {
        let oldest = self
            .buckets
            .iter()
            .flat_map(|(sender, b)| {
                b.pending.iter().map(move |(key, p)| (p.arrival, sender.clone(), key.clone()))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));
        if let Some((_, sender, key)) = oldest {
            warn!("Ordering buffer full, evicting message {}", key.1);
            if let Some(bucket) = self.buckets.get_mut(&sender) {
                bucket.pending.remove(&key);
                if bucket.pending.is_empty() {
                    self.buckets.remove(&sender);
                }
            }
            self.dropped += 1;
        }
    }

    /// Prunes old delivered-ID records once they've aged out of the window
    /// where a duplicate could plausibly still arrive.
    fn prune_delivered(&mut self, now: f64) {
        if self.delivered_ids.len() > 2 * self.capacity {
            let cutoff = now - 3600.0;
            self.delivered_ids.retain(|_, at| *at > cutoff);
        }
    }
}

impl Default for OrderingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HOLD_BACK, DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(msg_id: &str, sender: Option<&str>, corrected_ts: f64) -> StoredMessage {
        StoredMessage {
            seq: 0,
            term: 1,
            msg_id: msg_id.to_string(),
            sender: sender.map(|s| s.to_string()),
            recipient: None,
            payload: format!("payload-{msg_id}"),
            original_ts: corrected_ts,
            corrected_ts,
        }
    }

    fn ids(messages: &[StoredMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.msg_id.as_str()).collect()
    }

    /// In-order messages release immediately, in timestamp order.
    #[test]
    fn release_in_order() {
        let mut buffer = OrderingBuffer::new(5.0, 100);
        assert!(buffer.insert(message("m1", Some("a"), 100.0), 1000.0));
        assert!(buffer.insert(message("m2", Some("a"), 101.0), 1000.1));

        let released = buffer.release_due(1000.1);
        assert_eq!(ids(&released), vec!["m1", "m2"]);
        assert_eq!(buffer.stats(1000.1).buffer_size, 0);
    }

    /// A late arrival that lands before any release is delivered ahead of an
    /// earlier arrival with a newer timestamp.
    #[test]
    fn reorders_within_window() {
        let mut buffer = OrderingBuffer::new(5.0, 100);
        buffer.insert(message("new", Some("a"), 100.0), 1000.0);
        buffer.insert(message("old", Some("a"), 99.5), 1000.1);

        let released = buffer.release_due(1000.1);
        assert_eq!(ids(&released), vec!["old", "new"]);
        assert_eq!(buffer.stats(1000.1).reordered, 1);
    }

    /// Release order is monotone per sender: a message arriving behind the
    /// release point waits for the full hold-back window, and releasing it
    /// does not regress the release point.
    #[test]
    fn monotone_release() {
        let mut buffer = OrderingBuffer::new(5.0, 100);
        buffer.insert(message("m1", Some("a"), 100.0), 1000.0);
        assert_eq!(ids(&buffer.release_due(1000.0)), vec!["m1"]);

        // A message behind the stream position does not release in order.
        buffer.insert(message("late", Some("a"), 99.0), 1001.0);
        assert!(buffer.release_due(1001.4).is_empty());

        // It releases once the window expires.
        assert_eq!(ids(&buffer.release_due(1006.1)), vec!["late"]);

        // The release point did not regress: a message at 99.5 is still
        // behind it and must also wait out the window.
        buffer.insert(message("also-late", Some("a"), 99.5), 1006.2);
        assert!(buffer.release_due(1006.6).is_empty());
    }

    /// Senders have independent streams; anonymous messages share a bucket.
    #[test]
    fn per_sender_buckets() {
        let mut buffer = OrderingBuffer::new(5.0, 100);
        buffer.insert(message("a1", Some("a"), 100.0), 1000.0);
        buffer.insert(message("b1", Some("b"), 50.0), 1000.0);
        buffer.insert(message("x1", None, 70.0), 1000.0);
        buffer.insert(message("x2", None, 60.0), 1000.0);

        let mut released = buffer.release_due(1000.0);
        released.sort_by(|a, b| a.msg_id.cmp(&b.msg_id));
        assert_eq!(ids(&released), vec!["a1", "b1", "x1", "x2"]);
        assert_eq!(buffer.stats(1000.0).senders, 0);
    }

    /// Duplicate message IDs are dropped, whether pending or delivered.
    #[test]
    fn duplicates() {
        let mut buffer = OrderingBuffer::new(5.0, 100);
        assert!(buffer.insert(message("m1", Some("a"), 100.0), 1000.0));
        assert!(!buffer.insert(message("m1", Some("a"), 100.0), 1000.1));

        buffer.release_due(1000.5);
        assert!(!buffer.insert(message("m1", Some("a"), 100.0), 1000.6));
        assert_eq!(buffer.stats(1000.6).duplicates, 2);
    }

    /// Force delivery flushes everything in timestamp order, ignoring the
    /// hold-back window, and counts it.
    #[test]
    fn force_delivery() {
        let mut buffer = OrderingBuffer::new(5.0, 100);
        buffer.insert(message("m2", Some("a"), 101.0), 1000.0);
        buffer.insert(message("m1", Some("a"), 100.0), 1000.0);
        buffer.insert(message("m3", Some("b"), 99.0), 1000.0);

        let released = buffer.force_release(1000.0);
        assert_eq!(ids(&released), vec!["m3", "m1", "m2"]);
        let stats = buffer.stats(1000.0);
        assert_eq!(stats.forced, 3);
        assert_eq!(stats.buffer_size, 0);
    }

    /// The capacity bound evicts the oldest arrival.
    #[test]
    fn capacity_eviction() {
        let mut buffer = OrderingBuffer::new(5.0, 2);
        buffer.insert(message("m1", Some("a"), 100.0), 1000.0);
        buffer.insert(message("m2", Some("a"), 101.0), 1001.0);
        buffer.insert(message("m3", Some("a"), 102.0), 1002.0);

        let stats = buffer.stats(1002.0);
        assert_eq!(stats.buffer_size, 2);
        assert_eq!(stats.dropped, 1);

        let released = buffer.release_due(1002.0);
        assert_eq!(ids(&released), vec!["m2", "m3"]);
    }

    /// The next deadline tracks the earliest releasable head: immediate for
    /// an in-order head, the hold-back window for a late one.
    #[test]
    fn next_deadline() {
        let mut buffer = OrderingBuffer::new(5.0, 100);
        assert_eq!(buffer.next_deadline(), None);

        buffer.insert(message("m1", Some("a"), 100.0), 1000.0);
        assert_eq!(buffer.next_deadline(), Some(1000.0));

        // A late head waits for the hold-back window instead.
        assert_eq!(ids(&buffer.release_due(1000.3)), vec!["m1"]);
        buffer.insert(message("late", Some("a"), 99.0), 1001.0);
        assert_eq!(buffer.next_deadline(), Some(1006.0));
    }

    /// Buffer statistics reflect occupancy and ages.
    #[test]
    fn stats() {
        let mut buffer = OrderingBuffer::new(5.0, 10);
        buffer.insert(message("m1", Some("a"), 100.0), 1000.0);
        buffer.insert(message("m2", Some("b"), 200.0), 1001.0);

        let stats = buffer.stats(1002.0);
        assert_eq!(stats.buffer_size, 2);
        assert_eq!(stats.senders, 2);
        assert_eq!(stats.buffered, 2);
        assert_eq!(stats.utilization, 0.2);
        assert_eq!(stats.max_age, 2.0);
        assert_eq!(stats.average_age, 1.5);
        assert_eq!(stats.next_deliverable.len(), 2);
        assert_eq!(stats.next_deliverable[0].msg_id, "m1");
    }
}
