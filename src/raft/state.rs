use super::{Entry, Index, SendReceipt};
use crate::error::Result;
use crate::ordering;
use crate::store::{MessagePage, MessageQuery, StoredMessage};

/// The replicated state machine: the applied message store fed by consensus.
///
/// Committed entries are applied exactly once per node, in index order, by
/// the single-threaded apply loop. The implementation runs the apply
/// pipeline: timestamp correction, durable write, ordering-buffer insert.
/// Errors from apply are fatal, since nodes must not diverge on applied
/// state.
pub trait State: Send {
    /// Returns the highest applied entry index, or 0 if none.
    fn applied_index(&self) -> Index;

    /// Applies a committed entry, returning its commit receipt. A
    /// deduplicated message returns the receipt of its original commit, so
    /// waiting clients observe the first one.
    fn apply(&mut self, entry: &Entry) -> Result<SendReceipt>;

    /// Validates and corrects a raw timestamp against the cluster clock.
    /// Rejects implausible timestamps with a recoverable error.
    fn correct(&self, ts: f64) -> Result<f64>;

    /// Looks up an applied message by its message ID, for deduplication.
    fn lookup(&mut self, msg_id: &str) -> Result<Option<StoredMessage>>;

    /// Queries applied messages with filters and pagination.
    fn scan(&mut self, query: &MessageQuery) -> Result<MessagePage>;

    /// Returns a snapshot of the ordering buffer state.
    fn ordering_status(&self) -> ordering::Stats;

    /// Releases any ordering-buffer entries whose constraints are satisfied,
    /// returning the number released.
    fn ordering_tick(&mut self) -> Result<usize>;

    /// Returns the next ordering-buffer release deadline as a Unix timestamp,
    /// if any entries are buffered.
    fn ordering_deadline(&self) -> Option<f64>;

    /// Force-releases all buffered entries in per-sender timestamp order,
    /// ignoring the hold-back window. Returns the number released.
    fn force_delivery(&mut self) -> Result<usize>;
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::errinput;

    /// A state machine test double that records applied entries in memory
    /// and corrects timestamps with a fixed offset.
    pub struct Mock {
        pub applied: Vec<Entry>,
        pub offset: f64,
    }

    impl Mock {
        pub fn new() -> Box<Self> {
            Box::new(Self { applied: Vec::new(), offset: 0.0 })
        }

        fn stored(&self, entry: &Entry) -> StoredMessage {
            let m = &entry.message;
            StoredMessage {
                seq: entry.index,
                term: entry.term,
                msg_id: m.msg_id.clone(),
                sender: m.sender.clone(),
                recipient: m.recipient.clone(),
                payload: m.payload.clone(),
                original_ts: m.original_ts,
                corrected_ts: m.original_ts + self.offset,
            }
        }
    }

    impl State for Mock {
        fn applied_index(&self) -> Index {
            self.applied.last().map(|e| e.index).unwrap_or(0)
        }

        fn apply(&mut self, entry: &Entry) -> Result<SendReceipt> {
            assert_eq!(entry.index, self.applied_index() + 1, "apply gap");
            self.applied.push(entry.clone());
            Ok(SendReceipt {
                seq: entry.index,
                msg_id: entry.message.msg_id.clone(),
                corrected_ts: entry.message.original_ts + self.offset,
            })
        }

        fn correct(&self, ts: f64) -> Result<f64> {
            if ts < 0.0 {
                return errinput!("timestamp is negative");
            }
            Ok(ts + self.offset)
        }

        fn lookup(&mut self, msg_id: &str) -> Result<Option<StoredMessage>> {
            Ok(self
                .applied
                .iter()
                .find(|e| e.message.msg_id == msg_id)
                .map(|e| self.stored(e)))
        }

        fn scan(&mut self, query: &MessageQuery) -> Result<MessagePage> {
            let messages: Vec<_> = self
                .applied
                .iter()
                .filter(|e| e.index > query.after)
                .map(|e| self.stored(e))
                .take(query.limit)
                .collect();
            let next_after = messages.last().map(|m| m.seq).unwrap_or(query.after);
            Ok(MessagePage { messages, next_after })
        }

        fn ordering_status(&self) -> ordering::Stats {
            ordering::Stats::default()
        }

        fn ordering_tick(&mut self) -> Result<usize> {
            Ok(0)
        }

        fn ordering_deadline(&self) -> Option<f64> {
            None
        }

        fn force_delivery(&mut self) -> Result<usize> {
            Ok(0)
        }
    }
}
