//! The applied message store: the replicated state machine fed by consensus.
//!
//! Applying a committed entry runs the pipeline: timestamp correction, a
//! durable write of the applied record, then insertion into the ordering
//! buffer for per-sender delivery. Applied records are keyed by sequence
//! number with a unique index on message ID for deduplication, and are what
//! the query surface serves.

use crate::encoding::{bincode, keycode, Value as _};
use crate::error::Result;
use crate::ordering::{self, OrderingBuffer};
use crate::raft::{Entry, Index, SendReceipt, State, Term};
use crate::time::{now, Corrector};
use crate::{errdata, storage};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// The default page size for message queries.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// The maximum page size for message queries.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// An applied message record. The durable fields up through original_ts are
/// byte-identical across nodes for a given sequence number; corrected_ts is
/// computed by the applying node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// The cluster-wide sequence number (the log index).
    pub seq: Index,
    /// The term in which the entry was appended.
    pub term: Term,
    /// The unique message ID.
    pub msg_id: String,
    /// The sender, if any.
    pub sender: Option<String>,
    /// The recipient, if any.
    pub recipient: Option<String>,
    /// The message payload.
    pub payload: String,
    /// The client-provided (or leader-stamped) timestamp. Immutable.
    pub original_ts: f64,
    /// The timestamp after clock correction on this node.
    pub corrected_ts: f64,
}

impl crate::encoding::Value for StoredMessage {}

/// A message query: committed messages with seq > after, optionally filtered
/// by sender and recipient, up to limit entries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageQuery {
    pub after: Index,
    pub limit: usize,
    pub sender: Option<String>,
    pub recipient: Option<String>,
}

/// A page of messages with a pagination cursor: pass next_after as the next
/// query's after to continue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<StoredMessage>,
    pub next_after: Index,
}

/// A message store storage key. See the ordering notes on
/// [`crate::encoding::keycode`].
#[derive(Clone, Debug, PartialEq)]
enum Key {
    /// An applied message record, by sequence number.
    Message(Index),
    /// The sequence number holding the given message ID.
    MsgId(String),
    /// The highest applied log index.
    AppliedIndex,
}

impl Key {
    const MESSAGE: u8 = 0x01;
    const MSG_ID: u8 = 0x02;
    const APPLIED_INDEX: u8 = 0x03;

    fn encode(&self) -> Vec<u8> {
        match self {
            Key::Message(seq) => {
                let mut key = Vec::with_capacity(9);
                key.push(Self::MESSAGE);
                key.extend(keycode::encode_u64(*seq));
                key
            }
            Key::MsgId(id) => {
                let mut key = Vec::with_capacity(1 + id.len());
                key.push(Self::MSG_ID);
                key.extend(id.as_bytes());
                key
            }
            Key::AppliedIndex => vec![Self::APPLIED_INDEX],
        }
    }
}

/// The applied message store. Owned and mutated only by the apply loop; all
/// reads are routed through the same owner.
pub struct MessageStore {
    /// The underlying storage engine.
    engine: Box<dyn storage::Engine>,
    /// The timestamp corrector, shared with the time endpoints.
    corrector: Corrector,
    /// The per-sender reorder buffer over corrected timestamps.
    buffer: OrderingBuffer,
    /// The highest applied log index.
    applied_index: Index,
}

impl MessageStore {
    /// Opens a message store on the given engine, recovering the applied
    /// index.
    pub fn new(mut engine: Box<dyn storage::Engine>, corrector: Corrector) -> Result<Self> {
        let applied_index = engine
            .get(&Key::AppliedIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or(0);
        Ok(Self { engine, corrector, buffer: OrderingBuffer::default(), applied_index })
    }

    /// Fetches an applied record by sequence number.
    fn get(&mut self, seq: Index) -> Result<Option<StoredMessage>> {
        self.engine.get(&Key::Message(seq).encode())?.map(|v| StoredMessage::decode(&v)).transpose()
    }
}

impl State for MessageStore {
    fn applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, entry: &Entry) -> Result<SendReceipt> {
        assert_eq!(entry.index, self.applied_index + 1, "entry applied out of order");
        let msg = &entry.message;

        // A duplicate message ID (the leader dedup missed it, e.g. across a
        // leader change) is absorbed: the original record stands.
        if let Some(original) = self.lookup(&msg.msg_id)? {
            debug!("Ignoring duplicate commit of {} at index {}", msg.msg_id, entry.index);
            self.engine.set(&Key::AppliedIndex.encode(), bincode::serialize(&entry.index))?;
            self.engine.flush()?;
            self.applied_index = entry.index;
            return Ok(SendReceipt {
                seq: original.seq,
                msg_id: original.msg_id,
                corrected_ts: original.corrected_ts,
            });
        }

        // Correct the timestamp. A committed entry can't be rejected, so a
        // timestamp that no longer validates is applied with the plain
        // correction and a warning.
        let corrected_ts = match self.corrector.correct(msg.original_ts) {
            Ok(ts) => ts,
            Err(err) => {
                warn!("Applying {} with unvalidated timestamp: {err}", msg.msg_id);
                self.corrector.apply(msg.original_ts)
            }
        };

        let stored = StoredMessage {
            seq: entry.index,
            term: entry.term,
            msg_id: msg.msg_id.clone(),
            sender: msg.sender.clone(),
            recipient: msg.recipient.clone(),
            payload: msg.payload.clone(),
            original_ts: msg.original_ts,
            corrected_ts,
        };

        // Persist the applied record, its dedup index entry, and the applied
        // position together, then hand the message to the ordering buffer.
        self.engine.set(&Key::Message(stored.seq).encode(), stored.encode())?;
        self.engine.set(&Key::MsgId(stored.msg_id.clone()).encode(), bincode::serialize(&stored.seq))?;
        self.engine.set(&Key::AppliedIndex.encode(), bincode::serialize(&entry.index))?;
        self.engine.flush()?;
        self.applied_index = entry.index;

        self.buffer.insert(stored.clone(), now());

        Ok(SendReceipt { seq: stored.seq, msg_id: stored.msg_id, corrected_ts })
    }

    fn correct(&self, ts: f64) -> Result<f64> {
        self.corrector.correct(ts)
    }

    fn lookup(&mut self, msg_id: &str) -> Result<Option<StoredMessage>> {
        let Some(seq) = self
            .engine
            .get(&Key::MsgId(msg_id.to_string()).encode())?
            .map(|v| bincode::deserialize::<Index>(&v))
            .transpose()?
        else {
            return Ok(None);
        };
        match self.get(seq)? {
            Some(stored) => Ok(Some(stored)),
            None => errdata!("message index for {msg_id} points at missing seq {seq}"),
        }
    }

    fn scan(&mut self, query: &MessageQuery) -> Result<MessagePage> {
        let limit = match query.limit {
            0 => DEFAULT_QUERY_LIMIT,
            limit => limit.min(MAX_QUERY_LIMIT),
        };
        let range = (
            std::ops::Bound::Excluded(Key::Message(query.after).encode()),
            std::ops::Bound::Included(Key::Message(Index::MAX).encode()),
        );

        let mut messages = Vec::new();
        let mut next_after = query.after;
        let mut iter = self.engine.scan_dyn(range);
        while let Some((_, value)) = iter.next().transpose()? {
            let stored = StoredMessage::decode(&value)?;
            // The cursor advances over skipped records too, so a filtered
            // page never stalls.
            next_after = stored.seq;
            if let Some(sender) = &query.sender {
                if stored.sender.as_ref() != Some(sender) {
                    continue;
                }
            }
            if let Some(recipient) = &query.recipient {
                if stored.recipient.as_ref() != Some(recipient) {
                    continue;
                }
            }
            messages.push(stored);
            if messages.len() >= limit {
                break;
            }
        }
        Ok(MessagePage { messages, next_after })
    }

    fn ordering_status(&self) -> ordering::Stats {
        self.buffer.stats(now())
    }

    fn ordering_tick(&mut self) -> Result<usize> {
        let released = self.buffer.release_due(now());
        for message in &released {
            debug!(
                "Delivered {} from {} at corrected {}",
                message.msg_id,
                message.sender.as_deref().unwrap_or("<anonymous>"),
                message.corrected_ts
            );
        }
        Ok(released.len())
    }

    fn ordering_deadline(&self) -> Option<f64> {
        self.buffer.next_deadline()
    }

    fn force_delivery(&mut self) -> Result<usize> {
        let released = self.buffer.force_release(now());
        Ok(released.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Message;
    use crate::storage::Memory;
    use crate::time::{Clock, SyncOptions};

    fn setup() -> MessageStore {
        let corrector = Corrector::new(Clock::new(SyncOptions::default()));
        MessageStore::new(Box::new(Memory::new()), corrector).unwrap()
    }

    fn entry(index: Index, msg_id: &str, sender: Option<&str>) -> Entry {
        Entry {
            index,
            term: 1,
            message: Message {
                msg_id: msg_id.to_string(),
                sender: sender.map(|s| s.to_string()),
                recipient: Some("all".to_string()),
                payload: format!("payload-{msg_id}"),
                original_ts: now(),
            },
        }
    }

    /// Applying a message persists it, indexes it by ID, and returns a
    /// receipt with the corrected timestamp.
    #[test]
    fn apply_and_lookup() {
        let mut store = setup();
        let receipt = store.apply(&entry(1, "m1", Some("a"))).unwrap();
        assert_eq!(receipt.seq, 1);
        assert_eq!(receipt.msg_id, "m1");
        assert_eq!(store.applied_index(), 1);

        let stored = store.lookup("m1").unwrap().unwrap();
        assert_eq!(stored.seq, 1);
        assert_eq!(stored.payload, "payload-m1");
        assert_eq!(stored.corrected_ts, receipt.corrected_ts);
        assert!(store.lookup("m2").unwrap().is_none());
    }

    /// A duplicate message ID in a later entry is absorbed, returning the
    /// original receipt.
    #[test]
    fn apply_duplicate() {
        let mut store = setup();
        let first = store.apply(&entry(1, "dup", Some("a"))).unwrap();
        let second = store.apply(&entry(2, "dup", Some("b"))).unwrap();
        assert_eq!(second.seq, first.seq);
        assert_eq!(store.applied_index(), 2);

        let page = store.scan(&MessageQuery::default()).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].msg_id, "dup");
    }

    #[test]
    #[should_panic(expected = "applied out of order")]
    fn apply_gap() {
        let mut store = setup();
        let _ = store.apply(&entry(2, "m1", None));
    }

    /// Queries paginate in sequence order and filter by sender/recipient.
    #[test]
    fn scan_filters() {
        let mut store = setup();
        store.apply(&entry(1, "m1", Some("a"))).unwrap();
        store.apply(&entry(2, "m2", Some("b"))).unwrap();
        store.apply(&entry(3, "m3", Some("a"))).unwrap();
        store.apply(&entry(4, "m4", None)).unwrap();

        // Unfiltered, in sequence order.
        let page = store.scan(&MessageQuery::default()).unwrap();
        assert_eq!(page.messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(page.next_after, 4);

        // Paginated.
        let page = store
            .scan(&MessageQuery { limit: 2, ..MessageQuery::default() })
            .unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.next_after, 2);
        let page = store
            .scan(&MessageQuery { after: page.next_after, limit: 2, ..MessageQuery::default() })
            .unwrap();
        assert_eq!(page.messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3, 4]);

        // Filtered by sender.
        let page = store
            .scan(&MessageQuery { sender: Some("a".to_string()), ..MessageQuery::default() })
            .unwrap();
        assert_eq!(page.messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 3]);

        // Filtered by recipient matches all test messages.
        let page = store
            .scan(&MessageQuery { recipient: Some("all".to_string()), ..MessageQuery::default() })
            .unwrap();
        assert_eq!(page.messages.len(), 4);
    }

    /// The applied index survives reopening the store on the same engine.
    #[test]
    fn reopen() {
        let mut store = setup();
        store.apply(&entry(1, "m1", Some("a"))).unwrap();
        store.apply(&entry(2, "m2", Some("a"))).unwrap();

        let engine = std::mem::replace(&mut store.engine, Box::new(Memory::new()));
        let corrector = Corrector::new(Clock::new(SyncOptions::default()));
        let mut store = MessageStore::new(engine, corrector).unwrap();
        assert_eq!(store.applied_index(), 2);
        assert_eq!(store.lookup("m1").unwrap().unwrap().seq, 1);
    }

    /// Applied messages flow into the ordering buffer and are released by
    /// the ordering tick.
    #[test]
    fn ordering_flow() {
        let mut store = setup();
        store.apply(&entry(1, "m1", Some("a"))).unwrap();

        assert_eq!(store.ordering_status().buffer_size, 1);
        assert!(store.ordering_deadline().is_some());
        assert_eq!(store.ordering_tick().unwrap(), 1);
        assert_eq!(store.ordering_status().buffer_size, 0);
    }

    /// Force delivery flushes the buffer immediately.
    #[test]
    fn force_delivery() {
        let mut store = setup();
        store.apply(&entry(1, "m1", Some("a"))).unwrap();
        store.apply(&entry(2, "m2", Some("a"))).unwrap();
        assert_eq!(store.force_delivery().unwrap(), 2);
        assert_eq!(store.ordering_status().forced, 2);
    }
}
