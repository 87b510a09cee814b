use super::{Message, NodeId, Term};
use crate::encoding::{bincode, keycode, Value as _};
use crate::error::Result;
use crate::{errdata, storage};

use serde::{Deserialize, Serialize};

/// A log index. Starts at 1, 0 indicates no index. Committed entries keep
/// their index as the message's cluster-wide sequence number.
pub type Index = u64;

/// A log entry: a message wrapped with the term in which the leader appended
/// it and the index that becomes the message's sequence number on commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was appended.
    pub term: Term,
    /// The replicated message.
    pub message: Message,
}

impl crate::encoding::Value for Entry {}

/// A log storage key. Encoded with a tag byte followed by any components,
/// such that entries order by index.
#[derive(Clone, Debug, PartialEq)]
pub enum Key {
    /// A log entry, by index.
    Entry(Index),
    /// The current term and vote (if any).
    TermVote,
    /// The current commit index and term (if any).
    CommitIndex,
}

impl Key {
    const ENTRY: u8 = 0x01;
    const TERM_VOTE: u8 = 0x02;
    const COMMIT_INDEX: u8 = 0x03;

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Key::Entry(index) => {
                let mut key = Vec::with_capacity(9);
                key.push(Self::ENTRY);
                key.extend(keycode::encode_u64(*index));
                key
            }
            Key::TermVote => vec![Self::TERM_VOTE],
            Key::CommitIndex => vec![Self::COMMIT_INDEX],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (tag, rest) = keycode::take_tag(bytes)?;
        match (tag, rest.len()) {
            (Self::ENTRY, 8) => Ok(Key::Entry(keycode::take_u64(rest)?.0)),
            (Self::TERM_VOTE, 0) => Ok(Key::TermVote),
            (Self::COMMIT_INDEX, 0) => Ok(Key::CommitIndex),
            (tag, len) => errdata!("invalid log key tag {tag} with {len} trailing bytes"),
        }
    }
}

/// The replicated message log. Stores a sequence of entries replicated across
/// nodes and applied in order to the message store, along with the persistent
/// consensus metadata (current term and vote) that must survive restarts.
///
/// In the steady state the log is append-only: the leader appends a client
/// message via [`Log::append`] and replicates it to followers who append via
/// [`Log::splice`]. Once an index is replicated to a majority it is
/// committed, making the prefix immutable. Uncommitted entries can be
/// replaced if a new leader was elected and wrote different entries to the
/// same indexes; splice truncates the conflicting tail before appending.
///
/// Invariants:
///
/// * Entry indexes are contiguous starting at 1 (no gaps).
/// * Entry terms never decrease from the previous entry, and never exceed the
///   current term.
/// * Appended and spliced entries are durable (flushed) before the node
///   responds to the RPC that caused them, as are term and vote changes.
/// * Committed entries are never changed or removed.
pub struct Log {
    /// The underlying storage engine. A trait object so the engine can be
    /// selected at startup without propagating generics through consensus.
    pub(crate) engine: Box<dyn storage::Engine>,
    /// The current term.
    term: Term,
    /// Our vote in the current term, if any.
    vote: Option<NodeId>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
}

impl Log {
    /// Initializes a log using the given storage engine, recovering the
    /// persisted term, vote, and entry/commit positions.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        use std::ops::Bound::Included;
        let (term, vote) = engine
            .get(&Key::TermVote.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let (last_index, last_term) = engine
            .scan_dyn((
                Included(Key::Entry(0).encode()),
                Included(Key::Entry(u64::MAX).encode()),
            ))
            .last()
            .transpose()?
            .map(|(_, v)| Entry::decode(&v))
            .transpose()?
            .map(|e| (e.index, e.term))
            .unwrap_or((0, 0));
        let (commit_index, commit_term) = engine
            .get(&Key::CommitIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));
        Ok(Self { engine, term, vote, last_index, last_term, commit_index, commit_term })
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeId>) {
        (self.term, self.vote.clone())
    }

    /// Stores the current term and cast vote (if any), flushed to durable
    /// storage before returning. Enforces that the term does not regress and
    /// that we only vote for one node per term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeId>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(
            term > self.term || self.vote.is_none() || vote == self.vote,
            "can't change vote in term {term}"
        );
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.engine.set(&Key::TermVote.encode(), bincode::serialize(&(term, &vote)))?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a message to the log at the current term and flushes it to
    /// durable storage, returning its index.
    pub fn append(&mut self, message: Message) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry { index: self.last_index + 1, term: self.term, message };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index. The commit index is
    /// not flushed: it is recoverable from a quorum of logs, and the entries
    /// themselves are already durable.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        let term = match self.get(index)? {
            Some(e) if e.index < self.commit_index => {
                panic!("commit index regression {} → {}", self.commit_index, e.index);
            }
            Some(e) if e.index == self.commit_index => return Ok(index),
            Some(e) => e.term,
            None => panic!("commit index {index} does not exist"),
        };
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term)))?;
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist.
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        // Fast path against the last entry, the common case when followers
        // process appends and heartbeats.
        if index == 0 || index > self.last_index {
            return Ok(false);
        }
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(true);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Returns an iterator over log entries in the given index range.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator {
        use std::ops::Bound;
        let from = match range.start_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
        };
        let to = match range.end_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
        };
        Iterator::new(self.engine.scan_dyn((from, to)))
    }

    /// Returns an iterator over entries that are ready to apply: after the
    /// given applied index, up to and including the commit index.
    pub fn scan_apply(&mut self, applied_index: Index) -> Iterator {
        // NB: don't assert that commit_index >= applied_index. The commit
        // index is not durable, so a restarted node may lag its own applied
        // index until the leader's heartbeats re-advance it.
        if applied_index >= self.commit_index {
            return Iterator::new(Box::new(std::iter::empty()));
        }
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Splices a set of entries into the log and flushes them to durable
    /// storage. The entries must be contiguous with equal or increasing
    /// terms, and the first entry must connect to the existing log. Entries
    /// already present with matching terms are ignored; a conflicting entry
    /// truncates the existing log from that index before the new entries are
    /// written. Never touches the committed prefix.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index); // empty input is a noop
        };

        // Check that the entries are well-formed.
        if first.index == 0 || first.term == 0 {
            panic!("spliced entry has index or term 0");
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            panic!("spliced entries are not contiguous");
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            panic!("spliced entries have term regression");
        }

        // Check that the entries connect to the existing log, without term
        // regression across the base.
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);
        match self.get(first.index - 1)? {
            Some(base) if first.term < base.term => {
                panic!("splice term regression {} → {}", base.term, first.term)
            }
            Some(_) => {}
            None if first.index == 1 => {}
            None => panic!("first index {} must touch existing log", first.index),
        }

        // Skip entries that are already in the log.
        let mut entries = entries.as_slice();
        let mut scan = self.scan(first.index..=last.index);
        while let Some(entry) = scan.next().transpose()? {
            assert_eq!(entry.index, entries[0].index, "index mismatch at {entry:?}");
            if entry.term != entries[0].term {
                break;
            }
            assert_eq!(entry.message, entries[0].message, "message mismatch at {entry:?}");
            entries = &entries[1..];
        }
        drop(scan);

        // If all entries already exist, we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Write the entries that weren't already in the log, and remove the
        // tail of the old log if any. Can't write below the commit index,
        // since those entries are immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");

        for entry in entries {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        }
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;

        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    /// Flushes the underlying engine to durable storage. Writes are already
    /// flushed individually; this is a final barrier on shutdown.
    pub fn flush(&mut self) -> Result<()> {
        self.engine.flush()
    }

    /// Returns log storage engine status.
    pub fn status(&mut self) -> Result<storage::Status> {
        self.engine.status()
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: Box<dyn storage::ScanIterator + 'a>,
}

impl<'a> Iterator<'a> {
    fn new(inner: Box<dyn storage::ScanIterator + 'a>) -> Self {
        Self { inner }
    }
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}
