//! The consensus module: a Raft-style single-leader replicated log of
//! messages, with leader election, log replication, and commit advancement.
//!
//! Time is measured in logical ticks; the server drives [`Node::tick`] at a
//! fixed interval (see the server module). All inter-node RPCs are
//! request/response pairs carried as JSON over HTTP by the server; the node
//! itself only sees typed messages.

mod log;
mod message;
mod node;
mod state;

pub use self::log::{Entry, Index, Log};
pub use message::{
    AppendRequest, AppendResponse, Envelope, Message, PeerRequest, SendReceipt, Status,
    VoteRequest, VoteResponse,
};
pub use node::{Node, NodeId, Options, ReplicationMode, ReplyTx, Term, Ticks};
pub use state::State;

/// The number of ticks between leader heartbeats (empty AppendEntries).
pub const HEARTBEAT_INTERVAL: Ticks = 2;

/// The range of randomized election timeouts for followers and candidates,
/// in ticks. With 100 ms ticks this is the 300-600 ms window.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 3..7;

/// The maximum number of entries shipped in a single AppendEntries request.
pub const MAX_APPEND_ENTRIES: usize = 64;

/// The maximum number of committed entries returned per catch-up batch.
pub const MAX_CATCHUP_BATCH: usize = 1024;
