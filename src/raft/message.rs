use super::{Entry, Index, NodeId, Term};
use crate::storage;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A client message replicated through the log. These are the durable fields
/// agreed on by consensus: entries with the same sequence number are
/// byte-identical across nodes. The corrected timestamp is computed by each
/// applying node and lives in the applied store, not here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// A stable unique message ID, client-provided or server-generated.
    /// Commits are deduplicated on it.
    pub msg_id: String,
    /// The sender, if any. Anonymous messages share an ordering bucket.
    #[serde(default)]
    pub sender: Option<String>,
    /// The recipient, if any.
    #[serde(default)]
    pub recipient: Option<String>,
    /// The message payload.
    pub payload: String,
    /// The client's wall-clock timestamp in Unix seconds, or the leader's if
    /// the client did not provide one. Immutable after commit.
    pub original_ts: f64,
}

/// A RequestVote RPC, broadcast by candidates when campaigning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's term.
    pub term: Term,
    /// The candidate's node ID.
    pub candidate_id: NodeId,
    /// The candidate's base URL, used as a leader hint if it wins.
    pub candidate_url: String,
    /// The index of the candidate's last log entry.
    pub last_log_index: Index,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// The response to a RequestVote RPC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The responder's current term, for the candidate to update itself.
    pub term: Term,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}

/// An AppendEntries RPC, sent by leaders to replicate log entries. Sent
/// periodically even when empty, as a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// The leader's term.
    pub term: Term,
    /// The leader's node ID.
    pub leader_id: NodeId,
    /// The leader's base URL, used for client redirects.
    pub leader_url: String,
    /// The index of the log entry immediately preceding the new entries.
    pub prev_log_index: Index,
    /// The term of the log entry immediately preceding the new entries.
    pub prev_log_term: Term,
    /// The entries to replicate. Empty for heartbeats.
    #[serde(default)]
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: Index,
}

/// The response to an AppendEntries RPC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// The responder's current term, for the leader to update itself.
    pub term: Term,
    /// Whether the entries were accepted.
    pub success: bool,
    /// On success, the index of the last log entry known to match the
    /// leader's log.
    #[serde(default)]
    pub match_index: Index,
    /// On failure, a hint for where the leader should resume replication:
    /// the rejected base index, lowered to just past the local log when the
    /// log is shorter.
    #[serde(default)]
    pub conflict_index: Index,
}

/// An outbound RPC request emitted by the node, addressed to a peer. The
/// server's per-peer sender tasks deliver these over HTTP and step the
/// responses back into the node.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// The recipient node ID.
    pub to: NodeId,
    /// The request to deliver.
    pub request: PeerRequest,
}

/// An outbound RPC request payload.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerRequest {
    Vote(VoteRequest),
    Append(AppendRequest),
}

/// The commit receipt returned to a client for an accepted message. In async
/// replication mode the corrected timestamp is the estimate at append time;
/// in quorum mode it is the value computed when the entry was applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// The cluster-wide sequence number assigned to the message.
    pub seq: Index,
    /// The message ID, echoing a client-provided ID or carrying a generated
    /// one.
    pub msg_id: String,
    /// The corrected timestamp.
    pub corrected_ts: f64,
}

/// A snapshot of the node's consensus state, for the status endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// This node's ID.
    pub node_id: NodeId,
    /// The current role: follower, candidate, or leader.
    pub role: String,
    /// The current term.
    pub term: Term,
    /// The current leader's node ID, if known.
    pub leader_id: Option<NodeId>,
    /// The current leader's base URL, if known.
    pub leader_url: Option<String>,
    /// The index of the last log entry.
    pub last_index: Index,
    /// The highest index known to be committed.
    pub commit_index: Index,
    /// The highest index applied to the message store.
    pub applied_index: Index,
    /// Replication progress per peer (leaders only, including self).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_index: Option<BTreeMap<NodeId, Index>>,
    /// Log storage engine status.
    pub storage: storage::Status,
}
