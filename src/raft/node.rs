use super::{
    AppendRequest, AppendResponse, Entry, Envelope, Index, Log, Message, PeerRequest, SendReceipt,
    State, Status, VoteRequest, VoteResponse,
};
use super::MAX_CATCHUP_BATCH;
use crate::errinput;
use crate::error::{Error, Result};
use crate::ordering;
use crate::store::{MessagePage, MessageQuery};

use itertools::Itertools as _;
use log::{debug, info, warn};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};

/// A node identifier, stable across restarts.
pub type NodeId = String;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as a number of ticks.
pub type Ticks = u8;

/// The reply channel for a client write, completed with a commit receipt or
/// an error.
pub type ReplyTx = oneshot::Sender<Result<SendReceipt>>;

/// The replication dispatch policy for client writes, selected at startup.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Acknowledge the client as soon as the leader's own append is durable.
    /// Followers catch up via normal replication, and the entry commits when
    /// they do.
    Async,
    /// Block the client until the entry is committed and a configured quorum
    /// of nodes have matched it, within a bounded wait.
    SyncQuorum,
}

impl std::str::FromStr for ReplicationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "async" => Ok(Self::Async),
            "sync_quorum" => Ok(Self::SyncQuorum),
            s => errinput!("invalid replication mode {s}"),
        }
    }
}

/// Node options.
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// Maximum number of entries in a single AppendEntries request.
    pub max_append_entries: usize,
    /// The replication dispatch policy for client writes.
    pub mode: ReplicationMode,
    /// The ack quorum for sync_quorum writes. None means a strict majority.
    /// Commit advancement always requires a majority regardless.
    pub quorum: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            election_timeout_range: super::ELECTION_TIMEOUT_RANGE,
            max_append_entries: super::MAX_APPEND_ENTRIES,
            mode: ReplicationMode::Async,
            quorum: None,
        }
    }
}

/// A node with a dynamic role. The node is driven synchronously by the
/// server's event loop: inbound RPCs are handled via request_vote() and
/// append_entries() which return the response directly, responses to our own
/// outbound RPCs are stepped via step_vote_response() and
/// step_append_response(), and time advances via tick(). These methods
/// consume the current node and return a new one with a possibly different
/// role. Outbound requests are emitted as envelopes on the node_tx channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.tick()?.
pub enum Node {
    Follower(RawNode<Follower>),
    Candidate(RawNode<Candidate>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new node, starting as a leaderless follower, or leader if
    /// there are no peers.
    pub fn new(
        id: NodeId,
        url: String,
        peers: HashMap<NodeId, String>,
        log: Log,
        state: Box<dyn State>,
        node_tx: mpsc::UnboundedSender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        if let Some(quorum) = opts.quorum {
            if quorum < 1 || quorum > peers.len() + 1 {
                return errinput!("quorum {quorum} outside cluster size {}", peers.len() + 1);
            }
        }
        let node = RawNode::new(id, url, peers, log, state, node_tx, opts)?;
        if node.peers.is_empty() {
            // If there are no peers, campaign and become leader immediately.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> &NodeId {
        match self {
            Node::Follower(n) => &n.id,
            Node::Candidate(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Follower(n) => n.term(),
            Node::Candidate(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Follower(n) => n.tick(),
            Node::Candidate(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }

    /// Handles an inbound RequestVote RPC, returning the response.
    pub fn request_vote(self, req: VoteRequest) -> Result<(Self, VoteResponse)> {
        let term = self.term();
        // Reject requests from past terms, echoing our own.
        if req.term < term {
            debug!("Rejecting vote for {} in past term {}", req.candidate_id, req.term);
            return Ok((self, VoteResponse { term, vote_granted: false }));
        }
        // A request from a future term moves us into it as a leaderless
        // follower. Only followers grant votes: candidates and leaders have
        // already voted for themselves in their term.
        let node = if req.term > term { self.into_leaderless_follower(req.term)? } else { self };
        match node {
            Node::Follower(n) => {
                let (n, resp) = n.grant_vote(req)?;
                Ok((n.into(), resp))
            }
            node => {
                let term = node.term();
                Ok((node, VoteResponse { term, vote_granted: false }))
            }
        }
    }

    /// Handles an inbound AppendEntries RPC (possibly an empty heartbeat),
    /// returning the response.
    pub fn append_entries(self, req: AppendRequest) -> Result<(Self, AppendResponse)> {
        let term = self.term();
        // Reject requests from past terms, echoing our own.
        if req.term < term {
            debug!("Rejecting append from {} in past term {}", req.leader_id, req.term);
            let resp = AppendResponse { term, success: false, match_index: 0, conflict_index: 0 };
            return Ok((self, resp));
        }
        // A valid append in an equal or future term establishes the leader;
        // follow it and try to match its log.
        let mut node = match self {
            Node::Follower(n) => n.follow(req.term, &req.leader_id, &req.leader_url)?,
            Node::Candidate(n) => {
                n.into_follower(req.term, Some((req.leader_id.clone(), req.leader_url.clone())))?
            }
            Node::Leader(n) => {
                assert!(req.term > term, "saw other leader {} in term {}", req.leader_id, term);
                n.into_follower(req.term)?.follow(req.term, &req.leader_id, &req.leader_url)?
            }
        };
        let resp = node.accept_entries(req)?;
        Ok((node.into(), resp))
    }

    /// Steps a response to one of our own RequestVote RPCs.
    pub fn step_vote_response(self, from: NodeId, resp: VoteResponse) -> Result<Self> {
        if resp.term > self.term() {
            return self.into_leaderless_follower(resp.term);
        }
        match self {
            Node::Candidate(n) if resp.vote_granted && resp.term == n.term() => {
                n.receive_vote(from)
            }
            node => Ok(node),
        }
    }

    /// Steps a response to one of our own AppendEntries RPCs.
    pub fn step_append_response(self, from: NodeId, resp: AppendResponse) -> Result<Self> {
        if resp.term > self.term() {
            return self.into_leaderless_follower(resp.term);
        }
        match self {
            Node::Leader(n) if resp.term == n.term() => n.receive_append_response(from, resp),
            node => Ok(node),
        }
    }

    /// Submits a client message for replication. Leaders append and
    /// replicate it, replying according to the replication mode; other roles
    /// fail the request with a redirect hint or a retryable abort.
    pub fn submit(self, msg: Message, tx: ReplyTx) -> Result<Self> {
        match self {
            Node::Leader(mut n) => {
                n.submit(msg, tx)?;
                Ok(n.into())
            }
            Node::Follower(n) => {
                let leader = n.role.leader.as_ref().map(|(_, url)| url.clone());
                let _ = tx.send(Err(Error::NotLeader { leader }));
                Ok(n.into())
            }
            Node::Candidate(n) => {
                // Election in progress; the client must retry.
                let _ = tx.send(Err(Error::Abort));
                Ok(n.into())
            }
        }
    }

    /// Ingests a batch of committed entries fetched from a peer during
    /// catch-up. Leaders ignore these; they are authoritative. The batch must
    /// connect to the local log with contiguous indexes and non-decreasing
    /// terms, and was committed on the serving peer, so it is safe to commit
    /// locally once spliced.
    pub fn catch_up(self, peer_term: Term, entries: Vec<Entry>) -> Result<Self> {
        if matches!(self, Node::Leader(_)) || entries.is_empty() {
            return Ok(self);
        }
        let node = if peer_term > self.term() {
            self.into_leaderless_follower(peer_term)?
        } else {
            self
        };
        let mut node = node;
        {
            let (log, state) = node.raw_parts();
            let (commit_index, _) = log.get_commit_index();
            let first = entries.first().expect("checked non-empty");
            let last = entries.last().expect("checked non-empty");

            // Validate continuity before touching the log. Any mismatch is
            // left for normal replication to repair.
            let contiguous = entries.windows(2).all(|w| w[0].index + 1 == w[1].index);
            let terms_ok = entries.windows(2).all(|w| w[0].term <= w[1].term);
            if first.index != commit_index + 1
                || !contiguous
                || !terms_ok
                || last.term > log.get_term().0
            {
                warn!(
                    "Ignoring catch-up batch {}..{} (local commit {})",
                    first.index, last.index, commit_index
                );
                return Ok(node);
            }
            let last_index = last.index;
            log.splice(entries)?;
            log.commit(last_index)?;
            Self::apply_ready(log, state)?;
            info!("Caught up to committed index {last_index}");
        }
        Ok(node)
    }

    /// Queries applied messages.
    pub fn query(&mut self, query: &MessageQuery) -> Result<MessagePage> {
        let (_, state) = self.raw_parts();
        state.scan(query)
    }

    /// Returns the highest index known committed.
    pub fn commit_index(&mut self) -> Index {
        self.raw_parts().0.get_commit_index().0
    }

    /// Flushes the log to durable storage, as a final barrier on shutdown.
    pub fn flush(&mut self) -> Result<()> {
        self.raw_parts().0.flush()
    }

    /// Returns committed entries after the given index, for catch-up pulls.
    pub fn sync_entries(&mut self, after: Index) -> Result<Vec<Entry>> {
        let (log, _) = self.raw_parts();
        let (commit_index, _) = log.get_commit_index();
        if after >= commit_index {
            return Ok(Vec::new());
        }
        log.scan(after + 1..=commit_index).take(MAX_CATCHUP_BATCH).collect()
    }

    /// Returns a snapshot of the ordering buffer state.
    pub fn ordering_status(&self) -> ordering::Stats {
        self.raw_state().ordering_status()
    }

    /// Releases due ordering-buffer entries, returning the release count.
    pub fn ordering_tick(&mut self) -> Result<usize> {
        let (_, state) = self.raw_parts();
        state.ordering_tick()
    }

    /// Returns the next ordering-buffer deadline, if any.
    pub fn ordering_deadline(&self) -> Option<f64> {
        self.raw_state().ordering_deadline()
    }

    /// Force-releases all buffered entries, returning the release count.
    pub fn force_delivery(&mut self) -> Result<usize> {
        let (_, state) = self.raw_parts();
        state.force_delivery()
    }

    /// Returns a status snapshot of the consensus state.
    pub fn status(&mut self) -> Result<Status> {
        let (role, leader_id, leader_url, match_index) = match &self {
            Node::Follower(n) => (
                "follower",
                n.role.leader.as_ref().map(|(id, _)| id.clone()),
                n.role.leader.as_ref().map(|(_, url)| url.clone()),
                None,
            ),
            Node::Candidate(_) => ("candidate", None, None, None),
            Node::Leader(n) => {
                let mut match_index: BTreeMap<NodeId, Index> = n
                    .role
                    .progress
                    .iter()
                    .map(|(id, p)| (id.clone(), p.match_index))
                    .collect();
                match_index.insert(n.id.clone(), n.log.get_last_index().0);
                (
                    "leader",
                    Some(n.id.clone()),
                    Some(n.url.clone()),
                    Some(match_index),
                )
            }
        };
        let role = role.to_string();
        let node_id = self.id().clone();
        let term = self.term();
        let applied_index = self.raw_state().applied_index();
        let (log, _) = self.raw_parts();
        let (last_index, _) = log.get_last_index();
        let (commit_index, _) = log.get_commit_index();
        let storage = log.status()?;
        Ok(Status {
            node_id,
            role,
            term,
            leader_id,
            leader_url,
            last_index,
            commit_index,
            applied_index,
            match_index,
            storage,
        })
    }

    /// Returns mutable references to the log and state machine.
    fn raw_parts(&mut self) -> (&mut Log, &mut dyn State) {
        match self {
            Node::Follower(n) => (&mut n.log, n.state.as_mut()),
            Node::Candidate(n) => (&mut n.log, n.state.as_mut()),
            Node::Leader(n) => (&mut n.log, n.state.as_mut()),
        }
    }

    /// Returns a reference to the state machine.
    fn raw_state(&self) -> &dyn State {
        match self {
            Node::Follower(n) => n.state.as_ref(),
            Node::Candidate(n) => n.state.as_ref(),
            Node::Leader(n) => n.state.as_ref(),
        }
    }

    /// Steps into a new term as a leaderless follower, regardless of role.
    fn into_leaderless_follower(self, term: Term) -> Result<Self> {
        assert!(term > self.term(), "term regression {} → {}", self.term(), term);
        match self {
            Node::Follower(mut n) => {
                info!("Discovered new term {term}");
                n.log.set_term(term, None)?;
                n.role = Follower::new(None, n.gen_election_timeout());
                Ok(n.into())
            }
            Node::Candidate(n) => Ok(n.into_follower(term, None)?.into()),
            Node::Leader(n) => Ok(n.into_follower(term)?.into()),
        }
    }

    /// Applies any newly committed entries to the state machine, discarding
    /// the receipts (used by non-leaders, which have no waiting clients).
    fn apply_ready(log: &mut Log, state: &mut dyn State) -> Result<()> {
        let mut iter = log.scan_apply(state.applied_index());
        while let Some(entry) = iter.next().transpose()? {
            debug!("Applying {entry:?}");
            state.apply(&entry)?;
        }
        Ok(())
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A node role: follower, candidate, or leader.
pub trait Role {}

/// A node with the concrete role R, implementing the typestate pattern:
/// role-specific logic lives on RawNode<ConcreteRole>, and transitions
/// consume the node and return one with the new role.
pub struct RawNode<R = Follower> {
    id: NodeId,
    url: String,
    peers: HashMap<NodeId, String>,
    log: Log,
    state: Box<dyn State>,
    node_tx: mpsc::UnboundedSender<Envelope>,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            url: self.url,
            peers: self.peers,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            role,
        }
    }

    /// Returns the node's current term. Convenience wrapper for the log.
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// Returns the cluster size as a number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the ack quorum for sync_quorum writes: the configured quorum,
    /// or a strict majority by default.
    fn ack_quorum(&self) -> usize {
        self.opts.quorum.unwrap_or_else(|| self.quorum_size())
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The slice must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends an RPC request to a peer.
    fn send(&self, to: &NodeId, request: PeerRequest) -> Result<()> {
        debug!("Sending to {to}: {request:?}");
        Ok(self.node_tx.send(Envelope { to: to.clone(), request })?)
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Applies any newly committed entries, discarding receipts.
    fn maybe_apply(&mut self) -> Result<()> {
        Node::apply_ready(&mut self.log, self.state.as_mut())
    }
}

/// A follower replicates state from a leader.
pub struct Follower {
    /// The leader's ID and base URL, or None if just initialized.
    leader: Option<(NodeId, String)>,
    /// The number of ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    election_timeout: Ticks,
}

impl Follower {
    fn new(leader: Option<(NodeId, String)>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    fn new(
        id: NodeId,
        url: String,
        peers: HashMap<NodeId, String>,
        log: Log,
        state: Box<dyn State>,
        node_tx: mpsc::UnboundedSender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let role = Follower::new(None, 0);
        let mut node = Self { id, url, peers, log, state, node_tx, opts, role };
        node.role.election_timeout = node.gen_election_timeout();
        Ok(node)
    }

    /// Records the leader for the current (possibly new) term and resets the
    /// election timer. Called when receiving a valid AppendEntries.
    fn follow(mut self, term: Term, leader_id: &NodeId, leader_url: &str) -> Result<Self> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);
        if term > self.term() {
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, self.gen_election_timeout());
        }
        match &self.role.leader {
            Some((id, _)) => assert_eq!(id, leader_id, "multiple leaders in term"),
            None => {
                info!("Following leader {leader_id} in term {term}");
                self.role.leader = Some((leader_id.clone(), leader_url.to_string()));
            }
        }
        self.role.leader_seen = 0;
        Ok(self)
    }

    /// Attempts to match the leader's log and append new entries, advancing
    /// the local commit index and applying entries when the leader's commit
    /// index allows.
    fn accept_entries(&mut self, req: AppendRequest) -> Result<AppendResponse> {
        if let Some(first) = req.entries.first() {
            assert_eq!(req.prev_log_index, first.index - 1, "base index mismatch");
        }
        let term = self.term();

        // The previous entry must match our log, otherwise reject with a
        // hint of where to resume: the rejected base, or just past our log
        // end when we're missing everything in between.
        if req.prev_log_index > 0 && !self.log.has(req.prev_log_index, req.prev_log_term)? {
            let (last_index, _) = self.log.get_last_index();
            let conflict_index = std::cmp::min(req.prev_log_index, last_index + 1);
            debug!("Rejecting entries at base {}, conflict {}", req.prev_log_index, conflict_index);
            return Ok(AppendResponse { term, success: false, match_index: 0, conflict_index });
        }

        // Append the entries, truncating any conflicting tail, and advance
        // the commit index to what we can now verify against the leader.
        let match_index = req.entries.last().map(|e| e.index).unwrap_or(req.prev_log_index);
        self.log.splice(req.entries)?;
        let new_commit = std::cmp::min(req.leader_commit, match_index);
        if new_commit > self.log.get_commit_index().0 {
            self.log.commit(new_commit)?;
            self.maybe_apply()?;
        }
        Ok(AppendResponse { term, success: true, match_index, conflict_index: 0 })
    }

    /// Votes for a candidate in our current term, unless we already voted
    /// for someone else or our log is more up-to-date than the candidate's.
    fn grant_vote(mut self, req: VoteRequest) -> Result<(Self, VoteResponse)> {
        let term = self.term();
        assert_eq!(req.term, term, "vote request term mismatch");
        let reject = VoteResponse { term, vote_granted: false };

        if let (_, Some(vote)) = self.log.get_term() {
            if vote != req.candidate_id {
                return Ok((self, reject));
            }
        }
        let (last_index, last_term) = self.log.get_last_index();
        if last_term > req.last_log_term
            || (last_term == req.last_log_term && last_index > req.last_log_index)
        {
            return Ok((self, reject));
        }

        info!("Voting for {} in term {} election", req.candidate_id, term);
        self.log.set_term(term, Some(req.candidate_id.clone()))?;
        self.role.leader_seen = 0; // granted votes reset the election timer
        Ok((self, VoteResponse { term, vote_granted: true }))
    }

    /// Processes a logical clock tick, campaigning if the leader has gone
    /// quiet for an election timeout.
    fn tick(mut self) -> Result<Node> {
        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            return Ok(self.into_candidate()?.into());
        }
        Ok(self.into())
    }

    /// Transitions the follower into a candidate, campaigning for leadership
    /// in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Apply any pending entries, so we're caught up if we win.
        self.maybe_apply()?;
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }
}

/// A candidate is campaigning to become leader.
pub struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<NodeId>,
    /// Ticks elapsed since the election started.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Campaigns for leadership by bumping the term, voting for ourself, and
    /// soliciting votes from all peers.
    fn campaign(&mut self) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id.clone());
        self.log.set_term(term, Some(self.id.clone()))?;

        let (last_log_index, last_log_term) = self.log.get_last_index();
        let req = VoteRequest {
            term,
            candidate_id: self.id.clone(),
            candidate_url: self.url.clone(),
            last_log_index,
            last_log_term,
        };
        for peer in self.peers.keys().cloned().sorted() {
            self.send(&peer, PeerRequest::Vote(req.clone()))?;
        }
        Ok(())
    }

    /// Records a granted vote, assuming leadership on reaching quorum.
    fn receive_vote(mut self, from: NodeId) -> Result<Node> {
        self.role.votes.insert(from);
        if self.role.votes.len() >= self.quorum_size() {
            return Ok(self.into_leader()?.into());
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick, starting a new election round if this
    /// one timed out (e.g. a split vote).
    fn tick(mut self) -> Result<Node> {
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Transitions the candidate to a follower: we either lost the election
    /// to the given leader, or discovered a new term.
    fn into_follower(
        mut self,
        term: Term,
        leader: Option<(NodeId, String)>,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);
        let election_timeout = self.gen_election_timeout();
        if term > self.term() {
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
        }
        if let Some((id, _)) = &leader {
            info!("Lost election, following leader {id} in term {term}");
        }
        Ok(self.into_role(Follower::new(leader, election_timeout)))
    }

    /// Transitions the candidate to leader: we won the election.
    fn into_leader(mut self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let (last_index, _) = self.log.get_last_index();
        let peers: Vec<NodeId> = self.peers.keys().cloned().collect();

        // Rebuild the in-flight message ID index from unapplied entries, so
        // duplicate submissions are caught before appending a second entry.
        let applied = self.state.applied_index();
        let msg_index: HashMap<String, Index> = self
            .log
            .scan(applied + 1..)
            .map(|r| r.map(|e| (e.message.msg_id, e.index)))
            .collect::<Result<_>>()?;

        let mut node = self.into_role(Leader::new(peers, last_index, msg_index));

        // Announce leadership with an empty AppendEntries. Entries from
        // previous terms are committed indirectly, once a write in this term
        // commits.
        node.heartbeat()?;
        Ok(node)
    }
}

/// Follower replication progress, tracked by the leader.
struct Progress {
    /// The next index to replicate to the follower.
    next_index: Index,
    /// The last index where the follower's log is known to match the leader.
    match_index: Index,
}

impl Progress {
    /// Attempts to advance the follower's match index, returning true if it
    /// did. next_index is advanced past it but never regressed here.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Regresses the next index to the given index if it's currently
    /// greater. Can't regress below match_index + 1. Returns true on change.
    fn regress_next(&mut self, next_index: Index) -> bool {
        if next_index >= self.next_index || self.next_index <= self.match_index + 1 {
            return false;
        }
        self.next_index = std::cmp::max(next_index, self.match_index + 1);
        true
    }
}

/// A client write waiting on replication, keyed by its log index.
struct PendingWrite {
    /// Reply channels for clients waiting on this index. Multiple clients
    /// can wait on one index via duplicate message IDs.
    txs: Vec<ReplyTx>,
    /// The commit receipt, filled in when the entry is applied.
    receipt: Option<SendReceipt>,
}

/// A leader serves requests and replicates its log to followers.
pub struct Leader {
    /// Follower replication progress.
    progress: HashMap<NodeId, Progress>,
    /// Client writes waiting for the sync_quorum condition, by log index.
    /// Aborted if we lose leadership.
    writes: BTreeMap<Index, PendingWrite>,
    /// In-flight (unapplied) message IDs by log index, for deduplication
    /// before append.
    msg_index: HashMap<String, Index>,
    /// Number of ticks since the last heartbeat.
    since_heartbeat: Ticks,
}

impl Leader {
    fn new(peers: Vec<NodeId>, last_index: Index, msg_index: HashMap<String, Index>) -> Self {
        let next_index = last_index + 1;
        let progress = peers
            .into_iter()
            .map(|p| (p, Progress { next_index, match_index: 0 }))
            .collect();
        Self { progress, writes: BTreeMap::new(), msg_index, since_heartbeat: 0 }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Processes a logical clock tick, sending periodic heartbeats.
    fn tick(mut self) -> Result<Node> {
        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }

    /// Sends an AppendEntries to every peer, with any entries pending for
    /// it. An empty append doubles as both heartbeat and log probe.
    fn heartbeat(&mut self) -> Result<()> {
        for peer in self.peers.keys().cloned().sorted() {
            self.maybe_send_append(&peer, true)?;
        }
        Ok(())
    }

    /// Accepts a client message: deduplicates it, validates its timestamp,
    /// appends and replicates it, and replies according to the replication
    /// mode.
    fn submit(&mut self, msg: Message, tx: ReplyTx) -> Result<()> {
        // A message ID that already committed returns the original receipt.
        if let Some(stored) = self.state.lookup(&msg.msg_id)? {
            debug!("Duplicate message {} of seq {}", msg.msg_id, stored.seq);
            let _ = tx.send(Ok(SendReceipt {
                seq: stored.seq,
                msg_id: stored.msg_id,
                corrected_ts: stored.corrected_ts,
            }));
            return Ok(());
        }

        // A message ID already in flight attaches to the pending entry.
        if let Some(&index) = self.role.msg_index.get(&msg.msg_id) {
            debug!("Duplicate message {} in flight at index {index}", msg.msg_id);
            match self.opts.mode {
                ReplicationMode::Async => {
                    let result = self.state.correct(msg.original_ts).map(|corrected_ts| {
                        SendReceipt { seq: index, msg_id: msg.msg_id, corrected_ts }
                    });
                    let _ = tx.send(result);
                }
                ReplicationMode::SyncQuorum => {
                    self.role
                        .writes
                        .entry(index)
                        .or_insert_with(|| PendingWrite { txs: Vec::new(), receipt: None })
                        .txs
                        .push(tx);
                }
            }
            return Ok(());
        }

        // Validate the timestamp before appending; future-dated input is
        // surfaced as a recoverable error, never clamped.
        let corrected_ts = match self.state.correct(msg.original_ts) {
            Ok(ts) => ts,
            Err(err) => {
                let _ = tx.send(Err(err));
                return Ok(());
            }
        };

        let msg_id = msg.msg_id.clone();
        let index = self.propose(msg)?;
        self.role.msg_index.insert(msg_id.clone(), index);
        match self.opts.mode {
            // Async: the local durable append is enough to acknowledge. The
            // corrected timestamp is the current estimate; the apply pipeline
            // recomputes it authoritatively.
            ReplicationMode::Async => {
                let _ = tx.send(Ok(SendReceipt { seq: index, msg_id, corrected_ts }));
            }
            // Sync: park the reply until the commit and ack quorum arrive.
            ReplicationMode::SyncQuorum => {
                self.role.writes.insert(index, PendingWrite { txs: vec![tx], receipt: None });
            }
        }

        // A single-node cluster commits immediately.
        if self.peers.is_empty() {
            self.maybe_commit_and_apply()?;
            self.try_release_writes()?;
        }
        Ok(())
    }

    /// Proposes an entry by appending it to the log and eagerly replicating
    /// it to peers in steady state.
    fn propose(&mut self, message: Message) -> Result<Index> {
        let index = self.log.append(message)?;
        for peer in self.peers.keys().cloned().sorted() {
            // Only send eagerly if the peer is in steady state (we've sent
            // everything before this entry); lagging peers are caught up by
            // heartbeats and response-driven sends.
            if self.role.progress.get(&peer).expect("unknown peer").next_index == index {
                self.maybe_send_append(&peer, false)?;
            }
        }
        Ok(index)
    }

    /// Handles an AppendEntries response from a follower, advancing
    /// replication progress and the commit index, or backing off after a
    /// rejection.
    fn receive_append_response(mut self, from: NodeId, resp: AppendResponse) -> Result<Node> {
        let (last_index, _) = self.log.get_last_index();
        let progress = self.role.progress.get_mut(&from).expect("unknown peer");

        if resp.success {
            // Don't trust a match index beyond our own log.
            let match_index = std::cmp::min(resp.match_index, last_index);
            if progress.advance(match_index) {
                self.maybe_commit_and_apply()?;
                self.try_release_writes()?;
            }
            // Keep shipping any remaining entries to a lagging peer.
            self.maybe_send_append(&from, false)?;
        } else {
            // The follower rejected the base entry; back off and retry from
            // its conflict hint. Stale rejections below the match index are
            // ignored.
            if progress.regress_next(resp.conflict_index) {
                debug!("Backing off next_index for {from} to {}", resp.conflict_index);
                self.maybe_send_append(&from, false)?;
            }
        }
        Ok(self.into())
    }

    /// Sends pending log entries to a peer from its next index. When
    /// heartbeat is true, sends even when there is nothing pending, which
    /// both asserts leadership and probes the follower's log position.
    fn maybe_send_append(&mut self, peer: &NodeId, heartbeat: bool) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let (commit_index, _) = self.log.get_commit_index();
        let progress = self.role.progress.get(peer).expect("unknown peer");
        let next = progress.next_index;
        assert_ne!(next, 0, "invalid next_index");
        assert!(next > progress.match_index, "next_index at or below match_index");
        assert!(next <= last_index + 1, "next_index beyond log end");

        if next > last_index && !heartbeat {
            return Ok(()); // nothing pending
        }

        let prev_log_index = next - 1;
        let prev_log_term = match prev_log_index {
            0 => 0,
            i => self.log.get(i)?.expect("missing base entry").term,
        };
        let entries: Vec<Entry> =
            self.log.scan(next..).take(self.opts.max_append_entries).collect::<Result<_>>()?;

        // Optimistically assume the entries will be accepted, to avoid
        // resending them before the response arrives. A rejection or
        // heartbeat probe will regress next_index if they were lost.
        if let Some(last) = entries.last() {
            let progress = self.role.progress.get_mut(peer).expect("unknown peer");
            progress.next_index = last.index + 1;
        }

        debug!("Replicating {} entries with base {prev_log_index} to {peer}", entries.len());
        self.send(
            peer,
            PeerRequest::Append(AppendRequest {
                term: self.term(),
                leader_id: self.id.clone(),
                leader_url: self.url.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            }),
        )
    }

    /// Commits any new entries replicated to a majority, and applies them to
    /// the message store, filling in receipts for waiting writes.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // Determine the highest index replicated to a majority.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.get_last_index().0))
                .collect(),
        );

        // The quorum value may regress after a leader change initializes
        // progress at 0, so don't assert it advances.
        let (mut commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }

        // Only entries from our own term can be committed directly (figure 8
        // in the Raft paper); earlier entries commit with them.
        commit_index = match self.log.get(quorum_index)? {
            Some(entry) if entry.term == self.term() => quorum_index,
            Some(_) => return Ok(commit_index),
            None => panic!("missing entry at quorum index {quorum_index}"),
        };
        self.log.commit(commit_index)?;

        // Apply the newly committed entries, recording receipts for client
        // writes waiting on them.
        let mut receipts = Vec::new();
        let mut iter = self.log.scan_apply(self.state.applied_index());
        while let Some(entry) = iter.next().transpose()? {
            debug!("Applying {entry:?}");
            let receipt = self.state.apply(&entry)?;
            receipts.push((entry.index, entry.message.msg_id, receipt));
        }
        drop(iter);
        for (index, msg_id, receipt) in receipts {
            self.role.msg_index.remove(&msg_id);
            if let Some(write) = self.role.writes.get_mut(&index) {
                write.receipt = Some(receipt);
            }
        }
        Ok(commit_index)
    }

    /// Completes pending sync_quorum writes whose entry is both committed
    /// (applied, with a receipt) and acknowledged by the configured quorum.
    fn try_release_writes(&mut self) -> Result<()> {
        let ack_quorum = self.ack_quorum();
        let (commit_index, _) = self.log.get_commit_index();
        let ready: Vec<Index> = self
            .role
            .writes
            .iter()
            .take_while(|(index, _)| **index <= commit_index)
            .filter(|(index, write)| write.receipt.is_some() && self.acks(**index) >= ack_quorum)
            .map(|(index, _)| *index)
            .collect();
        for index in ready {
            let write = self.role.writes.remove(&index).expect("write must exist");
            let receipt = write.receipt.expect("checked receipt");
            for tx in write.txs {
                let _ = tx.send(Ok(receipt.clone()));
            }
        }
        Ok(())
    }

    /// Returns the number of nodes (including self) with a match index at or
    /// above the given index.
    fn acks(&self, index: Index) -> usize {
        1 + self.role.progress.values().filter(|p| p.match_index >= index).count()
    }

    /// Transitions the leader into a leaderless follower after discovering a
    /// new term, aborting all in-flight client writes.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in a later term");
        info!("Discovered new term {term}, stepping down");

        for (_, write) in std::mem::take(&mut self.role.writes) {
            for tx in write.txs {
                let _ = tx.send(Err(Error::Abort));
            }
        }

        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::test::Mock;
    use super::*;
    use crate::storage::Memory;

    use test_case::test_case;
    use tokio::sync::mpsc::error::TryRecvError;

    /// A test node with captured outbound requests.
    struct Harness {
        node: Option<Node>,
        rx: mpsc::UnboundedReceiver<Envelope>,
    }

    impl Harness {
        fn new(id: &str, peers: &[&str], opts: Options) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let log = Log::new(Box::new(Memory::new())).unwrap();
            let peers = peers
                .iter()
                .map(|p| (p.to_string(), format!("http://{p}")))
                .collect();
            let node = Node::new(
                id.to_string(),
                format!("http://{id}"),
                peers,
                log,
                Mock::new(),
                tx,
                opts,
            )
            .unwrap();
            Self { node: Some(node), rx }
        }

        fn node(&mut self) -> Node {
            self.node.take().expect("node taken")
        }

        fn put(&mut self, node: Node) {
            self.node = Some(node);
        }

        fn tick(&mut self) {
            let node = self.node().tick().unwrap();
            self.put(node);
        }

        /// Ticks until the node becomes a candidate (election timeout).
        fn tick_to_candidate(&mut self) {
            for _ in 0..10 {
                self.tick();
                if matches!(self.node.as_ref().unwrap(), Node::Candidate(_)) {
                    return;
                }
            }
            panic!("node never became candidate");
        }

        fn drain(&mut self) -> Vec<Envelope> {
            let mut envelopes = Vec::new();
            loop {
                match self.rx.try_recv() {
                    Ok(env) => envelopes.push(env),
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => return envelopes,
                }
            }
        }

        fn role(&self) -> &'static str {
            match self.node.as_ref().unwrap() {
                Node::Follower(_) => "follower",
                Node::Candidate(_) => "candidate",
                Node::Leader(_) => "leader",
            }
        }
    }

    fn message(id: &str, ts: f64) -> Message {
        Message {
            msg_id: id.to_string(),
            sender: Some("a".to_string()),
            recipient: None,
            payload: format!("payload-{id}"),
            original_ts: ts,
        }
    }

    /// Quorum sizes must be strict majorities.
    #[test_case(1 => 1)]
    #[test_case(2 => 2)]
    #[test_case(3 => 2)]
    #[test_case(4 => 3)]
    #[test_case(5 => 3)]
    fn quorum_size(size: usize) -> usize {
        let peers: Vec<String> = (2..=size).map(|i| format!("n{i}")).collect();
        let peer_refs: Vec<&str> = peers.iter().map(|s| s.as_str()).collect();
        let mut harness = Harness::new("n1", &peer_refs, Options::default());
        match harness.node() {
            Node::Follower(n) => n.quorum_size(),
            Node::Leader(n) => n.quorum_size(), // single-node cluster
            Node::Candidate(n) => n.quorum_size(),
        }
    }

    /// A node with no peers becomes leader immediately and commits writes
    /// on its own.
    #[test]
    fn single_node_leader() {
        let mut harness = Harness::new("n1", &[], Options::default());
        assert_eq!(harness.role(), "leader");

        let (tx, mut rx) = oneshot::channel();
        let node = harness.node().submit(message("m1", 100.0), tx).unwrap();
        harness.put(node);
        let receipt = rx.try_recv().unwrap().unwrap();
        assert_eq!(receipt.seq, 1);
        assert_eq!(receipt.msg_id, "m1");
    }

    /// An election timeout turns a follower into a candidate that solicits
    /// votes, and a vote quorum makes it leader.
    #[test]
    fn election() {
        let mut harness = Harness::new("n1", &["n2", "n3"], Options::default());
        assert_eq!(harness.role(), "follower");

        harness.tick_to_candidate();
        let requests = harness.drain();
        assert_eq!(requests.len(), 2);
        let PeerRequest::Vote(req) = &requests[0].request else {
            panic!("expected vote request");
        };
        assert_eq!(req.term, 1);
        assert_eq!(req.candidate_id, "n1");

        // One vote (plus our own) is a quorum of 3.
        let node = harness
            .node()
            .step_vote_response(
                "n2".to_string(),
                VoteResponse { term: 1, vote_granted: true },
            )
            .unwrap();
        harness.put(node);
        assert_eq!(harness.role(), "leader");

        // The new leader announces itself with empty appends.
        let requests = harness.drain();
        assert!(requests
            .iter()
            .all(|e| matches!(e.request, PeerRequest::Append(_))));
        assert!(!requests.is_empty());
    }

    /// A denied vote does not advance towards leadership, and a response
    /// with a later term steps the candidate down.
    #[test]
    fn election_denied() {
        let mut harness = Harness::new("n1", &["n2", "n3"], Options::default());
        harness.tick_to_candidate();
        harness.drain();

        let node = harness
            .node()
            .step_vote_response(
                "n2".to_string(),
                VoteResponse { term: 1, vote_granted: false },
            )
            .unwrap();
        harness.put(node);
        assert_eq!(harness.role(), "candidate");

        let node = harness
            .node()
            .step_vote_response(
                "n3".to_string(),
                VoteResponse { term: 5, vote_granted: false },
            )
            .unwrap();
        harness.put(node);
        assert_eq!(harness.role(), "follower");
        assert_eq!(harness.node.as_ref().unwrap().term(), 5);
    }

    /// Votes are granted at most once per term, and only to candidates with
    /// an up-to-date log.
    #[test]
    fn vote_rules() {
        let mut harness = Harness::new("n1", &["n2", "n3"], Options::default());

        let req = |term, candidate: &str, last_index, last_term| VoteRequest {
            term,
            candidate_id: candidate.to_string(),
            candidate_url: format!("http://{candidate}"),
            last_log_index: last_index,
            last_log_term: last_term,
        };

        // Grant a first vote.
        let (node, resp) = harness.node().request_vote(req(1, "n2", 0, 0)).unwrap();
        assert!(resp.vote_granted);

        // Deny another candidate in the same term.
        let (node, resp) = node.request_vote(req(1, "n3", 0, 0)).unwrap();
        assert!(!resp.vote_granted);

        // Re-grant the same candidate in the same term (idempotent).
        let (node, resp) = node.request_vote(req(1, "n2", 0, 0)).unwrap();
        assert!(resp.vote_granted);

        // A new term allows a new vote.
        let (node, resp) = node.request_vote(req(2, "n3", 0, 0)).unwrap();
        assert!(resp.vote_granted);

        // A stale term is rejected and echoes our term.
        let (_, resp) = node.request_vote(req(1, "n2", 0, 0)).unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 2);
    }

    /// Candidates with stale logs are denied votes.
    #[test]
    fn vote_log_check() {
        let mut harness = Harness::new("n1", &["n2", "n3"], Options::default());

        // Give the local log two entries at term 1.
        let (mut node, resp) = harness
            .node()
            .append_entries(AppendRequest {
                term: 1,
                leader_id: "n2".to_string(),
                leader_url: "http://n2".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![
                    Entry { index: 1, term: 1, message: message("a", 1.0) },
                    Entry { index: 2, term: 1, message: message("b", 2.0) },
                ],
                leader_commit: 0,
            })
            .unwrap();
        assert!(resp.success);

        // A candidate with a shorter log at the same term is denied.
        let req = VoteRequest {
            term: 2,
            candidate_id: "n3".to_string(),
            candidate_url: "http://n3".to_string(),
            last_log_index: 1,
            last_log_term: 1,
        };
        let (n, resp) = node.request_vote(req.clone()).unwrap();
        node = n;
        assert!(!resp.vote_granted);

        // A candidate with a higher last term is granted.
        let (_, resp) = node
            .request_vote(VoteRequest { last_log_index: 1, last_log_term: 2, term: 3, ..req })
            .unwrap();
        assert!(resp.vote_granted);
    }

    /// Followers append entries, reject mismatched bases with a conflict
    /// hint, and advance their commit index from the leader's.
    #[test]
    fn follower_append() {
        let mut harness = Harness::new("n1", &["n2", "n3"], Options::default());

        let append = |entries, prev_log_index, prev_log_term, leader_commit| AppendRequest {
            term: 1,
            leader_id: "n2".to_string(),
            leader_url: "http://n2".to_string(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };

        // An append with a missing base is rejected with a conflict hint
        // lowered to just past our (empty) log.
        let (node, resp) = harness
            .node()
            .append_entries(append(vec![], 5, 1, 0))
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 1);

        // Appending from an empty base succeeds.
        let entries = vec![
            Entry { index: 1, term: 1, message: message("a", 1.0) },
            Entry { index: 2, term: 1, message: message("b", 2.0) },
        ];
        let (node, resp) = node.append_entries(append(entries, 0, 0, 1)).unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);

        // The leader's commit index applied entry 1.
        let mut node = node;
        let status = node.status().unwrap();
        assert_eq!(status.commit_index, 1);
        assert_eq!(status.applied_index, 1);
        assert_eq!(status.leader_id.as_deref(), Some("n2"));

        // An empty heartbeat at the matching base advances the commit index.
        let (mut node, resp) = node.append_entries(append(vec![], 2, 1, 2)).unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(node.status().unwrap().applied_index, 2);
    }

    /// The leader advances its commit index once a majority matches, and
    /// completes sync_quorum writes only then.
    #[test]
    fn leader_commit_quorum() {
        let opts = Options { mode: ReplicationMode::SyncQuorum, ..Options::default() };
        let mut harness = Harness::new("n1", &["n2", "n3"], opts);
        harness.tick_to_candidate();
        let node = harness
            .node()
            .step_vote_response(
                "n2".to_string(),
                VoteResponse { term: 1, vote_granted: true },
            )
            .unwrap();
        harness.put(node);
        assert_eq!(harness.role(), "leader");
        harness.drain();

        // Submit a write; it parks until the quorum acks.
        let (tx, mut rx) = oneshot::channel();
        let node = harness.node().submit(message("m1", 100.0), tx).unwrap();
        harness.put(node);
        assert!(rx.try_recv().is_err());

        // One follower acking the entry forms a majority of 3: the write
        // completes.
        let node = harness
            .node()
            .step_append_response(
                "n2".to_string(),
                AppendResponse { term: 1, success: true, match_index: 1, conflict_index: 0 },
            )
            .unwrap();
        harness.put(node);
        let receipt = rx.try_recv().unwrap().unwrap();
        assert_eq!(receipt.seq, 1);
        assert_eq!(receipt.msg_id, "m1");

        let mut node = harness.node();
        let status = node.status().unwrap();
        assert_eq!(status.commit_index, 1);
        harness.put(node);
    }

    /// Async mode acknowledges immediately after the leader's own append.
    #[test]
    fn leader_async_ack() {
        let mut harness = Harness::new("n1", &["n2", "n3"], Options::default());
        harness.tick_to_candidate();
        let node = harness
            .node()
            .step_vote_response(
                "n2".to_string(),
                VoteResponse { term: 1, vote_granted: true },
            )
            .unwrap();
        harness.put(node);
        harness.drain();

        let (tx, mut rx) = oneshot::channel();
        let node = harness.node().submit(message("m1", 100.0), tx).unwrap();
        harness.put(node);
        let receipt = rx.try_recv().unwrap().unwrap();
        assert_eq!(receipt.seq, 1);
    }

    /// Duplicate message IDs return the original sequence number, both in
    /// flight and after commit.
    #[test]
    fn dedup() {
        let mut harness = Harness::new("n1", &[], Options::default());

        let (tx, mut rx) = oneshot::channel();
        let node = harness.node().submit(message("dup", 100.0), tx).unwrap();
        let seq = rx.try_recv().unwrap().unwrap().seq;

        let (tx, mut rx) = oneshot::channel();
        let node = node.submit(message("dup", 200.0), tx).unwrap();
        let receipt = rx.try_recv().unwrap().unwrap();
        assert_eq!(receipt.seq, seq);

        // Only one applied entry carries the message.
        let mut node = node;
        let page = node
            .query(&MessageQuery { after: 0, limit: 10, sender: None, recipient: None })
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].msg_id, "dup");
        harness.put(node);
    }

    /// A follower submit fails with a redirect hint once a leader is known.
    #[test]
    fn follower_redirect() {
        let mut harness = Harness::new("n1", &["n2", "n3"], Options::default());

        // No leader known yet.
        let (tx, mut rx) = oneshot::channel();
        let node = harness.node().submit(message("m1", 100.0), tx).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Err(Error::NotLeader { leader: None }));

        // Learn the leader via a heartbeat.
        let (node, _) = node
            .append_entries(AppendRequest {
                term: 1,
                leader_id: "n2".to_string(),
                leader_url: "http://n2".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();

        let (tx, mut rx) = oneshot::channel();
        let node = node.submit(message("m1", 100.0), tx).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(Error::NotLeader { leader: Some("http://n2".to_string()) })
        );
        harness.put(node);
    }

    /// A leader steps down on seeing a higher term, aborting pending writes.
    #[test]
    fn leader_step_down() {
        let opts = Options { mode: ReplicationMode::SyncQuorum, ..Options::default() };
        let mut harness = Harness::new("n1", &["n2", "n3"], opts);
        harness.tick_to_candidate();
        let node = harness
            .node()
            .step_vote_response(
                "n2".to_string(),
                VoteResponse { term: 1, vote_granted: true },
            )
            .unwrap();
        harness.put(node);
        harness.drain();

        let (tx, mut rx) = oneshot::channel();
        let node = harness.node().submit(message("m1", 100.0), tx).unwrap();

        // A higher-term append response steps the leader down and aborts the
        // pending write.
        let node = node
            .step_append_response(
                "n2".to_string(),
                AppendResponse { term: 3, success: false, match_index: 0, conflict_index: 0 },
            )
            .unwrap();
        harness.put(node);
        assert_eq!(harness.role(), "follower");
        assert_eq!(rx.try_recv().unwrap(), Err(Error::Abort));
    }

    /// Catch-up splices and commits a contiguous batch of committed entries,
    /// and ignores batches that do not connect to the local log.
    #[test]
    fn catch_up() {
        let mut harness = Harness::new("n1", &["n2", "n3"], Options::default());

        // A gap batch is ignored.
        let entries = vec![Entry { index: 5, term: 1, message: message("x", 1.0) }];
        let mut node = harness.node().catch_up(1, entries).unwrap();
        assert_eq!(node.status().unwrap().commit_index, 0);

        // A connected batch is spliced, committed, and applied.
        let entries = vec![
            Entry { index: 1, term: 1, message: message("a", 1.0) },
            Entry { index: 2, term: 1, message: message("b", 2.0) },
        ];
        let mut node = node.catch_up(1, entries).unwrap();
        let status = node.status().unwrap();
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.applied_index, 2);
        assert_eq!(status.term, 1);
        harness.put(node);
    }

    /// An invalid configured quorum is rejected at construction.
    #[test]
    fn invalid_quorum() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let log = Log::new(Box::new(Memory::new())).unwrap();
        let result = Node::new(
            "n1".to_string(),
            "http://n1".to_string(),
            [("n2".to_string(), "http://n2".to_string())].into(),
            log,
            Mock::new(),
            tx,
            Options { quorum: Some(3), ..Options::default() },
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
