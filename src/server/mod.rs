//! The node runtime: wires the consensus node, message store, failure
//! detector, time synchronization, and catch-up together, drives the node
//! from a single event-loop task, and serves the HTTP surface.
//!
//! The consensus node and message store are owned exclusively by the event
//! loop; HTTP handlers and background tasks communicate with them through
//! channels, with oneshot reply channels for request/response flows. No IO
//! happens while node state is being mutated.

mod catchup;
mod detector;
mod http;
mod peer;

pub use detector::{Detector, PeerHealth};

use crate::error::Result;
use crate::ordering;
use crate::raft::{
    self, AppendRequest, AppendResponse, Entry, Envelope, Index, Node, NodeId, Options,
    PeerRequest, ReplicationMode, ReplyTx, Status, Term, VoteRequest, VoteResponse,
};
use crate::storage;
use crate::store::{MessagePage, MessageQuery, MessageStore};
use crate::time::{Clock, CorrectionStats, Corrector, SyncOptions, TimeStats};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// The duration of a node tick, the unit of time for elections and
/// heartbeats.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// The deadline for outbound consensus RPCs. Kept below the election
/// timeout so a slow peer can't stall an election round.
const RPC_TIMEOUT: Duration = Duration::from_millis(250);

/// The fallback ordering-buffer poll interval when no deadline is pending.
const ORDERING_FALLBACK: Duration = Duration::from_millis(250);

/// The outbound send-queue capacity per peer. Requests beyond this are
/// discarded; consensus retries on later ticks.
const PEER_QUEUE_SIZE: usize = 64;

/// Node runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The node ID, unique within the cluster.
    pub id: NodeId,
    /// The node's advertised base URL, used in redirects and leader hints.
    pub url: String,
    /// Peer base URLs.
    pub peers: Vec<String>,
    /// The replication dispatch policy.
    pub mode: ReplicationMode,
    /// The sync_quorum ack quorum. None means a strict majority.
    pub quorum: Option<usize>,
    /// How long a sync_quorum send may wait for its quorum.
    pub send_timeout: Duration,
    /// The failure detector probe interval.
    pub probe_interval: Duration,
    /// Time synchronization options.
    pub sync: SyncOptions,
}

impl Config {
    pub fn new(id: impl Into<NodeId>, url: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            peers,
            mode: ReplicationMode::Async,
            quorum: None,
            send_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(5),
            sync: SyncOptions::default(),
        }
    }
}

/// An inbound consensus RPC with its reply channel.
pub enum RpcRequest {
    Vote(VoteRequest, oneshot::Sender<VoteResponse>),
    Append(AppendRequest, oneshot::Sender<AppendResponse>),
}

/// A response to one of our own outbound consensus RPCs.
pub enum PeerReply {
    Vote { from: NodeId, resp: VoteResponse },
    Append { from: NodeId, resp: AppendResponse },
}

/// A client-facing request routed through the event loop.
pub enum ClientRequest {
    /// Submit a message for replication.
    Send { message: raft::Message, tx: ReplyTx },
    /// Query applied messages.
    Query { query: MessageQuery, tx: oneshot::Sender<Result<MessagePage>> },
    /// Fetch the full node status.
    Status { tx: oneshot::Sender<Result<NodeStatus>> },
    /// Fetch committed entries after the given index, for catch-up pulls.
    SyncEntries { after: Index, tx: oneshot::Sender<Result<SyncResponse>> },
    /// Ingest pre-formed committed entries, for catch-up pushes and pulls.
    Replicate { term: Term, entries: Vec<Entry>, tx: oneshot::Sender<Result<Index>> },
    /// Snapshot the ordering buffer.
    OrderingStatus { tx: oneshot::Sender<ordering::Stats> },
    /// Force-release all buffered messages.
    ForceDelivery { tx: oneshot::Sender<Result<usize>> },
}

/// The full node status, served by the status endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Consensus state.
    #[serde(flatten)]
    pub raft: Status,
    /// The node's advertised URL.
    pub url: String,
    /// The replication dispatch policy.
    pub replication_mode: ReplicationMode,
    /// The effective sync_quorum ack quorum.
    pub quorum: usize,
    /// Peer health, keyed by peer URL.
    pub peers: BTreeMap<String, PeerHealth>,
    /// Time synchronization snapshot.
    pub time: TimeStats,
    /// Timestamp correction statistics.
    pub correction: CorrectionStats,
    /// Ordering buffer snapshot.
    pub ordering: ordering::Stats,
}

/// The response to a catch-up sync request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    /// The serving node's current term.
    pub term: Term,
    /// Committed entries after the requested index.
    pub entries: Vec<Entry>,
    /// The serving node's commit index.
    pub commit_index: Index,
}

/// A chronolog server node.
pub struct Server {
    config: Config,
    node: Node,
    node_rx: mpsc::UnboundedReceiver<Envelope>,
    client_tx: mpsc::UnboundedSender<ClientRequest>,
    client_rx: mpsc::UnboundedReceiver<ClientRequest>,
    rpc_tx: mpsc::UnboundedSender<RpcRequest>,
    rpc_rx: mpsc::UnboundedReceiver<RpcRequest>,
    clock: Clock,
    corrector: Corrector,
    detector: Arc<Detector>,
    client: reqwest::Client,
}

impl Server {
    /// Creates a new server node on the given storage engines: one for the
    /// consensus log, one for the applied message store. Both normally live
    /// under the node's single data directory.
    pub fn new(
        config: Config,
        log_engine: Box<dyn storage::Engine>,
        state_engine: Box<dyn storage::Engine>,
    ) -> Result<Self> {
        let clock = Clock::new(config.sync.clone());
        let corrector = Corrector::new(clock.clone());
        let state = MessageStore::new(state_engine, corrector.clone())?;
        let log = raft::Log::new(log_engine)?;

        let (node_tx, node_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();

        // Peers are identified by their base URL throughout the runtime.
        let peers: HashMap<NodeId, String> =
            config.peers.iter().map(|p| (p.clone(), p.clone())).collect();
        let opts = Options { mode: config.mode, quorum: config.quorum, ..Options::default() };
        let node = Node::new(
            config.id.clone(),
            config.url.clone(),
            peers,
            log,
            Box::new(state),
            node_tx,
            opts,
        )?;

        let client = reqwest::Client::new();
        let detector =
            Arc::new(Detector::new(config.peers.clone(), config.probe_interval, client.clone()));

        Ok(Self {
            config,
            node,
            node_rx,
            client_tx,
            client_rx,
            rpc_tx,
            rpc_rx,
            clock,
            corrector,
            detector,
            client,
        })
    }

    /// Serves the node on the given listener until SIGINT/SIGTERM.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serves the node on the given listener until the shutdown future
    /// completes or a fatal error occurs. A fatal error (e.g. a persistence
    /// failure) is returned so the process can exit non-zero.
    pub async fn serve_with_shutdown(
        self,
        listener: tokio::net::TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let Server {
            config,
            node,
            node_rx,
            client_tx,
            client_rx,
            rpc_tx,
            rpc_rx,
            clock,
            corrector,
            detector,
            client,
        } = self;
        info!("Node {} listening on {} as {}", config.id, listener.local_addr()?, config.url);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = tokio::task::JoinSet::new();

        // Per-peer outbound RPC senders, with bounded queues.
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mut peer_txs: HashMap<NodeId, mpsc::Sender<PeerRequest>> = HashMap::new();
        for peer in &config.peers {
            let (tx, rx) = mpsc::channel(PEER_QUEUE_SIZE);
            peer_txs.insert(peer.clone(), tx);
            tasks.spawn(peer::run(peer.clone(), client.clone(), rx, reply_tx.clone()));
        }

        // The failure detector, with freshly revived peers feeding catch-up.
        let (revived_tx, revived_rx) = mpsc::unbounded_channel();
        tasks.spawn(Arc::clone(&detector).run(revived_tx));

        // Periodic time synchronization against alive peers.
        tasks.spawn(time_sync_loop(clock.clone(), client.clone(), Arc::clone(&detector)));

        // Catch-up: once at startup, on peer revival, and periodically.
        tasks.spawn(catchup::run(
            client.clone(),
            config.peers.clone(),
            Arc::clone(&detector),
            revived_rx,
            client_tx.clone(),
        ));

        // The HTTP surface.
        let router = http::router(http::AppState {
            node_id: config.id.clone(),
            client_tx: client_tx.clone(),
            rpc_tx: rpc_tx.clone(),
            clock: clock.clone(),
            corrector: corrector.clone(),
            detector: Arc::clone(&detector),
            client: client.clone(),
            send_timeout: config.send_timeout,
        });
        let mut http_shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            });
            if let Err(err) = serve.await {
                error!("HTTP server failed: {err}");
            }
        });

        // The event loop owning the node.
        let loop_ctx = EventLoop {
            node: Some(node),
            node_rx,
            client_rx,
            rpc_rx,
            reply_rx,
            peer_txs,
            detector: Arc::clone(&detector),
            clock,
            corrector,
            config,
            shutdown: shutdown_rx,
        };
        let mut eventloop = tokio::spawn(loop_ctx.run());

        // Run until shutdown or a fatal event-loop error.
        let result = tokio::select! {
            result = &mut eventloop => result?,
            _ = shutdown => {
                shutdown_tx.send_replace(true);
                eventloop.await?
            }
        };
        tasks.abort_all();
        result
    }
}

/// Periodically synchronizes the cluster clock against alive peers.
async fn time_sync_loop(clock: Clock, client: reqwest::Client, detector: Arc<Detector>) {
    let mut interval = tokio::time::interval(clock.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let peers = detector.alive_peers();
        if peers.is_empty() {
            debug!("No alive peers for time synchronization");
            continue;
        }
        if let Err(err) = clock.synchronize(&client, &peers).await {
            error!("Time synchronization failed: {err}");
        }
    }
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt: {err}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received interrupt, shutting down"),
        _ = terminate => info!("Received terminate, shutting down"),
    }
}

/// The event loop state. Owns the node; everything else reaches it through
/// channels. The node is held in an Option since its methods consume it and
/// return the (possibly role-changed) successor.
struct EventLoop {
    node: Option<Node>,
    node_rx: mpsc::UnboundedReceiver<Envelope>,
    client_rx: mpsc::UnboundedReceiver<ClientRequest>,
    rpc_rx: mpsc::UnboundedReceiver<RpcRequest>,
    reply_rx: mpsc::UnboundedReceiver<PeerReply>,
    peer_txs: HashMap<NodeId, mpsc::Sender<PeerRequest>>,
    detector: Arc<Detector>,
    clock: Clock,
    corrector: Corrector,
    config: Config,
    shutdown: watch::Receiver<bool>,
}

impl EventLoop {
    async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            // Wake for the next ordering-buffer deadline, with a fallback
            // poll so a recovering clock can't wedge deliveries.
            let ordering_sleep = match self.node().ordering_deadline() {
                Some(at) => Duration::from_secs_f64((at - crate::time::now()).max(0.0))
                    .min(ORDERING_FALLBACK),
                None => ORDERING_FALLBACK,
            };

            tokio::select! {
                _ = ticker.tick() => {
                    let node = self.take_node().tick()?;
                    self.node = Some(node);
                }

                Some(rpc) = self.rpc_rx.recv() => {
                    let node = Self::rpc_request(self.take_node(), rpc)?;
                    self.node = Some(node);
                }

                Some(reply) = self.reply_rx.recv() => {
                    let node = match reply {
                        PeerReply::Vote { from, resp } => {
                            self.take_node().step_vote_response(from, resp)?
                        }
                        PeerReply::Append { from, resp } => {
                            self.take_node().step_append_response(from, resp)?
                        }
                    };
                    self.node = Some(node);
                }

                Some(request) = self.client_rx.recv() => {
                    let node = self.take_node();
                    let node = self.client_request(node, request)?;
                    self.node = Some(node);
                }

                Some(envelope) = self.node_rx.recv() => {
                    self.route(envelope);
                }

                _ = tokio::time::sleep(ordering_sleep) => {
                    self.node.as_mut().expect("node must exist").ordering_tick()?;
                }

                _ = self.shutdown.changed() => {
                    // Inbound channels are closed with the other tasks; make
                    // sure everything written so far is durable before exit.
                    self.node.as_mut().expect("node must exist").flush()?;
                    info!("Node {} shut down cleanly", self.config.id);
                    return Ok(());
                }
            }
        }
    }

    /// Returns a reference to the node.
    fn node(&self) -> &Node {
        self.node.as_ref().expect("node must exist")
    }

    /// Takes the node out of self; the caller must put its successor back.
    fn take_node(&mut self) -> Node {
        self.node.take().expect("node must exist")
    }

    /// Handles an inbound consensus RPC, replying on its oneshot channel.
    fn rpc_request(node: Node, rpc: RpcRequest) -> Result<Node> {
        match rpc {
            RpcRequest::Vote(req, tx) => {
                let (node, resp) = node.request_vote(req)?;
                let _ = tx.send(resp);
                Ok(node)
            }
            RpcRequest::Append(req, tx) => {
                let (node, resp) = node.append_entries(req)?;
                let _ = tx.send(resp);
                Ok(node)
            }
        }
    }

    /// Handles a client request.
    fn client_request(&self, node: Node, request: ClientRequest) -> Result<Node> {
        match request {
            ClientRequest::Send { message, tx } => node.submit(message, tx),
            ClientRequest::Query { query, tx } => {
                let mut node = node;
                let _ = tx.send(node.query(&query));
                Ok(node)
            }
            ClientRequest::Status { tx } => {
                let mut node = node;
                let status = self.status(&mut node);
                let _ = tx.send(status);
                Ok(node)
            }
            ClientRequest::SyncEntries { after, tx } => {
                let mut node = node;
                let term = node.term();
                let commit_index = node.commit_index();
                let result = node
                    .sync_entries(after)
                    .map(|entries| SyncResponse { term, entries, commit_index });
                let _ = tx.send(result);
                Ok(node)
            }
            ClientRequest::Replicate { term, entries, tx } => {
                let mut node = node.catch_up(term, entries)?;
                let _ = tx.send(Ok(node.commit_index()));
                Ok(node)
            }
            ClientRequest::OrderingStatus { tx } => {
                let _ = tx.send(node.ordering_status());
                Ok(node)
            }
            ClientRequest::ForceDelivery { tx } => {
                let mut node = node;
                let _ = tx.send(node.force_delivery());
                Ok(node)
            }
        }
    }

    /// Builds the full node status.
    fn status(&self, node: &mut Node) -> Result<NodeStatus> {
        let raft = node.status()?;
        Ok(NodeStatus {
            quorum: self.config.quorum.unwrap_or((self.config.peers.len() + 1) / 2 + 1),
            raft,
            url: self.config.url.clone(),
            replication_mode: self.config.mode,
            peers: self.detector.snapshot(),
            time: self.clock.stats(),
            correction: self.corrector.stats(),
            ordering: node.ordering_status(),
        })
    }

    /// Routes an outbound envelope to its peer's sender task, discarding it
    /// if the peer's queue is full (consensus retries on later ticks).
    fn route(&mut self, envelope: Envelope) {
        match self.peer_txs.get(&envelope.to) {
            Some(tx) => {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(envelope.request) {
                    debug!("Send queue for {} full, discarding request", envelope.to);
                }
            }
            None => error!("Outbound request for unknown peer {}", envelope.to),
        }
    }
}
