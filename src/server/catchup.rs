//! Catch-up: pulling committed entries this node is missing.
//!
//! Runs once at startup (rejoin), whenever the failure detector reports a
//! freshly recovered peer, and periodically as an anti-entropy backstop.
//! Entries are fetched from a reachable peer with a sync request and fed
//! through the node's normal apply pipeline, which validates term/index
//! continuity before splicing.

use super::{ClientRequest, Detector, SyncResponse};
use crate::error::Result;
use crate::raft::Index;

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The interval between periodic anti-entropy passes.
const ANTI_ENTROPY_INTERVAL: Duration = Duration::from_secs(10);

/// The deadline for a single sync request.
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the catch-up task: a startup rejoin pass, then peer revivals and
/// periodic passes.
pub async fn run(
    client: reqwest::Client,
    peers: Vec<String>,
    detector: Arc<Detector>,
    mut revived_rx: mpsc::UnboundedReceiver<String>,
    client_tx: mpsc::UnboundedSender<ClientRequest>,
) {
    if peers.is_empty() {
        return;
    }

    // Rejoin: pull from the first peer that has anything for us.
    for peer in &peers {
        match pull(&client, peer, &client_tx).await {
            Ok(0) => continue,
            Ok(count) => {
                info!("Rejoined with {count} entries from {peer}");
                break;
            }
            Err(err) => debug!("Startup catch-up from {peer} failed: {err}"),
        }
    }

    let mut interval = tokio::time::interval(ANTI_ENTROPY_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            Some(peer) = revived_rx.recv() => {
                // A recovered peer may hold entries we missed while it (or
                // we) were partitioned.
                if let Err(err) = pull(&client, &peer, &client_tx).await {
                    debug!("Catch-up from recovered peer {peer} failed: {err}");
                }
            }
            _ = interval.tick() => {
                for peer in detector.alive_peers() {
                    match pull(&client, &peer, &client_tx).await {
                        Ok(0) => {}
                        Ok(count) => info!("Anti-entropy pulled {count} entries from {peer}"),
                        Err(err) => {
                            debug!("Anti-entropy pull from {peer} failed: {err}");
                            detector.report_failure(&peer);
                        }
                    }
                }
            }
        }
    }
}

/// Pulls committed entries after our local commit index from the given peer
/// and applies them, looping until the peer has nothing newer. Returns the
/// total number of entries ingested.
pub async fn pull(
    client: &reqwest::Client,
    peer: &str,
    client_tx: &mpsc::UnboundedSender<ClientRequest>,
) -> Result<usize> {
    let mut total = 0;
    loop {
        let after = local_commit_index(client_tx).await?;
        let sync: SyncResponse = client
            .post(format!("{peer}/sync"))
            .timeout(SYNC_TIMEOUT)
            .json(&serde_json::json!({ "after": after }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if sync.entries.is_empty() {
            return Ok(total);
        }
        let count = sync.entries.len();

        let (tx, rx) = oneshot::channel();
        client_tx.send(ClientRequest::Replicate { term: sync.term, entries: sync.entries, tx })?;
        let commit_index = rx.await??;
        if commit_index <= after {
            // The node rejected the batch (e.g. it diverges from the local
            // log); leave repair to normal replication.
            warn!("Catch-up batch from {peer} not applied at commit {after}");
            return Ok(total);
        }
        total += count;
    }
}

/// Fetches the local node's commit index. An empty sync request against the
/// local node doubles as a cheap position probe.
async fn local_commit_index(
    client_tx: &mpsc::UnboundedSender<ClientRequest>,
) -> Result<Index> {
    let (tx, rx) = oneshot::channel();
    client_tx.send(ClientRequest::SyncEntries { after: Index::MAX, tx })?;
    Ok(rx.await??.commit_index)
}
