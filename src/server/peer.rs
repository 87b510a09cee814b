//! Per-peer outbound RPC senders.
//!
//! Each peer gets one sender task with a bounded queue. Requests are
//! delivered as JSON over HTTP with a deadline below the election timeout;
//! failures are dropped and the consensus layer retries on a later tick.
//! Responses are fed back into the node's event loop.

use super::{PeerReply, RPC_TIMEOUT};
use crate::error::Result;
use crate::raft::{NodeId, PeerRequest};

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

/// Runs the outbound sender for a single peer until its queue closes.
pub async fn run(
    peer: NodeId,
    client: reqwest::Client,
    mut rx: mpsc::Receiver<PeerRequest>,
    reply_tx: mpsc::UnboundedSender<PeerReply>,
) {
    while let Some(request) = rx.recv().await {
        let reply = match request {
            PeerRequest::Vote(req) => {
                post(&client, &peer, "/request_vote", &req)
                    .await
                    .map(|resp| PeerReply::Vote { from: peer.clone(), resp })
            }
            PeerRequest::Append(req) => {
                post(&client, &peer, "/append_entries", &req)
                    .await
                    .map(|resp| PeerReply::Append { from: peer.clone(), resp })
            }
        };
        match reply {
            Ok(reply) => {
                if reply_tx.send(reply).is_err() {
                    return; // event loop has shut down
                }
            }
            // Unreachable peers are normal; the next tick retries.
            Err(err) => debug!("RPC to {peer} failed: {err}"),
        }
    }
}

/// Posts a JSON request to a peer endpoint and decodes the JSON response.
async fn post<T: DeserializeOwned>(
    client: &reqwest::Client,
    peer: &str,
    path: &str,
    body: &impl Serialize,
) -> Result<T> {
    Ok(client
        .post(format!("{peer}{path}"))
        .timeout(RPC_TIMEOUT)
        .json(body)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}
