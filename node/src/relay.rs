//! # Signaling Relay
//!
//! The switchboard a room's peers meet through. Peers connect over TCP,
//! claim a `{room}-{slot}` identity, dial each other, and exchange opaque
//! frames the relay forwards verbatim. The relay holds no channel state
//! and understands none of the payloads — it knows who is registered and
//! who is linked to whom, nothing more.
//!
//! The frame vocabulary is `duet_protocol::transport::tcp::RelayFrame`;
//! this server and the protocol crate's client are two ends of the same
//! file.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use duet_protocol::config;
use duet_protocol::transport::tcp::RelayFrame;
use duet_protocol::transport::PeerId;

use crate::metrics::RelayMetrics;

/// Outbound queue depth per connected peer. A peer that falls this far
/// behind gets its frames dropped; the channel protocol's rediscovery and
/// versioning absorb the loss.
const CLIENT_QUEUE_DEPTH: usize = 64;

/// Shared relay state: who is registered, and the metrics.
pub struct RelayState {
    registry: DashMap<PeerId, ClientHandle>,
    /// Relay metrics, shared with the HTTP endpoint.
    pub metrics: RelayMetrics,
}

struct ClientHandle {
    out: mpsc::Sender<RelayFrame>,
    links: DashSet<PeerId>,
}

impl RelayState {
    /// Fresh relay state with its own metrics registry.
    pub fn new(metrics: RelayMetrics) -> Arc<Self> {
        Arc::new(RelayState {
            registry: DashMap::new(),
            metrics,
        })
    }

    /// Number of peers currently holding a slot.
    pub fn connected_peers(&self) -> usize {
        self.registry.len()
    }
}

/// Accept loop: one task per client connection.
pub async fn serve(listener: TcpListener, state: Arc<RelayState>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "relay accepting connections");
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(peer_addr = %addr, "client connected");
        tokio::spawn(handle_client(stream, Arc::clone(&state)));
    }
}

async fn handle_client(stream: TcpStream, state: Arc<RelayState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // First frame must be a claim; everything else on this connection is
    // scoped to the claimed identity.
    let me = match read_frame(&mut reader).await {
        Some(RelayFrame::Claim { peer, magic }) if magic == config::PROTOCOL_MAGIC => peer,
        Some(RelayFrame::Claim { .. }) => {
            let _ = write_half
                .write_all(
                    &RelayFrame::Error {
                        reason: "protocol magic mismatch".to_string(),
                    }
                    .to_line(),
                )
                .await;
            return;
        }
        other => {
            debug!(frame = ?other, "connection opened without a claim, dropping");
            return;
        }
    };

    let (out_tx, out_rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
    {
        use dashmap::mapref::entry::Entry;
        match state.registry.entry(me.clone()) {
            Entry::Occupied(_) => {
                let _ = write_half.write_all(&RelayFrame::SlotTaken.to_line()).await;
                return;
            }
            Entry::Vacant(v) => {
                v.insert(ClientHandle {
                    out: out_tx.clone(),
                    links: DashSet::new(),
                });
            }
        }
    }
    let _ = write_half.write_all(&RelayFrame::Claimed.to_line()).await;
    state.metrics.connected_peers.inc();
    info!(peer = %me, "slot claimed");

    // Single writer task per client keeps frame ordering intact.
    let writer = tokio::spawn(write_loop(write_half, out_rx));

    while let Some(frame) = read_frame(&mut reader).await {
        match frame {
            RelayFrame::Dial { to } => {
                state.metrics.dials_total.inc();
                let verdict = match state.registry.get(&to) {
                    Some(callee) => {
                        callee.links.insert(me.clone());
                        if let Some(caller) = state.registry.get(&me) {
                            caller.links.insert(to.clone());
                        }
                        let _ = callee
                            .out
                            .try_send(RelayFrame::Joined { peer: me.clone() });
                        RelayFrame::DialOk { to }
                    }
                    None => RelayFrame::NoSuchPeer { to },
                };
                if out_tx.send(verdict).await.is_err() {
                    break;
                }
            }
            RelayFrame::Forward { to, payload } => match state.registry.get(&to) {
                Some(callee) => {
                    state.metrics.frames_forwarded_total.inc();
                    if callee
                        .out
                        .try_send(RelayFrame::Deliver {
                            from: me.clone(),
                            payload,
                        })
                        .is_err()
                    {
                        warn!(from = %me, to = %to, "receiver queue full, frame dropped");
                    }
                }
                None => {
                    let _ = out_tx
                        .send(RelayFrame::Error {
                            reason: format!("no such peer: {to}"),
                        })
                        .await;
                }
            },
            other => {
                debug!(peer = %me, frame = ?other, "unexpected client frame");
                let _ = out_tx
                    .send(RelayFrame::Error {
                        reason: "unexpected frame".to_string(),
                    })
                    .await;
            }
        }
    }

    // Departure: release the slot and notify everyone we were linked to.
    if let Some((_, handle)) = state.registry.remove(&me) {
        for linked in handle.links.iter() {
            if let Some(peer) = state.registry.get(linked.key()) {
                let _ = peer.out.try_send(RelayFrame::Left { peer: me.clone() });
                peer.links.remove(&me);
            }
        }
    }
    state.metrics.connected_peers.dec();
    info!(peer = %me, "slot released");
    writer.abort();
}

async fn write_loop(mut writer: OwnedWriteHalf, mut frames: mpsc::Receiver<RelayFrame>) {
    while let Some(frame) = frames.recv().await {
        if writer.write_all(&frame.to_line()).await.is_err() {
            return;
        }
    }
}

/// Reads one frame, enforcing the size cap. `None` ends the connection.
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Option<RelayFrame> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.ok()?;
    if n == 0 || n > config::MAX_FRAME_BYTES {
        return None;
    }
    match serde_json::from_str(line.trim_end()) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "dropping unparseable client frame");
            None
        }
    }
}

/// Axum handler for `/status`: a small JSON summary for humans and
/// health checks.
pub async fn status_handler(
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": duet_protocol::config::PROTOCOL_VERSION,
        "connected_peers": state.connected_peers(),
    }))
}
