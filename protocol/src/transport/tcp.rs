//! TCP relay signaling backend.
//!
//! The relay is a dumb room-scoped switchboard: peers connect over TCP,
//! claim a slot, and exchange line-delimited JSON frames that the relay
//! forwards verbatim. The frame vocabulary ([`RelayFrame`]) lives here so
//! the client below and the relay server in the node binary cannot drift
//! apart.
//!
//! One TCP connection per claimed slot. Frame payloads are hex-encoded so
//! the channel protocol's bytes pass through the JSON framing untouched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config;

use super::{ClaimedSlot, PeerId, Signaling, SignalingConn, SignalingError, SignalingEvent};

/// How long a dial waits for the relay's verdict before giving up.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Relay wire format
// ---------------------------------------------------------------------------

/// Frames exchanged between a peer and the relay, one JSON object per
/// line. `payload` fields are hex-encoded opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RelayFrame {
    /// Client → relay: claim `peer` as this connection's identity.
    Claim {
        /// The identity being claimed.
        peer: PeerId,
        /// Protocol magic; lets the relay reject foreign traffic early.
        magic: u32,
    },
    /// Relay → client: the claim succeeded.
    Claimed,
    /// Relay → client: the slot is already held. Probe the next one.
    SlotTaken,
    /// Client → relay: establish a logical connection to `to`.
    Dial {
        /// The peer being dialed.
        to: PeerId,
    },
    /// Relay → client: the dial succeeded.
    DialOk {
        /// The peer that was dialed.
        to: PeerId,
    },
    /// Relay → client: the dialed peer is not registered.
    NoSuchPeer {
        /// The peer that was dialed.
        to: PeerId,
    },
    /// Client → relay: forward `payload` to a connected peer.
    Forward {
        /// Destination peer.
        to: PeerId,
        /// Hex-encoded frame payload.
        payload: String,
    },
    /// Relay → client: a frame from a connected peer.
    Deliver {
        /// Originating peer.
        from: PeerId,
        /// Hex-encoded frame payload.
        payload: String,
    },
    /// Relay → client: a peer dialed us.
    Joined {
        /// The dialing peer.
        peer: PeerId,
    },
    /// Relay → client: a connected peer released its slot.
    Left {
        /// The departed peer.
        peer: PeerId,
    },
    /// Relay → client: the request was malformed or violated protocol.
    Error {
        /// Human-readable description, for logging only.
        reason: String,
    },
}

impl RelayFrame {
    /// Serializes the frame as one newline-terminated JSON line.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_default();
        line.push(b'\n');
        line
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A signaling backend that talks to a DUET relay over TCP.
#[derive(Clone)]
pub struct TcpSignaling {
    relay_addr: String,
}

impl TcpSignaling {
    /// Points the backend at a relay, e.g. `"127.0.0.1:9630"`.
    pub fn new(relay_addr: impl Into<String>) -> Self {
        TcpSignaling {
            relay_addr: relay_addr.into(),
        }
    }
}

#[async_trait]
impl Signaling for TcpSignaling {
    async fn claim(&self, peer: &PeerId) -> Result<ClaimedSlot, SignalingError> {
        let stream = TcpStream::connect(&self.relay_addr)
            .await
            .map_err(|e| SignalingError::Unreachable(format!("{}: {e}", self.relay_addr)))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        // Claim our slot and wait for the relay's verdict before anything
        // else flows on this connection.
        let claim = RelayFrame::Claim {
            peer: peer.clone(),
            magic: config::PROTOCOL_MAGIC,
        };
        writer
            .write_all(&claim.to_line())
            .await
            .map_err(|e| SignalingError::Unreachable(e.to_string()))?;

        match read_frame(&mut reader).await {
            Some(RelayFrame::Claimed) => {}
            Some(RelayFrame::SlotTaken) => return Err(SignalingError::SlotTaken),
            Some(RelayFrame::Error { reason }) => {
                return Err(SignalingError::Unreachable(reason))
            }
            other => {
                return Err(SignalingError::Unreachable(format!(
                    "unexpected claim reply: {other:?}"
                )))
            }
        }

        let (events_tx, events_rx) = mpsc::channel(config::SESSION_EVENT_CAPACITY);
        let dials: Arc<DashMap<PeerId, oneshot::Sender<Result<(), SignalingError>>>> =
            Arc::new(DashMap::new());

        tokio::spawn(read_loop(reader, events_tx, Arc::clone(&dials)));

        Ok(ClaimedSlot {
            handle: Arc::new(TcpConn {
                writer: Mutex::new(writer),
                dials,
            }),
            events: events_rx,
        })
    }
}

struct TcpConn {
    writer: Mutex<OwnedWriteHalf>,
    dials: Arc<DashMap<PeerId, oneshot::Sender<Result<(), SignalingError>>>>,
}

impl TcpConn {
    async fn write_frame(&self, frame: &RelayFrame) -> Result<(), SignalingError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame.to_line())
            .await
            .map_err(|_| SignalingError::ConnectionLost)
    }
}

#[async_trait]
impl SignalingConn for TcpConn {
    async fn dial(&self, peer: &PeerId) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.dials.insert(peer.clone(), tx);

        if let Err(e) = self.write_frame(&RelayFrame::Dial { to: peer.clone() }).await {
            self.dials.remove(peer);
            return Err(e);
        }

        match tokio::time::timeout(DIAL_TIMEOUT, rx).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => Err(SignalingError::ConnectionLost),
            Err(_) => {
                self.dials.remove(peer);
                Err(SignalingError::NoSuchPeer(format!(
                    "{peer} (dial timed out)"
                )))
            }
        }
    }

    async fn send(&self, to: &PeerId, payload: Vec<u8>) -> Result<(), SignalingError> {
        self.write_frame(&RelayFrame::Forward {
            to: to.clone(),
            payload: hex::encode(payload),
        })
        .await
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Reads one frame, enforcing the frame size cap. `None` on EOF, parse
/// failure, or an oversized line — all of which poison the connection.
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Option<RelayFrame> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.ok()?;
    if n == 0 || n > config::MAX_FRAME_BYTES {
        return None;
    }
    match serde_json::from_str(line.trim_end()) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "dropping unparseable relay frame");
            None
        }
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    events: mpsc::Sender<SignalingEvent>,
    dials: Arc<DashMap<PeerId, oneshot::Sender<Result<(), SignalingError>>>>,
) {
    loop {
        let Some(frame) = read_frame(&mut reader).await else {
            let _ = events.send(SignalingEvent::SignalingLost).await;
            return;
        };

        match frame {
            RelayFrame::DialOk { to } => {
                if let Some((_, tx)) = dials.remove(&to) {
                    let _ = tx.send(Ok(()));
                }
            }
            RelayFrame::NoSuchPeer { to } => {
                if let Some((_, tx)) = dials.remove(&to) {
                    let _ = tx.send(Err(SignalingError::NoSuchPeer(to.to_string())));
                }
            }
            RelayFrame::Deliver { from, payload } => match hex::decode(&payload) {
                Ok(bytes) => {
                    if events
                        .send(SignalingEvent::Message {
                            from,
                            payload: bytes,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => warn!(from = %from, error = %e, "dropping frame with bad payload"),
            },
            RelayFrame::Joined { peer } => {
                if events
                    .send(SignalingEvent::PeerJoined { peer })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            RelayFrame::Left { peer } => {
                if events.send(SignalingEvent::PeerLeft { peer }).await.is_err() {
                    return;
                }
            }
            RelayFrame::Error { reason } => {
                debug!(reason = %reason, "relay reported error");
            }
            // Server-bound frames have no business arriving here; ignore.
            RelayFrame::Claim { .. }
            | RelayFrame::Claimed
            | RelayFrame::SlotTaken
            | RelayFrame::Dial { .. }
            | RelayFrame::Forward { .. } => {
                debug!("ignoring misdirected relay frame");
            }
        }
    }
}
