//! # Peer Transport
//!
//! Peer discovery and framed message delivery for a channel room. The
//! transport knows nothing about channel semantics — it moves opaque
//! frames between peers and reports who is reachable. The channel
//! protocol consumes a single [`TransportEvent`] stream and addresses
//! counterparties by [`PeerId`] only; raw connections never escape this
//! module.
//!
//! ## Identity by probing
//!
//! Peers in a room claim identities of the form `{room}-{slot}` against a
//! signaling service, probing slots upward from zero until one is free.
//! The room creator lands on slot 0 and is thereby the master; whoever
//! probes next lands on slot 1. There is no upper bound — probing fails
//! only when the signaling service itself is unreachable, which is fatal.
//!
//! ## Discovery by redialing
//!
//! A small fixed window of candidate slots is redialed every
//! `rediscovery_interval` until a stop signal. Peers routinely start
//! minutes apart, so "peer not there" is an expected condition and the
//! periodic redial is the only recovery mechanism: `send` to an
//! unconnected peer is a non-fatal error, never a retry loop.
//!
//! ## Backends
//!
//! The signaling service is abstracted behind [`Signaling`]; the engine
//! here is backend-agnostic and fully exercisable in-process. Two
//! backends ship: [`memory::MemoryHub`] for tests and demos, and
//! [`tcp`] for a line-delimited-JSON TCP relay.

pub mod memory;
pub mod tcp;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config;

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// A peer identity within a room: `{room}-{slot}`.
///
/// Slots are assigned by probing and never reused within a live room. The
/// slot doubles as the role assignment: slot 0 is the room creator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerId {
    room: String,
    slot: u32,
}

impl PeerId {
    /// Builds the identity for `slot` within `room`.
    pub fn new(room: impl Into<String>, slot: u32) -> Self {
        PeerId {
            room: room.into(),
            slot,
        }
    }

    /// The room this identity belongs to.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// The claimed slot number.
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.room, self.slot)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> String {
        id.to_string()
    }
}

impl FromStr for PeerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (room, slot) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("peer id missing slot suffix: {s}"))?;
        let slot = slot
            .parse::<u32>()
            .map_err(|e| format!("bad slot in peer id {s}: {e}"))?;
        if room.is_empty() {
            return Err(format!("peer id has empty room: {s}"));
        }
        Ok(PeerId::new(room, slot))
    }
}

impl TryFrom<String> for PeerId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from a signaling backend.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// The requested slot is already claimed. The probe loop's cue to try
    /// the next slot; never surfaced to callers.
    #[error("slot already taken")]
    SlotTaken,

    /// The peer being dialed is not registered with the signaling service.
    #[error("no such peer: {0}")]
    NoSuchPeer(String),

    /// The signaling service cannot be reached at all.
    #[error("signaling service unreachable: {0}")]
    Unreachable(String),

    /// The established signaling connection dropped.
    #[error("signaling connection lost")]
    ConnectionLost,
}

/// Errors surfaced by the peer transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Identity probing failed because the signaling service is
    /// unreachable. Fatal for the session.
    #[error("peer discovery exhausted: {0}")]
    DiscoveryExhausted(String),

    /// No open connection to the addressed peer. Non-fatal; rediscovery
    /// is the recovery path.
    #[error("no open connection to {peer}")]
    NoConnection {
        /// The peer that was addressed.
        peer: PeerId,
    },

    /// A frame could not be handed to the signaling backend.
    #[error("send failed: {0}")]
    SendFailed(String),
}

// ---------------------------------------------------------------------------
// Signaling abstraction
// ---------------------------------------------------------------------------

/// Events a claimed signaling slot delivers.
#[derive(Debug)]
pub enum SignalingEvent {
    /// An inbound frame from a connected peer.
    Message {
        /// Sender identity.
        from: PeerId,
        /// Opaque frame payload.
        payload: Vec<u8>,
    },
    /// A remote peer dialed us; a logical connection now exists.
    PeerJoined {
        /// The dialing peer.
        peer: PeerId,
    },
    /// A connected peer went away.
    PeerLeft {
        /// The departed peer.
        peer: PeerId,
    },
    /// The signaling connection itself dropped. The transport will try to
    /// re-claim its identity.
    SignalingLost,
}

/// A successfully claimed slot: a handle for outbound operations plus the
/// event stream for that slot.
pub struct ClaimedSlot {
    /// Outbound operations on the claimed slot.
    pub handle: Arc<dyn SignalingConn>,
    /// Inbound events for the claimed slot.
    pub events: mpsc::Receiver<SignalingEvent>,
}

/// Outbound operations available once a slot is claimed.
#[async_trait]
pub trait SignalingConn: Send + Sync {
    /// Establishes a logical connection to `peer`. Succeeds only if the
    /// peer is currently registered.
    async fn dial(&self, peer: &PeerId) -> Result<(), SignalingError>;

    /// Delivers one frame to a connected peer.
    async fn send(&self, to: &PeerId, payload: Vec<u8>) -> Result<(), SignalingError>;

    /// Releases the slot and tears down the connection.
    async fn close(&self);
}

/// A signaling service: the only thing a transport needs from the outside
/// world.
#[async_trait]
pub trait Signaling: Send + Sync + 'static {
    /// Attempts to claim `peer` as our identity. [`SignalingError::SlotTaken`]
    /// means "probe the next slot"; anything else means the service is
    /// unreachable.
    async fn claim(&self, peer: &PeerId) -> Result<ClaimedSlot, SignalingError>;
}

// ---------------------------------------------------------------------------
// Transport events & config
// ---------------------------------------------------------------------------

/// Events the channel protocol consumes from its transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// An inbound frame from a connected peer.
    Message {
        /// Sender identity.
        from: PeerId,
        /// Opaque frame payload — the channel protocol owns the schema.
        payload: Vec<u8>,
    },
    /// A logical connection to a peer was established (either direction).
    PeerJoined {
        /// The newly connected peer.
        peer: PeerId,
    },
    /// A connected peer went away.
    PeerLeft {
        /// The departed peer.
        peer: PeerId,
    },
}

/// Tuning knobs for the peer transport. `Default` pulls from
/// [`crate::config`]; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Candidate slots probed during discovery: `0..probe_window`.
    pub probe_window: u32,
    /// How often unconnected candidates are redialed.
    pub rediscovery_interval: Duration,
    /// Delay between re-claim attempts after the signaling link drops.
    pub reconnect_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            probe_window: config::PEER_PROBE_WINDOW,
            rediscovery_interval: config::REDISCOVERY_INTERVAL,
            reconnect_delay: config::SIGNALING_RECONNECT_DELAY,
        }
    }
}

// ---------------------------------------------------------------------------
// PeerTransport
// ---------------------------------------------------------------------------

/// The per-session transport: one claimed identity, a pool of logical
/// peer connections, a discovery loop, and a single outbound event stream.
pub struct PeerTransport {
    local_id: PeerId,
    conn: Arc<RwLock<Arc<dyn SignalingConn>>>,
    connections: Arc<DashMap<PeerId, ()>>,
    stop: watch::Sender<bool>,
}

impl PeerTransport {
    /// Claims an identity in `room` and starts the discovery and event
    /// pump tasks. Returns the transport handle and the event stream the
    /// channel protocol consumes.
    ///
    /// Identity acquisition probes slots 0, 1, 2, … until the signaling
    /// service grants one. There is no upper bound; the only failure mode
    /// is [`TransportError::DiscoveryExhausted`] when the service itself
    /// is unreachable.
    pub async fn connect(
        signaling: Arc<dyn Signaling>,
        room: &str,
        cfg: TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let (local_id, claimed) = Self::acquire_identity(signaling.as_ref(), room).await?;
        info!(peer = %local_id, "claimed signaling identity");

        let conn = Arc::new(RwLock::new(Arc::clone(&claimed.handle)));
        let connections: Arc<DashMap<PeerId, ()>> = Arc::new(DashMap::new());
        let (events_tx, events_rx) = mpsc::channel(config::SESSION_EVENT_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        // Event pump: signaling events in, transport events out. Owns the
        // signaling event receiver and the re-claim loop.
        tokio::spawn(pump_events(
            signaling.clone(),
            local_id.clone(),
            claimed.events,
            Arc::clone(&conn),
            Arc::clone(&connections),
            events_tx.clone(),
            cfg.clone(),
            stop_rx.clone(),
        ));

        // Discovery loop: redial unconnected candidate slots until stopped.
        tokio::spawn(discovery_loop(
            local_id.clone(),
            Arc::clone(&conn),
            Arc::clone(&connections),
            events_tx,
            cfg,
            stop_rx,
        ));

        Ok((
            PeerTransport {
                local_id,
                conn,
                connections,
                stop: stop_tx,
            },
            events_rx,
        ))
    }

    /// The probing loop. Extracted so the claim/retry semantics are
    /// testable without spinning up the pump tasks.
    async fn acquire_identity(
        signaling: &dyn Signaling,
        room: &str,
    ) -> Result<(PeerId, ClaimedSlot), TransportError> {
        let mut slot = 0u32;
        loop {
            let candidate = PeerId::new(room, slot);
            match signaling.claim(&candidate).await {
                Ok(claimed) => return Ok((candidate, claimed)),
                Err(SignalingError::SlotTaken) => {
                    trace!(peer = %candidate, "slot taken, probing next");
                    slot += 1;
                }
                Err(e) => return Err(TransportError::DiscoveryExhausted(e.to_string())),
            }
        }
    }

    /// Our claimed identity.
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Peers with an open logical connection, in no particular order.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Sends one frame to a connected peer. Best-effort: an unconnected
    /// peer is a non-fatal [`TransportError::NoConnection`] — rediscovery
    /// will bring the peer back, and the caller decides whether to retry.
    pub async fn send(&self, peer: &PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.connections.contains_key(peer) {
            return Err(TransportError::NoConnection { peer: peer.clone() });
        }
        let conn = Arc::clone(&*self.conn.read());
        conn.send(peer, payload)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Fans one frame out to every connected peer. Individual failures are
    /// logged and swallowed; a bilateral room has one counterparty and the
    /// rediscovery loop owns recovery.
    pub async fn broadcast(&self, payload: Vec<u8>) {
        for peer in self.connected_peers() {
            if let Err(e) = self.send(&peer, payload.clone()).await {
                debug!(peer = %peer, error = %e, "broadcast delivery skipped");
            }
        }
    }

    /// Stops the discovery and pump tasks and releases the claimed slot.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let conn = Arc::clone(&*self.conn.read());
        conn.close().await;
    }
}

/// Registers a newly connected peer and emits `PeerJoined` exactly once,
/// no matter which direction established the connection first.
fn note_connected(
    connections: &DashMap<PeerId, ()>,
    events: &mpsc::Sender<TransportEvent>,
    peer: PeerId,
) {
    if connections.insert(peer.clone(), ()).is_none() {
        info!(peer = %peer, "peer connected");
        let _ = events.try_send(TransportEvent::PeerJoined { peer });
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump_events(
    signaling: Arc<dyn Signaling>,
    local_id: PeerId,
    mut events_in: mpsc::Receiver<SignalingEvent>,
    conn: Arc<RwLock<Arc<dyn SignalingConn>>>,
    connections: Arc<DashMap<PeerId, ()>>,
    events_out: mpsc::Sender<TransportEvent>,
    cfg: TransportConfig,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            ev = events_in.recv() => ev,
            _ = stop.changed() => return,
        };

        match event {
            Some(SignalingEvent::Message { from, payload }) => {
                // A frame proves the connection exists even if we missed
                // the join event (e.g., across a signaling reconnect).
                note_connected(&connections, &events_out, from.clone());
                if events_out
                    .send(TransportEvent::Message { from, payload })
                    .await
                    .is_err()
                {
                    return; // protocol side dropped its receiver
                }
            }
            Some(SignalingEvent::PeerJoined { peer }) => {
                note_connected(&connections, &events_out, peer);
            }
            Some(SignalingEvent::PeerLeft { peer }) => {
                if connections.remove(&peer).is_some() {
                    info!(peer = %peer, "peer disconnected");
                    let _ = events_out.send(TransportEvent::PeerLeft { peer }).await;
                }
            }
            Some(SignalingEvent::SignalingLost) | None => {
                // Re-claim our identity without discarding the peer pool.
                // The relay may still hold our stale registration for a
                // moment, so SlotTaken is retried like any other failure.
                warn!(peer = %local_id, "signaling connection lost, reconnecting");
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(cfg.reconnect_delay) => {}
                        _ = stop.changed() => return,
                    }
                    match signaling.claim(&local_id).await {
                        Ok(reclaimed) => {
                            *conn.write() = reclaimed.handle;
                            events_in = reclaimed.events;
                            info!(peer = %local_id, "signaling connection re-established");
                            break;
                        }
                        Err(e) => {
                            debug!(peer = %local_id, error = %e, "re-claim attempt failed");
                        }
                    }
                }
            }
        }
    }
}

async fn discovery_loop(
    local_id: PeerId,
    conn: Arc<RwLock<Arc<dyn SignalingConn>>>,
    connections: Arc<DashMap<PeerId, ()>>,
    events_out: mpsc::Sender<TransportEvent>,
    cfg: TransportConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(cfg.rediscovery_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.changed() => return,
        }

        for slot in 0..cfg.probe_window {
            let candidate = PeerId::new(local_id.room(), slot);
            if candidate == local_id || connections.contains_key(&candidate) {
                continue;
            }
            let handle = Arc::clone(&*conn.read());
            match handle.dial(&candidate).await {
                Ok(()) => note_connected(&connections, &events_out, candidate),
                Err(SignalingError::NoSuchPeer(_)) => {
                    // Expected until the counterparty starts; next tick
                    // will try again.
                    trace!(peer = %candidate, "candidate not registered yet");
                }
                Err(e) => {
                    debug!(peer = %candidate, error = %e, "dial failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_formatting_round_trips() {
        let id = PeerId::new("alpine-7", 3);
        assert_eq!(id.to_string(), "alpine-7-3");

        // Room names may themselves contain dashes; the slot is always
        // the final segment.
        let parsed: PeerId = "alpine-7-3".parse().unwrap();
        assert_eq!(parsed.room(), "alpine-7");
        assert_eq!(parsed.slot(), 3);
        assert_eq!(parsed, id);
    }

    #[test]
    fn peer_id_rejects_garbage() {
        assert!("noslot".parse::<PeerId>().is_err());
        assert!("room-notanumber".parse::<PeerId>().is_err());
        assert!("-3".parse::<PeerId>().is_err());
    }

    #[test]
    fn peer_id_serde_uses_wire_form() {
        let id = PeerId::new("r", 0);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"r-0\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
