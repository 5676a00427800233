//! In-process signaling hub.
//!
//! A [`MemoryHub`] plays the role of the signaling relay entirely inside
//! one process: slots, dials, frame delivery, join/leave notifications,
//! the works. Integration tests drive two full peers through it without a
//! socket in sight.
//!
//! Semantics match the TCP relay exactly — if a scenario passes against
//! the hub and fails against the relay, the relay is wrong.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use super::{ClaimedSlot, PeerId, Signaling, SignalingConn, SignalingError, SignalingEvent};

/// Queue depth per claimed slot. Matches the session event capacity; a
/// slot that falls this far behind is dead weight anyway.
const SLOT_QUEUE_DEPTH: usize = 64;

#[derive(Default)]
struct HubInner {
    slots: DashMap<PeerId, RegisteredSlot>,
}

struct RegisteredSlot {
    events: mpsc::Sender<SignalingEvent>,
    /// Peers this slot holds a logical connection with. Used to issue
    /// `PeerLeft` notifications when the slot is released.
    links: DashSet<PeerId>,
}

/// An in-memory signaling service shared by every peer cloned from it.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Severs `peer`'s signaling link, the way a relay experiences a TCP
    /// drop: the peer itself observes `SignalingLost`, its slot is
    /// released for re-claiming, and linked peers are told it left. Fault
    /// injection for reconnect tests.
    pub fn sever(&self, peer: &PeerId) {
        if let Some(slot) = self.inner.slots.get(peer) {
            let _ = slot.events.try_send(SignalingEvent::SignalingLost);
        }
        self.release(peer);
    }

    /// Number of currently claimed slots.
    pub fn registered(&self) -> usize {
        self.inner.slots.len()
    }

    fn release(&self, peer: &PeerId) {
        if let Some((_, slot)) = self.inner.slots.remove(peer) {
            for linked in slot.links.iter() {
                if let Some(other) = self.inner.slots.get(linked.key()) {
                    let _ = other.events.try_send(SignalingEvent::PeerLeft {
                        peer: peer.clone(),
                    });
                    other.links.remove(peer);
                }
            }
        }
    }
}

#[async_trait]
impl Signaling for MemoryHub {
    async fn claim(&self, peer: &PeerId) -> Result<ClaimedSlot, SignalingError> {
        use dashmap::mapref::entry::Entry;

        let (tx, rx) = mpsc::channel(SLOT_QUEUE_DEPTH);
        match self.inner.slots.entry(peer.clone()) {
            Entry::Occupied(_) => return Err(SignalingError::SlotTaken),
            Entry::Vacant(v) => {
                v.insert(RegisteredSlot {
                    events: tx,
                    links: DashSet::new(),
                });
            }
        }

        Ok(ClaimedSlot {
            handle: Arc::new(MemoryConn {
                hub: self.clone(),
                id: peer.clone(),
            }),
            events: rx,
        })
    }
}

struct MemoryConn {
    hub: MemoryHub,
    id: PeerId,
}

#[async_trait]
impl SignalingConn for MemoryConn {
    async fn dial(&self, peer: &PeerId) -> Result<(), SignalingError> {
        let slots = &self.hub.inner.slots;
        let callee = slots
            .get(peer)
            .ok_or_else(|| SignalingError::NoSuchPeer(peer.to_string()))?;

        // Record the link on both ends, then notify the callee. Redials
        // of an existing link are harmless; the transport deduplicates.
        callee.links.insert(self.id.clone());
        let newly_dialed = if let Some(caller) = slots.get(&self.id) {
            caller.links.insert(peer.clone())
        } else {
            return Err(SignalingError::ConnectionLost);
        };

        if newly_dialed {
            let _ = callee.events.try_send(SignalingEvent::PeerJoined {
                peer: self.id.clone(),
            });
        }
        Ok(())
    }

    async fn send(&self, to: &PeerId, payload: Vec<u8>) -> Result<(), SignalingError> {
        let callee = self
            .hub
            .inner
            .slots
            .get(to)
            .ok_or_else(|| SignalingError::NoSuchPeer(to.to_string()))?;
        callee
            .events
            .send(SignalingEvent::Message {
                from: self.id.clone(),
                payload,
            })
            .await
            .map_err(|_| SignalingError::ConnectionLost)
    }

    async fn close(&self) {
        self.hub.release(&self.id);
    }
}
