//! Session records and channel roles.
//!
//! A [`Session`] is the durable footprint one peer keeps for one room:
//! which role it plays, its local seed, the latest committed channel
//! state, and whether its deposit has been made. Sessions are persisted
//! after every state transition and survive process restarts; they are
//! destroyed only on explicit close or a local wipe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::Seed;

use super::state::ChannelState;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// A party's role in the channel. Assigned once — the room creator is the
/// master, the first joiner is the slave — and immutable for the session's
/// lifetime.
///
/// The asymmetry is not cosmetic: the ledger's signing order requires the
/// master to originate every address and transaction proposal, even ones
/// the slave asked for.
///
/// Persisted as an index (0 = master) matching the on-disk session record
/// layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Role {
    /// Room creator. Originates all signing handshakes.
    Master,
    /// First joiner. Counter-signs what the master originates.
    Slave,
}

impl Role {
    /// The counterparty's role.
    pub fn other(self) -> Role {
        match self {
            Role::Master => Role::Slave,
            Role::Slave => Role::Master,
        }
    }
}

impl From<Role> for u8 {
    fn from(role: Role) -> u8 {
        match role {
            Role::Master => 0,
            Role::Slave => 1,
        }
    }
}

impl TryFrom<u8> for Role {
    type Error = String;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(Role::Master),
            1 => Ok(Role::Slave),
            other => Err(format!("invalid role index {other}")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelPhase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a channel session.
///
/// ```text
/// Uninitialized → AwaitingPeer → Initializing → Open
///                                                │
///                                  ┌─────────────┼──────────────┐
///                                  ▼             ▼              │
///                             Depositing    Transacting ────────┘
///                                  │             │
///                                  └──────► Open ◄┘
///                                                │
///                                            Closing → Closed
/// ```
///
/// `AwaitingPeer` and `Open` are the steady phases; everything else is
/// transient, entered on an intent and exited when the corresponding
/// handshake completes or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelPhase {
    /// No local session material exists for this room yet.
    Uninitialized,
    /// Session exists, no counterparty connected.
    AwaitingPeer,
    /// Opening state exchange (`flashState` echo) in flight.
    Initializing,
    /// Both parties hold a consistent state; ready for intents.
    Open,
    /// A deposit is being applied and broadcast.
    Depositing,
    /// An address- or transaction-signing exchange is in flight.
    Transacting,
    /// Final settlement is being assembled and broadcast.
    Closing,
    /// The channel is settled. The session record has been destroyed.
    Closed,
}

impl ChannelPhase {
    /// Whether this is a steady phase a session can rest in indefinitely.
    pub fn is_steady(self) -> bool {
        matches!(self, ChannelPhase::AwaitingPeer | ChannelPhase::Open)
    }
}

impl std::fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelPhase::Uninitialized => "uninitialized",
            ChannelPhase::AwaitingPeer => "awaiting-peer",
            ChannelPhase::Initializing => "initializing",
            ChannelPhase::Open => "open",
            ChannelPhase::Depositing => "depositing",
            ChannelPhase::Transacting => "transacting",
            ChannelPhase::Closing => "closing",
            ChannelPhase::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One peer's durable state for one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// This peer's role. `0` on disk for master, `1` for slave.
    pub role: Role,
    /// The local seed all channel keys derive from. Never leaves the
    /// process.
    pub seed: Seed,
    /// The room this session belongs to. Also the persistence key.
    pub room_id: String,
    /// Latest committed channel state. `None` only for a master session
    /// created before ledger initialization completes.
    pub channel_state: Option<ChannelState>,
    /// Whether this peer has made its full deposit.
    pub full_deposit_made: bool,
    /// When this session was first created.
    pub created_at: DateTime<Utc>,
    /// Last committed mutation.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Creates a fresh session record.
    pub fn new(role: Role, seed: Seed, room_id: impl Into<String>, state: ChannelState) -> Self {
        let now = Utc::now();
        Session {
            role,
            seed,
            room_id: room_id.into(),
            channel_state: Some(state),
            full_deposit_made: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Records a mutation timestamp. Call whenever the session is about to
    /// be persisted after a state change.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Current state version, or 0 when no state exists yet.
    pub fn state_version(&self) -> u64 {
        self.channel_state.as_ref().map_or(0, |s| s.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_index() {
        for role in [Role::Master, Role::Slave] {
            let index = u8::from(role);
            assert_eq!(Role::try_from(index).unwrap(), role);
        }
        assert!(Role::try_from(7).is_err());
    }

    #[test]
    fn role_serializes_as_index() {
        // The persisted record stores a role index, not a string.
        assert_eq!(serde_json::to_string(&Role::Master).unwrap(), "0");
        assert_eq!(serde_json::to_string(&Role::Slave).unwrap(), "1");
    }

    #[test]
    fn other_is_an_involution() {
        assert_eq!(Role::Master.other(), Role::Slave);
        assert_eq!(Role::Slave.other().other(), Role::Slave);
    }

    #[test]
    fn steady_phases() {
        assert!(ChannelPhase::Open.is_steady());
        assert!(ChannelPhase::AwaitingPeer.is_steady());
        assert!(!ChannelPhase::Transacting.is_steady());
        assert!(!ChannelPhase::Closed.is_steady());
    }

    #[test]
    fn touch_advances_updated_at() {
        let mut session = Session::new(
            Role::Master,
            Seed::generate(),
            "room-test",
            ChannelState::default(),
        );
        let before = session.updated_at;
        session.touch();
        assert!(session.updated_at >= before);
    }
}
