//! Error types for the channel coordination protocol.
//!
//! Every protocol operation that can fail returns a [`ChannelError`].
//! Transport-level trouble (a peer not being there yet) is recovered by
//! periodic rediscovery and never escalates past a warning; protocol-level
//! trouble (timeouts, conflicts, violations) is returned to whoever issued
//! the intent as a typed result — never thrown across the event loop.

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::store::StoreError;
use crate::transport::TransportError;

use super::session::Role;
use super::state::SuccessorViolation;

/// Errors surfaced by channel protocol operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The signaling service itself is unreachable. Fatal: without it we
    /// can neither claim an identity nor find the counterparty.
    #[error("peer discovery exhausted: {0}")]
    DiscoveryExhausted(String),

    /// The counterparty has no open connection. Expected while peers start
    /// at different times; rediscovery is the recovery path.
    #[error("peer unavailable: {peer}")]
    PeerUnavailable {
        /// The peer we tried to reach.
        peer: String,
    },

    /// The counterparty did not answer an in-flight exchange before the
    /// deadline. The local channel state is unchanged.
    #[error("handshake timed out after {elapsed_ms}ms (timeout: {timeout_ms}ms)")]
    HandshakeTimeout {
        /// Milliseconds elapsed before giving up.
        elapsed_ms: u64,
        /// Configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// An inbound full-state replacement lost against the local state.
    #[error("state conflict: local version {local_version}, remote version {remote_version}")]
    StateConflict {
        /// Version of the state we hold.
        local_version: u64,
        /// Version the counterparty offered.
        remote_version: u64,
    },

    /// The local session store refused a write. The operation is aborted
    /// before any message reveals the uncommitted state.
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),

    /// A new exchange was requested while one is already in flight.
    /// Exchanges are strictly one-at-a-time per session.
    #[error("exchange already in flight (awaiting {pending})")]
    ExchangeInFlight {
        /// What the outstanding exchange is waiting for.
        pending: String,
    },

    /// The operation is reserved for the other role.
    #[error("{role} cannot perform {operation}")]
    RoleMismatch {
        /// The role this session holds.
        role: Role,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A message or intent arrived in a phase that cannot accept it.
    #[error("invalid state: in phase {phase}, received {message}")]
    InvalidState {
        /// The phase the session is in.
        phase: String,
        /// What arrived.
        message: String,
    },

    /// A produced or received state failed successor validation.
    #[error("protocol violation: {0}")]
    Violation(#[from] SuccessorViolation),

    /// A counterparty-supplied state was structurally valid but
    /// semantically wrong (bad deltas, unsigned bundle, minted totals).
    #[error("rejected remote state: {0}")]
    RejectedRemoteState(String),

    /// The channel's unreserved capacity cannot cover the transaction.
    #[error("insufficient channel capacity: need {needed}, remainder {remainder}")]
    InsufficientCapacity {
        /// Capacity the transaction would reserve.
        needed: i64,
        /// Capacity actually available.
        remainder: i64,
    },

    /// A ledger-client operation failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A transport failure with no protocol-level interpretation.
    #[error(transparent)]
    Transport(TransportError),

    /// The channel has been settled and accepts no further intents.
    #[error("channel is closed")]
    ChannelClosed,

    /// The session event loop is gone (shutdown or crash); the handle is
    /// dead.
    #[error("session terminated")]
    SessionTerminated,
}

impl From<TransportError> for ChannelError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DiscoveryExhausted(reason) => ChannelError::DiscoveryExhausted(reason),
            TransportError::NoConnection { peer } => ChannelError::PeerUnavailable {
                peer: peer.to_string(),
            },
            other => ChannelError::Transport(other),
        }
    }
}
