//! The pending-exchange primitive.
//!
//! Every signing handshake is a request-reply pair: the initiator sends a
//! command, suspends, and resumes exactly once — on the correlated reply,
//! on the deadline, or on counterparty disconnect, whichever comes first.
//! [`ExchangeSlot`] is the mechanism that enforces all of that:
//!
//! - **One in flight.** A session holds exactly one slot; beginning a
//!   second exchange while one is outstanding fails with
//!   [`ChannelError::ExchangeInFlight`] instead of corrupting state.
//! - **Resolve once.** Resolution consumes the exchange; the reply channel
//!   is a oneshot, so a late reply racing a timeout has nothing to
//!   deliver into.
//! - **State untouched on failure.** The exchange carries no state of its
//!   own — only a continuation describing what the protocol should do on
//!   success — so abandoning it is always safe.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;

use super::error::ChannelError;
use super::state::ChannelState;

// ---------------------------------------------------------------------------
// ResponseKind
// ---------------------------------------------------------------------------

/// The inbound message that resolves an outstanding exchange.
///
/// Note the slave-initiated quirks: a slave that asked the master to
/// originate an address resolves its own exchange on the inbound
/// `signAddress` (its co-sign handler already updated local state), and a
/// slave-requested transaction resolves on the inbound `signTransaction`
/// it counter-signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// The co-signed address from the slave.
    SignAddressResult,
    /// The master's `signAddress` request (slave-initiated address path).
    SignAddress,
    /// The counter-signed transaction from the slave.
    SignTransactionResult,
    /// The master's `signTransaction` request (slave-initiated
    /// transaction path).
    SignTransaction,
}

impl ResponseKind {
    /// Wire name of the awaited command, for errors and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseKind::SignAddressResult => "signAddressResult",
            ResponseKind::SignAddress => "signAddress",
            ResponseKind::SignTransactionResult => "signTransactionResult",
            ResponseKind::SignTransaction => "signTransaction",
        }
    }
}

// ---------------------------------------------------------------------------
// PendingExchange
// ---------------------------------------------------------------------------

/// The initiator's half of a completed intent: where the final result
/// goes. Absent for exchanges the master runs autonomously on the slave's
/// behalf.
pub type Replier = oneshot::Sender<Result<ChannelState, ChannelError>>;

/// One in-flight request-reply correlation.
pub struct PendingExchange<C> {
    /// Correlation id, for logging.
    pub id: Uuid,
    /// The reply that resolves this exchange.
    pub expected: ResponseKind,
    /// When the exchange was begun.
    pub started: Instant,
    /// When the exchange fails with a timeout.
    pub deadline: Instant,
    /// Protocol-defined instructions for completing the handshake.
    pub continuation: C,
    reply: Option<Replier>,
}

impl<C> PendingExchange<C> {
    /// Delivers the final result to the initiator, if one is listening.
    /// Consumes the exchange — resolution is unrepeatable by construction.
    pub fn resolve(mut self, result: Result<ChannelState, ChannelError>) {
        if let Some(reply) = self.reply.take() {
            // The initiator may have given up; that's its prerogative.
            let _ = reply.send(result);
        }
    }

    /// Milliseconds since the exchange began.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Splits the exchange into its continuation and replier, for
    /// handshakes that chain into a follow-up exchange instead of
    /// resolving immediately.
    pub fn into_parts(self) -> (C, Option<Replier>) {
        (self.continuation, self.reply)
    }
}

// ---------------------------------------------------------------------------
// ExchangeSlot
// ---------------------------------------------------------------------------

/// The per-session container enforcing the one-in-flight invariant.
pub struct ExchangeSlot<C> {
    current: Option<PendingExchange<C>>,
}

impl<C> Default for ExchangeSlot<C> {
    fn default() -> Self {
        ExchangeSlot { current: None }
    }
}

impl<C> ExchangeSlot<C> {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a new exchange. Fails with [`ChannelError::ExchangeInFlight`]
    /// if one is already outstanding.
    pub fn begin(
        &mut self,
        expected: ResponseKind,
        continuation: C,
        timeout: Duration,
        reply: Option<Replier>,
    ) -> Result<Uuid, ChannelError> {
        if let Some(pending) = &self.current {
            return Err(ChannelError::ExchangeInFlight {
                pending: pending.expected.as_str().to_string(),
            });
        }
        let id = Uuid::new_v4();
        let started = Instant::now();
        self.current = Some(PendingExchange {
            id,
            expected,
            started,
            deadline: started + timeout,
            continuation,
            reply,
        });
        Ok(id)
    }

    /// Whether an exchange is outstanding.
    pub fn is_pending(&self) -> bool {
        self.current.is_some()
    }

    /// What the outstanding exchange awaits, if any.
    pub fn pending_kind(&self) -> Option<ResponseKind> {
        self.current.as_ref().map(|p| p.expected)
    }

    /// The outstanding exchange's continuation, for handlers that must
    /// decide whether an inbound message is "theirs" before taking it.
    pub fn continuation(&self) -> Option<&C> {
        self.current.as_ref().map(|p| &p.continuation)
    }

    /// Takes the exchange if it awaits `kind`; leaves it in place
    /// otherwise.
    pub fn take_if_expecting(&mut self, kind: ResponseKind) -> Option<PendingExchange<C>> {
        if self.current.as_ref().is_some_and(|p| p.expected == kind) {
            self.current.take()
        } else {
            None
        }
    }

    /// The deadline of the outstanding exchange, for the event loop's
    /// timer branch.
    pub fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().map(|p| p.deadline)
    }

    /// Unconditionally takes the exchange (timeout and cancellation
    /// paths).
    pub fn take(&mut self) -> Option<PendingExchange<C>> {
        self.current.take()
    }
}
