//! # Channel Coordination Protocol
//!
//! The distributed state machine at the heart of DUET. Two peers — a
//! master and a slave — advance one shared [`ChannelState`] through
//! strictly ordered signing handshakes, with every committed step
//! persisted locally before it is revealed on the wire.
//!
//! ## The Flow
//!
//! ```text
//!   ┌──────────┐                               ┌──────────┐
//!   │  Master  │                               │  Slave   │
//!   └────┬─────┘                               └────┬─────┘
//!        │                                          │
//!        │  flashState (opening state)              │
//!        ├─────────────────────────────────────────►│
//!        │  flashState (co-initialized echo)        │
//!        │◄─────────────────────────────────────────┤
//!        │                                          │
//!        │  signAddress ─► signAddressResult        │  address
//!        │◄────────────────────────────────────────►│  handshake
//!        │                                          │
//!        │  signTransaction ─► signTransactionResult│  transaction
//!        │◄────────────────────────────────────────►│  handshake
//!        │                                          │
//!        │  createAddress / createTransaction       │  slave-initiated
//!        │◄─────────────────────────────────────────┤  (master originates)
//!        │                                          │
//!        │  settle newest fully-signed bundle       │  close
//!        ├──────────────► LEDGER                    │
//! ```
//!
//! ## Why the master always goes first
//!
//! The ledger's signing order is fixed: counter-signatures are only valid
//! over material the master originated. A slave that needs an address or
//! a transaction therefore *asks* (`createAddress`, `createTransaction`)
//! and the master runs the originating path on its behalf. Breaking this
//! ordering corrupts the channel's financial state, which is why the
//! dispatch table is keyed by role and the protocol enforces exactly one
//! exchange in flight per session.
//!
//! - [`state`] — the channel state record and its monotonicity rules.
//! - [`session`] — roles, lifecycle phases, the persisted session.
//! - [`exchange`] — the one-in-flight pending-exchange primitive.
//! - [`protocol`] — the event loop and handshake drivers.
//! - [`settlement`] — close-time bundle selection and payout math.
//! - [`error`] — the protocol error taxonomy.

pub mod error;
pub mod exchange;
pub mod protocol;
pub mod session;
pub mod settlement;
pub mod state;

pub use error::ChannelError;
pub use exchange::{ExchangeSlot, PendingExchange, ResponseKind};
pub use protocol::{
    ChannelConfig, ChannelHandle, ChannelProtocol, ChannelSnapshot, TransferDirection,
};
pub use session::{ChannelPhase, Role, Session};
pub use settlement::{CloseReport, SettlementPayout};
pub use state::{BalancePair, ChannelState};
