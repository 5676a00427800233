// Copyright (c) 2026 DUET Maintainers. MIT License.
// See LICENSE for details.

//! # DUET Protocol — Core Library
//!
//! DUET coordinates a two-party, off-ledger payment channel (a "room")
//! between peers connected directly through a signaling relay. Parties
//! stake funds once, then exchange co-signed balance updates at wire
//! speed; the distributed ledger is touched exactly twice, at open and at
//! close.
//!
//! The hard part is not the cryptography — that lives behind the ledger
//! client interface — it is the coordination: a distributed state machine
//! with strict message ordering, exactly one exchange in flight, and
//! asymmetric roles whose violation corrupts the financial state of the
//! channel. This crate is that state machine.
//!
//! ## Architecture
//!
//! The modules mirror the actual concerns of a channel peer:
//!
//! - **transport** — peer discovery by slot probing, connection pool,
//!   framed delivery. Backend-agnostic; in-memory and TCP-relay backends.
//! - **wire** — the seven-command JSON envelope peers exchange.
//! - **channel** — the state machine: sessions, handshakes, settlement.
//! - **ledger** — the external ledger's operations, as a trait, plus a
//!   deterministic simulation for tests and demos.
//! - **store** — sled-backed session persistence.
//! - **config** — protocol constants and tuning parameters.
//!
//! ## Design Philosophy
//!
//! 1. The session event loop owns its state exclusively. No shared
//!    mutable channel state, ever.
//! 2. All-or-nothing handshakes: persisted state advances only on a
//!    validated counter-signed result.
//! 3. Persist before you send. A crash never loses a state the
//!    counterparty has already seen.
//! 4. If it moves money, it has tests. Plural.

pub mod channel;
pub mod config;
pub mod ledger;
pub mod store;
pub mod transport;
pub mod wire;
