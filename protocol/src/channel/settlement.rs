//! Final settlement: turning a channel's signed history into one ledger
//! submission.
//!
//! Closing a channel is deliberately boring. Everything submitted at
//! close was already co-signed during normal operation; this module only
//! selects the newest fully-signed bundle and computes the payout split.
//! The split rule is fixed: each party receives its running total plus
//! half the unreserved remainder, and an odd remainder unit goes to the
//! master. Both parties compute the same numbers from the same state, so
//! there is nothing to negotiate at close time.

use serde::{Deserialize, Serialize};

use crate::ledger::Bundle;

use super::error::ChannelError;
use super::state::ChannelState;

/// The final per-party payout of a closing channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPayout {
    /// Amount paid out to the master.
    pub master: i64,
    /// Amount paid out to the slave.
    pub slave: i64,
    /// The master's settlement address.
    pub master_address: String,
    /// The slave's settlement address, when co-initialization happened.
    pub slave_address: Option<String>,
}

/// Outcome of a completed close, reported to the intent issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReport {
    /// Digest of the bundle submitted to the ledger.
    pub bundle_digest: String,
    /// The payout that was settled.
    pub payout: SettlementPayout,
}

/// Computes the close payout for a channel state.
///
/// `payout.master + payout.slave == total.master + total.slave + remainder`
/// always holds — settlement distributes, it never mints.
pub fn compute_payout(state: &ChannelState) -> SettlementPayout {
    let half = state.remainder / 2;
    let odd_unit = state.remainder - half * 2;
    SettlementPayout {
        master: state.total.master + half + odd_unit,
        slave: state.total.slave + half,
        master_address: state.settlement.master.clone(),
        slave_address: state.settlement.slave.clone(),
    }
}

/// Selects the bundle to submit: the most recent fully-signed one.
///
/// A channel with no fully-signed bundle has nothing to settle on the
/// ledger — closing it would strand funds, so the close intent fails
/// instead.
pub fn select_bundle(state: &ChannelState) -> Result<&Bundle, ChannelError> {
    state
        .latest_fully_signed_bundle()
        .ok_or(ChannelError::InvalidState {
            phase: "closing".to_string(),
            message: "no fully-signed bundle to settle".to_string(),
        })
}
