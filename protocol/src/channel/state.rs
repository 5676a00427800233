//! Channel state: the full mutable record of balances, stakes, derived
//! addresses, and pending/signed transaction proposals for one channel.
//!
//! The state is opaque to the transport and the presentation layer. Only
//! ledger-client operations produce new states, and only the channel
//! protocol decides whether a produced state is committed. Everything in
//! this module is bookkeeping and invariant checking — no cryptography.
//!
//! ## Monotonicity
//!
//! A channel state never moves backwards. `version` is a strictly
//! increasing counter bumped on every committed mutation, and
//! [`ChannelState::validate_successor`] is the single chokepoint that
//! enforces the rest: the address cursor never regresses, the address and
//! bundle ledgers never shrink, stakes never decrease, and the channel's
//! provisioning parameters are immutable after creation.

use serde::{Deserialize, Serialize};

use crate::ledger::{Bundle, ChannelAddress};

use super::session::Role;

// ---------------------------------------------------------------------------
// BalancePair
// ---------------------------------------------------------------------------

/// A per-party amount: one value for the master, one for the slave.
///
/// Used for both stakes (monotonically non-decreasing) and running totals
/// (signed — a party that pays before depositing goes negative).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancePair {
    /// The master's side.
    pub master: i64,
    /// The slave's side.
    pub slave: i64,
}

impl BalancePair {
    /// The value held by `role`.
    pub fn get(&self, role: Role) -> i64 {
        match role {
            Role::Master => self.master,
            Role::Slave => self.slave,
        }
    }

    /// Mutable access to the value held by `role`.
    pub fn get_mut(&mut self, role: Role) -> &mut i64 {
        match role {
            Role::Master => &mut self.master,
            Role::Slave => &mut self.slave,
        }
    }

    /// Sum across both parties. Conserved by transactions, grown by
    /// deposits.
    pub fn sum(&self) -> i64 {
        self.master + self.slave
    }
}

// ---------------------------------------------------------------------------
// Party-keyed metadata
// ---------------------------------------------------------------------------

/// Settlement addresses for both parties. The slave's is absent until
/// co-initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementAddresses {
    /// Where the master's share lands at close.
    pub master: String,
    /// Where the slave's share lands at close.
    pub slave: Option<String>,
}

/// Public co-signing keys for both parties (hex). Recorded at
/// initialization so either side can verify counter-signatures offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignerKeys {
    /// The master's verifying key.
    pub master: String,
    /// The slave's verifying key. Absent until co-initialization.
    pub slave: Option<String>,
}

// ---------------------------------------------------------------------------
// ChannelState
// ---------------------------------------------------------------------------

/// The complete state of one bilateral payment channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Monotonic mutation counter. Bumped on every committed change; the
    /// tiebreaker for inbound full-state replacements.
    pub version: u64,
    /// Funds each party has committed to the channel.
    pub stake: BalancePair,
    /// Current running balance per party. Starts at zero for both.
    pub total: BalancePair,
    /// The per-party deposit this channel was provisioned for.
    pub deposit_amount: u64,
    /// Maximum number of transactions the channel supports.
    pub tx_count_limit: u32,
    /// Settlement addresses per party.
    pub settlement: SettlementAddresses,
    /// Co-signing public keys per party.
    pub cosigners: CosignerKeys,
    /// Address-derivation cursor. Advances by exactly one per completed
    /// address handshake.
    pub address_index: u64,
    /// Depth of the channel's address tree, fixed at provisioning.
    pub depth: u64,
    /// Every address derived for this channel, in derivation order.
    pub addresses: Vec<ChannelAddress>,
    /// Transaction proposals. Slots hold `None` while a counter-signature
    /// round is incomplete.
    pub bundles: Vec<Option<Bundle>>,
    /// Unreserved channel capacity. Every transaction of `amount` reserves
    /// `amount * 2`.
    pub remainder: i64,
}

impl ChannelState {
    /// Number of bundle slots actually holding a proposal.
    pub fn occupied_bundles(&self) -> usize {
        self.bundles.iter().filter(|b| b.is_some()).count()
    }

    /// Whether a co-signed address exists that no bundle has consumed yet.
    ///
    /// Each transaction spends from one address; when every co-signed
    /// address already backs a bundle, the master must run an
    /// address-creation handshake before the next transaction.
    pub fn has_unused_address(&self) -> bool {
        let cosigned = self.addresses.iter().filter(|a| a.is_cosigned()).count();
        cosigned > self.occupied_bundles()
    }

    /// The newest co-signed address, if any.
    pub fn newest_cosigned_address(&self) -> Option<&ChannelAddress> {
        self.addresses.iter().rev().find(|a| a.is_cosigned())
    }

    /// The most recent fully-signed bundle — the one that would be
    /// submitted if the channel closed now.
    pub fn latest_fully_signed_bundle(&self) -> Option<&Bundle> {
        self.bundles
            .iter()
            .rev()
            .flatten()
            .find(|b| b.is_fully_signed())
    }

    /// All non-empty bundle slots, oldest first.
    pub fn signed_bundles(&self) -> Vec<&Bundle> {
        self.bundles.iter().flatten().collect()
    }

    /// Checks that `next` is a legal successor of `self`.
    ///
    /// This is the all-or-nothing commit gate: every state produced by a
    /// ledger operation or received from the counterparty passes through
    /// here before it is persisted.
    pub fn validate_successor(&self, next: &ChannelState) -> Result<(), SuccessorViolation> {
        if next.version <= self.version {
            return Err(SuccessorViolation::StaleVersion {
                local: self.version,
                offered: next.version,
            });
        }
        if next.address_index < self.address_index {
            return Err(SuccessorViolation::AddressIndexRegressed {
                from: self.address_index,
                to: next.address_index,
            });
        }
        if next.depth < self.depth {
            return Err(SuccessorViolation::DepthRegressed {
                from: self.depth,
                to: next.depth,
            });
        }
        if next.addresses.len() < self.addresses.len() {
            return Err(SuccessorViolation::LedgerShrank("addresses"));
        }
        if next.bundles.len() < self.bundles.len() {
            return Err(SuccessorViolation::LedgerShrank("bundles"));
        }
        if next.stake.master < self.stake.master || next.stake.slave < self.stake.slave {
            return Err(SuccessorViolation::StakeDecreased);
        }
        if next.deposit_amount != self.deposit_amount
            || next.tx_count_limit != self.tx_count_limit
        {
            return Err(SuccessorViolation::ProvisioningChanged);
        }
        Ok(())
    }
}

/// Ways a proposed successor state can be illegal.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SuccessorViolation {
    /// The offered version is not newer than what we hold.
    #[error("stale version: local {local}, offered {offered}")]
    StaleVersion {
        /// Version of the locally held state.
        local: u64,
        /// Version of the offered state.
        offered: u64,
    },

    /// The address cursor moved backwards.
    #[error("address index regressed from {from} to {to}")]
    AddressIndexRegressed {
        /// Cursor before.
        from: u64,
        /// Cursor after.
        to: u64,
    },

    /// The address-tree depth moved backwards.
    #[error("depth regressed from {from} to {to}")]
    DepthRegressed {
        /// Depth before.
        from: u64,
        /// Depth after.
        to: u64,
    },

    /// An append-only ledger lost entries.
    #[error("{0} ledger shrank")]
    LedgerShrank(&'static str),

    /// A stake went down. Stakes only ever grow via deposits.
    #[error("stake decreased")]
    StakeDecreased,

    /// Channel provisioning parameters are immutable after creation.
    #[error("provisioning parameters changed")]
    ProvisioningChanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TransferSplit;

    fn base_state() -> ChannelState {
        ChannelState {
            version: 3,
            deposit_amount: 50,
            tx_count_limit: 100,
            depth: 7,
            address_index: 2,
            addresses: vec![
                ChannelAddress {
                    index: 1,
                    address: "duet1aaa".to_string(),
                    slave_signature: Some("sig".to_string()),
                },
                ChannelAddress {
                    index: 2,
                    address: "duet1bbb".to_string(),
                    slave_signature: None,
                },
            ],
            ..ChannelState::default()
        }
    }

    fn bundle(fully_signed: bool) -> Bundle {
        Bundle {
            address: "duet1aaa".to_string(),
            split: TransferSplit { master: 0, slave: 10 },
            digest: "00".to_string(),
            master_signature: Some("m".to_string()),
            slave_signature: fully_signed.then(|| "s".to_string()),
        }
    }

    #[test]
    fn unused_address_accounting() {
        let mut state = base_state();
        // One co-signed address, zero bundles: usable.
        assert!(state.has_unused_address());

        // Consume it with a bundle: a fresh address is now required.
        state.bundles.push(Some(bundle(true)));
        assert!(!state.has_unused_address());

        // The pending (un-cosigned) address doesn't count.
        assert_eq!(state.addresses.len(), 2);
    }

    #[test]
    fn latest_fully_signed_bundle_skips_half_signed() {
        let mut state = base_state();
        state.bundles.push(Some(bundle(true)));
        state.bundles.push(None);
        state.bundles.push(Some(bundle(false)));

        let latest = state.latest_fully_signed_bundle().unwrap();
        assert!(latest.is_fully_signed());
    }

    #[test]
    fn successor_must_advance_version() {
        let state = base_state();
        let same = state.clone();
        assert_eq!(
            state.validate_successor(&same),
            Err(SuccessorViolation::StaleVersion {
                local: 3,
                offered: 3
            })
        );
    }

    #[test]
    fn successor_rejects_cursor_regression() {
        let state = base_state();
        let mut next = state.clone();
        next.version += 1;
        next.address_index = 1;
        assert!(matches!(
            state.validate_successor(&next),
            Err(SuccessorViolation::AddressIndexRegressed { .. })
        ));
    }

    #[test]
    fn successor_rejects_shrinking_ledgers() {
        let state = base_state();
        let mut next = state.clone();
        next.version += 1;
        next.addresses.pop();
        assert_eq!(
            state.validate_successor(&next),
            Err(SuccessorViolation::LedgerShrank("addresses"))
        );
    }

    #[test]
    fn successor_rejects_stake_cuts_and_reprovisioning() {
        let mut state = base_state();
        state.stake.master = 50;

        let mut cut = state.clone();
        cut.version += 1;
        cut.stake.master = 0;
        assert_eq!(
            state.validate_successor(&cut),
            Err(SuccessorViolation::StakeDecreased)
        );

        let mut reprov = state.clone();
        reprov.version += 1;
        reprov.deposit_amount = 9999;
        assert_eq!(
            state.validate_successor(&reprov),
            Err(SuccessorViolation::ProvisioningChanged)
        );
    }

    #[test]
    fn legal_successor_accepted() {
        let state = base_state();
        let mut next = state.clone();
        next.version += 1;
        next.address_index += 1;
        next.addresses.push(ChannelAddress {
            index: 3,
            address: "duet1ccc".to_string(),
            slave_signature: None,
        });
        assert!(state.validate_successor(&next).is_ok());
    }

    #[test]
    fn balance_pair_role_access() {
        let mut pair = BalancePair { master: 5, slave: -5 };
        assert_eq!(pair.get(Role::Master), 5);
        assert_eq!(pair.get(Role::Slave), -5);
        assert_eq!(pair.sum(), 0);
        *pair.get_mut(Role::Slave) += 10;
        assert_eq!(pair.slave, 5);
    }
}
