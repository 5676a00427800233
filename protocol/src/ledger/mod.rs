//! # Ledger Client Interface
//!
//! The channel protocol never touches ledger cryptography directly. Seed
//! handling, address derivation, bundle construction and signing, and final
//! broadcast to the distributed ledger all live behind the [`LedgerClient`]
//! trait defined here. The protocol hands a [`ChannelState`] in, gets a
//! mutated [`ChannelState`] back, and trusts nothing in between.
//!
//! Role asymmetry is baked into the method names: `master_*` operations
//! originate new material (addresses, transaction proposals) and `slave_*`
//! operations counter-sign it. The signing order is load-bearing — a slave
//! signature over material the master never originated is worthless to the
//! ledger, which is exactly why the protocol forces the master to originate
//! even slave-requested operations.
//!
//! This module also owns the vocabulary types the ledger and the channel
//! state share: [`Seed`], [`ChannelAddress`], [`Bundle`],
//! [`SettlementBundle`].
//!
//! A deterministic in-memory implementation lives in [`sim`] for tests and
//! demos; production deployments supply their own client.

pub mod sim;

use std::fmt;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::channel::settlement::SettlementPayout;
use crate::channel::state::ChannelState;
use crate::config;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by a ledger client.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Key or address derivation failed.
    #[error("derivation failed: {0}")]
    Derivation(String),

    /// Signing or signature verification failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The supplied channel state cannot support the requested operation
    /// (e.g., no co-signed address to spend from).
    #[error("ledger rejected channel state: {0}")]
    InvalidState(String),

    /// Submission of a settlement bundle to the distributed ledger failed.
    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

// ---------------------------------------------------------------------------
// Seed
// ---------------------------------------------------------------------------

/// A channel seed: the root secret a party derives all of its channel keys
/// from. 81 characters over the ledger's fixed alphabet.
///
/// The `Debug` impl is redacted. Seeds end up in logs exactly once in a
/// codebase's life, and that one time is a postmortem.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed(String);

impl Seed {
    /// Generates a fresh seed from the operating system's RNG.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let chars: String = (0..config::SEED_LENGTH)
            .map(|_| {
                let i = rng.gen_range(0..config::SEED_ALPHABET.len());
                config::SEED_ALPHABET[i] as char
            })
            .collect();
        Seed(chars)
    }

    /// Wraps an existing seed string, validating length and alphabet.
    pub fn parse(s: impl Into<String>) -> Result<Self, LedgerError> {
        let s = s.into();
        if s.len() != config::SEED_LENGTH {
            return Err(LedgerError::Derivation(format!(
                "seed must be {} characters, got {}",
                config::SEED_LENGTH,
                s.len()
            )));
        }
        if !s.bytes().all(|b| config::SEED_ALPHABET.contains(&b)) {
            return Err(LedgerError::Derivation(
                "seed contains characters outside the ledger alphabet".to_string(),
            ));
        }
        Ok(Seed(s))
    }

    /// Raw seed characters. Handle with care.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed(<redacted {} chars>)", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// Addresses & Bundles
// ---------------------------------------------------------------------------

/// One derived channel address: a 2-of-2 spend target at a specific
/// position in the address tree.
///
/// The master derives the address and the slave counter-signs it; until
/// `slave_signature` is present the address is pending and must not back
/// a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// Position in the address tree. Strictly increasing, never reused.
    pub index: u64,
    /// Rendered address (bech32, `duet1...`).
    pub address: String,
    /// The slave's counter-signature over the address digest. `None` while
    /// the address-creation handshake is still in flight.
    pub slave_signature: Option<String>,
}

impl ChannelAddress {
    /// Whether both parties have committed to this address.
    pub fn is_cosigned(&self) -> bool {
        self.slave_signature.is_some()
    }
}

/// How a transaction's value is apportioned between the two parties.
///
/// Exactly one side of a transfer is non-zero in practice, but the ledger
/// format allows both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSplit {
    /// Amount credited to the master.
    pub master: u64,
    /// Amount credited to the slave.
    pub slave: u64,
}

/// A signed transaction proposal recorded in the channel state.
///
/// Bundles accumulate signatures as the handshake progresses: the master
/// signs at construction, the slave counter-signs during the
/// `signTransaction` exchange. Only fully-signed bundles are eligible for
/// submission at close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// The co-signed channel address this bundle spends from.
    pub address: String,
    /// Value apportionment for this transaction.
    pub split: TransferSplit,
    /// Content digest the signatures commit to (hex).
    pub digest: String,
    /// Master's signature over `digest` (hex), present from construction.
    pub master_signature: Option<String>,
    /// Slave's counter-signature over `digest` (hex).
    pub slave_signature: Option<String>,
}

impl Bundle {
    /// Whether both parties have signed. Only fully-signed bundles may be
    /// settled on the ledger.
    pub fn is_fully_signed(&self) -> bool {
        self.master_signature.is_some() && self.slave_signature.is_some()
    }
}

/// The final-settlement wire form of a bundle, ready for ledger submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementBundle {
    /// Digest of the bundle being settled (hex).
    pub digest: String,
    /// Final payout per party, remainder split included.
    pub payout: SettlementPayout,
    /// Ledger-specific encoding of the settlement transaction.
    pub encoded: String,
}

// ---------------------------------------------------------------------------
// Channel Options
// ---------------------------------------------------------------------------

/// Parameters the room creator supplies when provisioning a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Maximum number of transactions the channel is provisioned for.
    /// Determines the depth of the address tree.
    pub tx_count_limit: u32,
    /// The deposit each party commits. Both parties stake the same amount.
    pub deposit_amount: u64,
    /// The master's settlement address — where its share lands at close.
    pub settlement_address: String,
}

// ---------------------------------------------------------------------------
// LedgerClient
// ---------------------------------------------------------------------------

/// The ledger's cryptographic operations, as the channel protocol sees them.
///
/// Every method is a pure state transformation: callers pass the current
/// [`ChannelState`] (plus their local seed) and receive the successor
/// state. Implementations must not mutate anything observable besides the
/// returned value — the protocol decides when a successor state is
/// committed.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Derives the initial channel state for a room creator.
    async fn master_initialize(
        &self,
        seed: &Seed,
        opts: &ChannelOptions,
    ) -> Result<ChannelState, LedgerError>;

    /// Co-initializes a channel from the slave side, merging the slave's
    /// key material and settlement address into the master's opening state.
    async fn slave_co_initialize(
        &self,
        seed: &Seed,
        settlement_address: &str,
        remote: &ChannelState,
    ) -> Result<ChannelState, LedgerError>;

    /// Derives the next channel address. Advances `address_index` by
    /// exactly one and appends one pending (not yet co-signed) address.
    async fn master_new_address(
        &self,
        seed: &Seed,
        state: &ChannelState,
    ) -> Result<ChannelState, LedgerError>;

    /// Counter-signs the pending address appended by
    /// [`master_new_address`](Self::master_new_address).
    async fn slave_sign_address(
        &self,
        seed: &Seed,
        state: &ChannelState,
    ) -> Result<ChannelState, LedgerError>;

    /// Builds a transaction proposal spending from the newest co-signed
    /// address, master-signed, and appends it to `bundles`.
    async fn master_new_transaction(
        &self,
        seed: &Seed,
        state: &ChannelState,
        split: &TransferSplit,
    ) -> Result<ChannelState, LedgerError>;

    /// Counter-signs every bundle still missing the slave's signature.
    async fn slave_sign_transaction(
        &self,
        seed: &Seed,
        state: &ChannelState,
    ) -> Result<ChannelState, LedgerError>;

    /// Converts the most recent fully-signed bundle into its
    /// final-settlement wire form.
    async fn settlement_bundle(
        &self,
        state: &ChannelState,
        payout: &SettlementPayout,
    ) -> Result<SettlementBundle, LedgerError>;

    /// Submits a settlement bundle to the distributed ledger.
    async fn broadcast_settlement(&self, bundle: &SettlementBundle) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_seed_has_correct_shape() {
        let seed = Seed::generate();
        assert_eq!(seed.expose().len(), config::SEED_LENGTH);
        assert!(seed
            .expose()
            .bytes()
            .all(|b| config::SEED_ALPHABET.contains(&b)));
    }

    #[test]
    fn generated_seeds_differ() {
        // Colliding 81-char seeds would mean the OS RNG is broken, in which
        // case this test is the least of anyone's problems.
        assert_ne!(Seed::generate().expose(), Seed::generate().expose());
    }

    #[test]
    fn seed_debug_is_redacted() {
        let seed = Seed::generate();
        let rendered = format!("{:?}", seed);
        assert!(!rendered.contains(seed.expose()));
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(Seed::parse("TOOSHORT").is_err());
    }

    #[test]
    fn parse_rejects_foreign_characters() {
        let s = "!".repeat(config::SEED_LENGTH);
        assert!(Seed::parse(s).is_err());
    }

    #[test]
    fn bundle_signature_accounting() {
        let mut bundle = Bundle {
            address: "duet1qqq".to_string(),
            split: TransferSplit { master: 0, slave: 10 },
            digest: "ab".to_string(),
            master_signature: Some("cd".to_string()),
            slave_signature: None,
        };
        assert!(!bundle.is_fully_signed());
        bundle.slave_signature = Some("ef".to_string());
        assert!(bundle.is_fully_signed());
    }
}
