//! Deterministic in-memory ledger client.
//!
//! [`SimLedger`] implements the full [`LedgerClient`](super::LedgerClient)
//! surface without a ledger node: addresses are blake3 derivations over
//! both parties' keys, and bundle signatures are real ed25519 signatures
//! under keys derived from each party's seed. "Fully signed" is therefore
//! a verifiable property here, not a boolean somebody set — tests that
//! pass against the sim exercise the same ordering constraints a
//! production client enforces.
//!
//! Everything is a pure function of the inputs. Two peers holding the
//! same seeds derive byte-identical states independently, which is what
//! makes the sim usable on both ends of an integration test.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;

use async_trait::async_trait;

use crate::channel::settlement::SettlementPayout;
use crate::channel::state::{ChannelState, CosignerKeys, SettlementAddresses};
use crate::config;

use super::{
    Bundle, ChannelAddress, ChannelOptions, LedgerClient, LedgerError, Seed, SettlementBundle,
    TransferSplit,
};

// ---------------------------------------------------------------------------
// Derivation helpers
// ---------------------------------------------------------------------------

fn signing_key(seed: &Seed) -> SigningKey {
    SigningKey::from_bytes(blake3::hash(seed.expose().as_bytes()).as_bytes())
}

fn public_key_hex(seed: &Seed) -> String {
    hex::encode(signing_key(seed).verifying_key().to_bytes())
}

/// Depth of an address tree provisioned for `limit` transactions.
fn tree_depth(limit: u32) -> u64 {
    u64::from(limit.next_power_of_two().trailing_zeros()).max(1)
}

/// One party's contribution to an address at `index`.
fn party_component(pubkey_hex: &str, index: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(pubkey_hex.as_bytes());
    hasher.update(&index.to_be_bytes());
    *hasher.finalize().as_bytes()
}

/// The 2-of-2 address both parties derive independently.
fn derive_address(master_hex: &str, slave_hex: &str, index: u64) -> Result<String, LedgerError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&party_component(master_hex, index));
    hasher.update(&party_component(slave_hex, index));
    let digest = hasher.finalize();

    let hrp = bech32::Hrp::parse(config::ADDRESS_HRP)
        .map_err(|e| LedgerError::Derivation(format!("bad address prefix: {e}")))?;
    bech32::encode::<bech32::Bech32m>(hrp, &digest.as_bytes()[..20])
        .map_err(|e| LedgerError::Derivation(e.to_string()))
}

fn address_digest(address: &str) -> [u8; 32] {
    *blake3::hash(address.as_bytes()).as_bytes()
}

/// Digest a bundle's signatures commit to: spend address, split, and the
/// slot position (so identical payments in different slots stay distinct).
fn bundle_digest(address: &str, split: &TransferSplit, slot: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(address.as_bytes());
    hasher.update(&split.master.to_be_bytes());
    hasher.update(&split.slave.to_be_bytes());
    hasher.update(&(slot as u64).to_be_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

fn sign_hex(key: &SigningKey, payload: &[u8]) -> String {
    hex::encode(key.sign(payload).to_bytes())
}

fn verify_hex(pubkey_hex: &str, payload: &[u8], signature_hex: &str) -> Result<(), LedgerError> {
    let pk_bytes: [u8; 32] = hex::decode(pubkey_hex)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| LedgerError::Signing("malformed public key".to_string()))?;
    let sig_bytes: [u8; 64] = hex::decode(signature_hex)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| LedgerError::Signing("malformed signature".to_string()))?;

    let key = VerifyingKey::from_bytes(&pk_bytes)
        .map_err(|e| LedgerError::Signing(e.to_string()))?;
    key.verify(payload, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| LedgerError::Signing(e.to_string()))
}

/// Confirms the supplied seed really is the party the state says it is.
fn require_key(seed: &Seed, recorded: Option<&String>, party: &str) -> Result<SigningKey, LedgerError> {
    let ours = public_key_hex(seed);
    match recorded {
        Some(expected) if *expected == ours => Ok(signing_key(seed)),
        Some(_) => Err(LedgerError::Signing(format!(
            "seed does not match recorded {party} key"
        ))),
        None => Err(LedgerError::InvalidState(format!(
            "{party} key not recorded in channel state"
        ))),
    }
}

// ---------------------------------------------------------------------------
// SimLedger
// ---------------------------------------------------------------------------

/// The deterministic ledger client used by tests and demos.
#[derive(Default)]
pub struct SimLedger {
    broadcasts: Mutex<Vec<SettlementBundle>>,
}

impl SimLedger {
    /// Creates a sim with an empty broadcast log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settlement bundles "submitted to the ledger" so far. Tests assert
    /// against this instead of a network.
    pub fn broadcasts(&self) -> Vec<SettlementBundle> {
        self.broadcasts.lock().clone()
    }
}

#[async_trait]
impl LedgerClient for SimLedger {
    async fn master_initialize(
        &self,
        seed: &Seed,
        opts: &ChannelOptions,
    ) -> Result<ChannelState, LedgerError> {
        if opts.tx_count_limit == 0 || opts.tx_count_limit > config::MAX_TX_COUNT_LIMIT {
            return Err(LedgerError::InvalidState(format!(
                "tx_count_limit {} outside 1..={}",
                opts.tx_count_limit,
                config::MAX_TX_COUNT_LIMIT
            )));
        }

        Ok(ChannelState {
            version: 0,
            deposit_amount: opts.deposit_amount,
            tx_count_limit: opts.tx_count_limit,
            settlement: SettlementAddresses {
                master: opts.settlement_address.clone(),
                slave: None,
            },
            cosigners: CosignerKeys {
                master: public_key_hex(seed),
                slave: None,
            },
            depth: tree_depth(opts.tx_count_limit),
            // Full channel capacity: both parties deposit the same amount.
            remainder: opts.deposit_amount as i64 * 2,
            ..ChannelState::default()
        })
    }

    async fn slave_co_initialize(
        &self,
        seed: &Seed,
        settlement_address: &str,
        remote: &ChannelState,
    ) -> Result<ChannelState, LedgerError> {
        if remote.cosigners.master.is_empty() {
            return Err(LedgerError::InvalidState(
                "remote state has no master key".to_string(),
            ));
        }
        let ours = public_key_hex(seed);
        if let Some(existing) = &remote.cosigners.slave {
            if *existing != ours {
                return Err(LedgerError::InvalidState(
                    "channel already co-initialized by a different slave".to_string(),
                ));
            }
        }

        let mut state = remote.clone();
        state.cosigners.slave = Some(ours);
        state.settlement.slave = Some(settlement_address.to_string());
        Ok(state)
    }

    async fn master_new_address(
        &self,
        seed: &Seed,
        state: &ChannelState,
    ) -> Result<ChannelState, LedgerError> {
        require_key(seed, Some(&state.cosigners.master), "master")?;
        let slave_hex = state.cosigners.slave.as_ref().ok_or_else(|| {
            LedgerError::InvalidState("cannot derive addresses before co-initialization".to_string())
        })?;

        let mut next = state.clone();
        next.address_index = state.address_index + 1;
        let address = derive_address(&state.cosigners.master, slave_hex, next.address_index)?;
        next.addresses.push(ChannelAddress {
            index: next.address_index,
            address,
            slave_signature: None,
        });
        Ok(next)
    }

    async fn slave_sign_address(
        &self,
        seed: &Seed,
        state: &ChannelState,
    ) -> Result<ChannelState, LedgerError> {
        let key = require_key(seed, state.cosigners.slave.as_ref(), "slave")?;
        let slave_hex = public_key_hex(seed);

        let mut next = state.clone();
        let pending = next
            .addresses
            .iter_mut()
            .rev()
            .find(|a| a.slave_signature.is_none())
            .ok_or_else(|| {
                LedgerError::InvalidState("no pending address to counter-sign".to_string())
            })?;

        // Re-derive before signing: never counter-sign an address we
        // cannot reproduce from our own key material.
        let expected = derive_address(&next.cosigners.master, &slave_hex, pending.index)?;
        if expected != pending.address {
            return Err(LedgerError::Signing(format!(
                "address at index {} does not re-derive",
                pending.index
            )));
        }

        pending.slave_signature = Some(sign_hex(&key, &address_digest(&pending.address)));
        Ok(next)
    }

    async fn master_new_transaction(
        &self,
        seed: &Seed,
        state: &ChannelState,
        split: &TransferSplit,
    ) -> Result<ChannelState, LedgerError> {
        let key = require_key(seed, Some(&state.cosigners.master), "master")?;
        let address = state
            .newest_cosigned_address()
            .ok_or_else(|| {
                LedgerError::InvalidState("no co-signed address to spend from".to_string())
            })?
            .address
            .clone();

        let mut next = state.clone();
        let slot = next.bundles.len();
        let digest = bundle_digest(&address, split, slot);
        let master_signature = sign_hex(&key, digest.as_bytes());
        next.bundles.push(Some(Bundle {
            address,
            split: *split,
            digest,
            master_signature: Some(master_signature),
            slave_signature: None,
        }));
        Ok(next)
    }

    async fn slave_sign_transaction(
        &self,
        seed: &Seed,
        state: &ChannelState,
    ) -> Result<ChannelState, LedgerError> {
        let key = require_key(seed, state.cosigners.slave.as_ref(), "slave")?;

        let mut next = state.clone();
        let mut signed = 0usize;
        for bundle in next.bundles.iter_mut().flatten() {
            if bundle.slave_signature.is_some() {
                continue;
            }
            let master_sig = bundle.master_signature.as_ref().ok_or_else(|| {
                LedgerError::InvalidState("bundle missing master signature".to_string())
            })?;
            // Counter-sign only what the master provably signed first.
            verify_hex(&next.cosigners.master, bundle.digest.as_bytes(), master_sig)?;
            bundle.slave_signature = Some(sign_hex(&key, bundle.digest.as_bytes()));
            signed += 1;
        }

        if signed == 0 {
            return Err(LedgerError::InvalidState(
                "no pending bundle to counter-sign".to_string(),
            ));
        }
        Ok(next)
    }

    async fn settlement_bundle(
        &self,
        state: &ChannelState,
        payout: &SettlementPayout,
    ) -> Result<SettlementBundle, LedgerError> {
        let bundle = state.latest_fully_signed_bundle().ok_or_else(|| {
            LedgerError::InvalidState("no fully-signed bundle to settle".to_string())
        })?;

        // Both signatures must verify; a forged bundle dies here, not on
        // the ledger.
        let master_sig = bundle.master_signature.as_ref().ok_or_else(|| {
            LedgerError::InvalidState("bundle missing master signature".to_string())
        })?;
        verify_hex(&state.cosigners.master, bundle.digest.as_bytes(), master_sig)?;
        let slave_hex = state.cosigners.slave.as_ref().ok_or_else(|| {
            LedgerError::InvalidState("channel was never co-initialized".to_string())
        })?;
        let slave_sig = bundle.slave_signature.as_ref().ok_or_else(|| {
            LedgerError::InvalidState("bundle missing slave signature".to_string())
        })?;
        verify_hex(slave_hex, bundle.digest.as_bytes(), slave_sig)?;

        let encoded = serde_json::to_vec(&(&bundle.digest, payout))
            .map(hex::encode)
            .map_err(|e| LedgerError::Broadcast(e.to_string()))?;

        Ok(SettlementBundle {
            digest: bundle.digest.clone(),
            payout: payout.clone(),
            encoded,
        })
    }

    async fn broadcast_settlement(&self, bundle: &SettlementBundle) -> Result<(), LedgerError> {
        self.broadcasts.lock().push(bundle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ChannelOptions {
        ChannelOptions {
            tx_count_limit: 100,
            deposit_amount: 50,
            settlement_address: "duet1masterpay".to_string(),
        }
    }

    async fn initialized(
        sim: &SimLedger,
        master: &Seed,
        slave: &Seed,
    ) -> ChannelState {
        let state = sim.master_initialize(master, &opts()).await.unwrap();
        sim.slave_co_initialize(slave, "duet1slavepay", &state)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn initialization_records_both_parties() {
        let sim = SimLedger::new();
        let (master, slave) = (Seed::generate(), Seed::generate());
        let state = initialized(&sim, &master, &slave).await;

        assert_eq!(state.cosigners.master, public_key_hex(&master));
        assert_eq!(state.cosigners.slave.as_deref(), Some(public_key_hex(&slave).as_str()));
        assert_eq!(state.settlement.slave.as_deref(), Some("duet1slavepay"));
        assert_eq!(state.depth, 7); // 100 transactions fit in a depth-7 tree
        assert_eq!(state.remainder, 100);
    }

    #[tokio::test]
    async fn address_handshake_advances_index_by_one() {
        let sim = SimLedger::new();
        let (master, slave) = (Seed::generate(), Seed::generate());
        let state = initialized(&sim, &master, &slave).await;

        let pending = sim.master_new_address(&master, &state).await.unwrap();
        assert_eq!(pending.address_index, state.address_index + 1);
        assert_eq!(pending.addresses.len(), 1);
        assert!(!pending.addresses[0].is_cosigned());

        let signed = sim.slave_sign_address(&slave, &pending).await.unwrap();
        assert!(signed.addresses[0].is_cosigned());
        // Address derivation is deterministic across both parties.
        assert_eq!(signed.addresses[0].address, pending.addresses[0].address);
    }

    #[tokio::test]
    async fn wrong_seed_cannot_sign() {
        let sim = SimLedger::new();
        let (master, slave) = (Seed::generate(), Seed::generate());
        let state = initialized(&sim, &master, &slave).await;
        let pending = sim.master_new_address(&master, &state).await.unwrap();

        // An imposter seed fails the key check on both paths.
        let imposter = Seed::generate();
        assert!(sim.master_new_address(&imposter, &state).await.is_err());
        assert!(sim.slave_sign_address(&imposter, &pending).await.is_err());
    }

    #[tokio::test]
    async fn transaction_bundle_is_verifiably_cosigned() {
        let sim = SimLedger::new();
        let (master, slave) = (Seed::generate(), Seed::generate());
        let state = initialized(&sim, &master, &slave).await;

        let state = sim.master_new_address(&master, &state).await.unwrap();
        let state = sim.slave_sign_address(&slave, &state).await.unwrap();

        let split = TransferSplit { master: 0, slave: 10 };
        let proposed = sim
            .master_new_transaction(&master, &state, &split)
            .await
            .unwrap();
        assert_eq!(proposed.occupied_bundles(), 1);
        assert!(proposed.latest_fully_signed_bundle().is_none());

        let signed = sim.slave_sign_transaction(&slave, &proposed).await.unwrap();
        let bundle = signed.latest_fully_signed_bundle().unwrap();
        assert!(bundle.is_fully_signed());

        // Tampering with the digest breaks counter-signing.
        let mut forged = proposed.clone();
        if let Some(Some(b)) = forged.bundles.first_mut() {
            b.digest = bundle_digest(&b.address, &TransferSplit { master: 99, slave: 0 }, 0);
        }
        assert!(sim.slave_sign_transaction(&slave, &forged).await.is_err());
    }

    #[tokio::test]
    async fn transaction_requires_cosigned_address() {
        let sim = SimLedger::new();
        let (master, slave) = (Seed::generate(), Seed::generate());
        let state = initialized(&sim, &master, &slave).await;

        let split = TransferSplit { master: 0, slave: 10 };
        assert!(sim
            .master_new_transaction(&master, &state, &split)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn settlement_verifies_and_records_broadcast() {
        let sim = SimLedger::new();
        let (master, slave) = (Seed::generate(), Seed::generate());
        let state = initialized(&sim, &master, &slave).await;
        let state = sim.master_new_address(&master, &state).await.unwrap();
        let state = sim.slave_sign_address(&slave, &state).await.unwrap();
        let state = sim
            .master_new_transaction(&master, &state, &TransferSplit { master: 0, slave: 10 })
            .await
            .unwrap();
        let state = sim.slave_sign_transaction(&slave, &state).await.unwrap();

        let payout = SettlementPayout {
            master: 40,
            slave: 60,
            master_address: state.settlement.master.clone(),
            slave_address: state.settlement.slave.clone(),
        };
        let settlement = sim.settlement_bundle(&state, &payout).await.unwrap();
        sim.broadcast_settlement(&settlement).await.unwrap();

        let log = sim.broadcasts();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].digest, settlement.digest);
    }

    #[test]
    fn depth_scales_with_tx_limit() {
        assert_eq!(tree_depth(1), 1);
        assert_eq!(tree_depth(2), 1);
        assert_eq!(tree_depth(100), 7);
        assert_eq!(tree_depth(1024), 10);
    }
}
