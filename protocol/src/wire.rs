//! # Channel Wire Format
//!
//! The message envelope peers exchange over the transport: JSON objects
//! with one top-level `cmd` field selecting the variant, camelCase payload
//! keys. The transport moves these as opaque bytes; this module is the
//! only place that encodes or decodes them.
//!
//! ## Command Index
//!
//! | cmd                     | direction      | payload              |
//! |-------------------------|----------------|----------------------|
//! | `flashState`            | either         | full channel state   |
//! | `signAddress`           | master → slave | state, pending addr  |
//! | `signAddressResult`     | slave → master | state, co-signed     |
//! | `createAddress`         | slave → master | —                    |
//! | `signTransaction`       | master → slave | state, pending tx    |
//! | `signTransactionResult` | slave → master | state, co-signed     |
//! | `createTransaction`     | slave → master | amount               |
//!
//! The asymmetry is the protocol: the master originates every signing
//! exchange, so the slave's only request forms are the two bare
//! `create*` commands that ask the master to originate on its behalf.

use serde::{Deserialize, Serialize};

use crate::channel::state::ChannelState;

/// A malformed or unserializable channel message.
#[derive(Debug, thiserror::Error)]
#[error("malformed channel message: {0}")]
pub struct WireError(#[from] serde_json::Error);

/// One peer-to-peer protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum ChannelMessage {
    /// Full-state announcement: sent by the master to newly joined peers
    /// and by either side after a local-only mutation (deposit).
    #[serde(rename_all = "camelCase")]
    FlashState {
        /// The announcing peer's committed state.
        channel_state: ChannelState,
    },

    /// Master asks the slave to counter-sign a freshly derived address.
    #[serde(rename_all = "camelCase")]
    SignAddress {
        /// State carrying the pending address.
        channel_state: ChannelState,
    },

    /// Slave returns the co-signed address state.
    #[serde(rename_all = "camelCase")]
    SignAddressResult {
        /// State with the address counter-signed.
        channel_state: ChannelState,
    },

    /// Slave asks the master to originate an address-creation handshake
    /// (signing order requires the master to go first).
    CreateAddress,

    /// Master asks the slave to counter-sign a transaction proposal.
    #[serde(rename_all = "camelCase")]
    SignTransaction {
        /// State carrying the master-signed bundle.
        channel_state: ChannelState,
    },

    /// Slave returns the counter-signed transaction state.
    #[serde(rename_all = "camelCase")]
    SignTransactionResult {
        /// State with the bundle fully signed.
        channel_state: ChannelState,
    },

    /// Slave asks the master to originate a transaction. The direction is
    /// implied: a slave-requested transaction always pays the master.
    CreateTransaction {
        /// Amount the slave is paying.
        amount: u64,
    },
}

impl ChannelMessage {
    /// The wire command tag, for dispatch and logging.
    pub fn cmd(&self) -> &'static str {
        match self {
            ChannelMessage::FlashState { .. } => "flashState",
            ChannelMessage::SignAddress { .. } => "signAddress",
            ChannelMessage::SignAddressResult { .. } => "signAddressResult",
            ChannelMessage::CreateAddress => "createAddress",
            ChannelMessage::SignTransaction { .. } => "signTransaction",
            ChannelMessage::SignTransactionResult { .. } => "signTransactionResult",
            ChannelMessage::CreateTransaction { .. } => "createTransaction",
        }
    }

    /// Serializes for the transport.
    pub fn encode(&self) -> Vec<u8> {
        // Serialization of these enums cannot fail; an empty frame is
        // dropped by the peer's decoder, which is the safe failure mode.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parses an inbound transport frame.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
