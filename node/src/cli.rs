//! # CLI Interface
//!
//! Defines the command-line argument structure for `duet-node` using
//! `clap` derive. Supports three subcommands: `relay`, `open`, and
//! `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// DUET channel peer and signaling relay.
///
/// Run `relay` to host the signaling service a room's peers meet through,
/// or `open` to join a room as a channel party. Room identifiers are the
/// only namespace: two peers pointing `open` at the same relay and room
/// find each other automatically.
#[derive(Parser, Debug)]
#[command(
    name = "duet-node",
    about = "DUET bilateral payment channel node",
    version,
    propagate_version = true
)]
pub struct DuetNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the DUET node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the signaling relay peers discover each other through.
    Relay(RelayArgs),
    /// Open a room as a channel party (creator or joiner).
    Open(OpenArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `relay` subcommand.
#[derive(Parser, Debug)]
pub struct RelayArgs {
    /// Address the relay listens on for peer connections.
    #[arg(long, env = "DUET_RELAY_LISTEN", default_value = "0.0.0.0:9630")]
    pub listen: String,

    /// Port for the Prometheus metrics and status endpoint.
    #[arg(long, env = "DUET_METRICS_PORT", default_value_t = 9631)]
    pub metrics_port: u16,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "DUET_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `open` subcommand.
#[derive(Parser, Debug)]
pub struct OpenArgs {
    /// Room identifier. Both the discovery namespace and the local
    /// persistence key.
    #[arg(long, env = "DUET_ROOM")]
    pub room: String,

    /// Address of the signaling relay.
    #[arg(long, env = "DUET_RELAY", default_value = "127.0.0.1:9630")]
    pub relay: String,

    /// This party's settlement address, where its share lands at close.
    #[arg(long, env = "DUET_SETTLEMENT_ADDRESS")]
    pub settlement_address: String,

    /// Create the room (become the master). Without this flag the peer
    /// waits to co-initialize from the creator's announcement.
    #[arg(long)]
    pub create: bool,

    /// Deposit each party commits. Only meaningful with --create.
    #[arg(long, default_value_t = 50)]
    pub deposit_amount: u64,

    /// Maximum number of transactions to provision for. Only meaningful
    /// with --create.
    #[arg(long, default_value_t = 100)]
    pub tx_limit: u32,

    /// Directory for the local session store.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "DUET_DATA_DIR", default_value = "~/.duet")]
    pub data_dir: PathBuf,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "DUET_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}
