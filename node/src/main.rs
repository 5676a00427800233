// Copyright (c) 2026 DUET Maintainers. MIT License.
// See LICENSE for details.

//! # DUET Node
//!
//! Entry point for the `duet-node` binary. Parses CLI arguments,
//! initializes logging and metrics, and runs one of:
//!
//! - `relay`   — the signaling relay peers discover each other through
//! - `open`    — a channel party in a room (creator or joiner)
//! - `version` — print build version information

mod cli;
mod driver;
mod logging;
mod metrics;
mod relay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use duet_protocol::channel::{ChannelConfig, ChannelProtocol};
use duet_protocol::ledger::sim::SimLedger;
use duet_protocol::ledger::ChannelOptions;
use duet_protocol::store::SessionStore;
use duet_protocol::transport::tcp::TcpSignaling;
use duet_protocol::transport::{PeerTransport, TransportConfig};

use cli::{Commands, DuetNodeCli};
use logging::LogFormat;
use metrics::RelayMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DuetNodeCli::parse();

    match cli.command {
        Commands::Relay(args) => run_relay(args).await,
        Commands::Open(args) => open_room(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Runs the signaling relay plus its metrics/status HTTP endpoint.
async fn run_relay(args: cli::RelayArgs) -> Result<()> {
    logging::init_logging(
        "duet_node=info,duet_protocol=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    let state = relay::RelayState::new(RelayMetrics::new());

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", args.listen))?;
    tracing::info!(listen = %args.listen, "relay listening");

    let shared_metrics: metrics::SharedMetrics = Arc::new(state.metrics.clone());
    let http = axum::Router::new()
        .route("/status", axum::routing::get(relay::status_handler))
        .with_state(Arc::clone(&state))
        .merge(
            axum::Router::new()
                .route("/metrics", axum::routing::get(metrics::metrics_handler))
                .with_state(shared_metrics),
        );

    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    tokio::select! {
        res = relay::serve(listener, Arc::clone(&state)) => {
            if let Err(e) = res {
                tracing::error!("relay error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, http) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    tracing::info!("relay stopped");
    Ok(())
}

/// Joins (or creates) a room and hands control to the stdin driver.
async fn open_room(args: cli::OpenArgs) -> Result<()> {
    logging::init_logging(
        "duet_node=info,duet_protocol=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    // --- Session store ---
    let data_dir = expand_home(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    let store = SessionStore::open(data_dir.join("rooms"))
        .with_context(|| format!("failed to open session store in {}", data_dir.display()))?;

    // --- Transport ---
    let signaling = Arc::new(TcpSignaling::new(args.relay.clone()));
    let (transport, events) =
        PeerTransport::connect(signaling, &args.room, TransportConfig::default())
            .await
            .with_context(|| format!("failed to reach relay at {}", args.relay))?;
    tracing::info!(peer = %transport.local_id(), relay = %args.relay, "connected");

    // --- Channel session ---
    // The simulated ledger stands in until a production ledger client is
    // wired up; the coordination protocol is identical either way.
    let ledger = Arc::new(SimLedger::new());
    let cfg = ChannelConfig::new(&args.room, &args.settlement_address);
    let handle = ChannelProtocol::spawn(cfg, transport, events, ledger, store)?;

    if args.create {
        let state = handle
            .init_room(ChannelOptions {
                tx_count_limit: args.tx_limit,
                deposit_amount: args.deposit_amount,
                settlement_address: args.settlement_address.clone(),
            })
            .await?;
        println!(
            "room {:?} created: deposit {} per party, {} transactions provisioned",
            args.room, state.deposit_amount, state.tx_count_limit
        );
    } else {
        println!(
            "joined room {:?}; waiting for the creator's announcement if this is a first visit",
            args.room
        );
    }

    driver::run(handle).await
}

/// Prints version information to stdout.
fn print_version() {
    println!("duet-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol  {}", duet_protocol::config::PROTOCOL_VERSION);
}

/// Expands a leading `~` to the user's home directory.
fn expand_home(path: &std::path::Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
