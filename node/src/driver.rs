//! # Interactive Room Driver
//!
//! A thin stdin command loop over a [`ChannelHandle`]. This is the whole
//! presentation layer: the protocol neither knows nor cares that a human
//! is on the other end of the handle.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use duet_protocol::channel::{ChannelHandle, Role, TransferDirection};

const HELP: &str = "\
commands:
  state                     show the channel snapshot
  deposit                   commit this party's deposit
  pay <amount> [to-master|to-slave]
                            run a transaction handshake (default: pay the
                            counterparty)
  address                   run an address-creation handshake
  close                     settle the channel and destroy the session
  help                      this text
  quit                      leave (the session persists for next time)";

/// Runs the command loop until EOF or `quit`.
pub async fn run(handle: ChannelHandle) -> Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        match parts.next() {
            None => continue,
            Some("help") => println!("{HELP}"),
            Some("quit") | Some("exit") => break,

            Some("state") => match handle.snapshot().await {
                Ok(snap) => {
                    println!("role    : {}", snap.role.map_or("unassigned".to_string(), |r| r.to_string()));
                    println!("phase   : {}", snap.phase);
                    println!("peers   : {}", snap.peers.len());
                    println!("deposit : {}", if snap.full_deposit_made { "made" } else { "pending" });
                    match snap.state {
                        Some(state) => {
                            println!("version : {}", state.version);
                            println!("stake   : master {} / slave {}", state.stake.master, state.stake.slave);
                            println!("total   : master {} / slave {}", state.total.master, state.total.slave);
                            println!("capacity: {} remaining", state.remainder);
                            println!("cursor  : index {} depth {}", state.address_index, state.depth);
                            println!("bundles : {} signed", state.occupied_bundles());
                        }
                        None => println!("(no channel state yet — waiting for the room creator)"),
                    }
                }
                Err(e) => println!("error: {e}"),
            },

            Some("deposit") => match handle.deposit().await {
                Ok(state) => println!(
                    "deposit applied; stake now master {} / slave {}",
                    state.stake.master, state.stake.slave
                ),
                Err(e) => println!("error: {e}"),
            },

            Some("pay") => {
                let Some(amount) = parts.next().and_then(|a| a.parse::<u64>().ok()) else {
                    println!("usage: pay <amount> [to-master|to-slave]");
                    continue;
                };
                let direction = match parts.next() {
                    Some("to-master") => TransferDirection::ToMaster,
                    Some("to-slave") => TransferDirection::ToSlave,
                    Some(other) => {
                        println!("unknown direction {other:?}; use to-master or to-slave");
                        continue;
                    }
                    // Paying is the common case: default to paying the
                    // counterparty, whoever we are.
                    None => match handle.snapshot().await.map(|s| s.role) {
                        Ok(Some(Role::Master)) => TransferDirection::ToSlave,
                        _ => TransferDirection::ToMaster,
                    },
                };
                match handle.transfer(amount, direction).await {
                    Ok(state) => println!(
                        "transaction co-signed; total now master {} / slave {}",
                        state.total.master, state.total.slave
                    ),
                    Err(e) => println!("error: {e}"),
                }
            }

            Some("address") => match handle.create_address().await {
                Ok(state) => println!("address ready; cursor at {}", state.address_index),
                Err(e) => println!("error: {e}"),
            },

            Some("close") => match handle.close().await {
                Ok(report) => {
                    println!("channel settled (bundle {})", report.bundle_digest);
                    println!(
                        "payout: master {} -> {}",
                        report.payout.master, report.payout.master_address
                    );
                    println!(
                        "payout: slave  {} -> {}",
                        report.payout.slave,
                        report.payout.slave_address.as_deref().unwrap_or("(none)")
                    );
                }
                Err(e) => println!("error: {e}"),
            },

            Some(other) => println!("unknown command {other:?}; try \"help\""),
        }
    }

    handle.shutdown().await;
    Ok(())
}
