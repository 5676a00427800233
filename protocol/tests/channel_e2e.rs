//! End-to-end integration tests for the DUET channel protocol.
//!
//! These tests run two complete peers — transport, protocol state
//! machine, session store, simulated ledger — against an in-process
//! signaling hub and drive full handshakes through real message passing.
//! They prove the components compose: slot probing, discovery, room
//! initialization, both transaction paths, deposits, timeout behavior,
//! and close settlement.
//!
//! Each test stands alone with its own hub, temporary stores, and room.
//! No shared state, no test ordering dependencies, no flaky failures.

use std::sync::Arc;
use std::time::Duration;

use duet_protocol::channel::{
    ChannelConfig, ChannelError, ChannelHandle, ChannelProtocol, ChannelSnapshot, Role,
    TransferDirection,
};
use duet_protocol::ledger::sim::SimLedger;
use duet_protocol::ledger::ChannelOptions;
use duet_protocol::store::SessionStore;
use duet_protocol::transport::memory::MemoryHub;
use duet_protocol::transport::{PeerId, PeerTransport, TransportConfig};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Transport tuned for test speed: tight rediscovery, quick reconnect.
fn fast_transport() -> TransportConfig {
    TransportConfig {
        probe_window: 5,
        rediscovery_interval: Duration::from_millis(25),
        reconnect_delay: Duration::from_millis(25),
    }
}

/// One fully wired peer: transport, protocol, temp store, sim ledger.
struct Peer {
    handle: ChannelHandle,
    ledger: Arc<SimLedger>,
    store: SessionStore,
}

async fn spawn_peer(hub: &MemoryHub, room: &str, settlement: &str, timeout: Duration) -> Peer {
    let ledger = Arc::new(SimLedger::new());
    let store = SessionStore::open_temporary().expect("temp store");
    let (transport, events) =
        PeerTransport::connect(Arc::new(hub.clone()), room, fast_transport())
            .await
            .expect("claim identity");

    let mut cfg = ChannelConfig::new(room, settlement);
    cfg.handshake_timeout = timeout;
    let handle = ChannelProtocol::spawn(cfg, transport, events, ledger.clone(), store.clone())
        .expect("spawn protocol");

    Peer {
        handle,
        ledger,
        store,
    }
}

fn opts(deposit_amount: u64) -> ChannelOptions {
    ChannelOptions {
        tx_count_limit: 100,
        deposit_amount,
        settlement_address: "duet1masterpay".to_string(),
    }
}

/// Polls snapshots until `pred` holds or five seconds pass.
async fn wait_for(
    handle: &ChannelHandle,
    what: &str,
    pred: impl Fn(&ChannelSnapshot) -> bool,
) -> ChannelSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snap = handle.snapshot().await.expect("session alive");
        if pred(&snap) {
            return snap;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}; last snapshot: {snap:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Spins up a room with an initialized master and a co-initialized slave,
/// and waits until the master has adopted the slave's echo (so both ends
/// hold the merged state).
async fn establish_room(hub: &MemoryHub, room: &str, deposit: u64) -> (Peer, Peer) {
    let master = spawn_peer(hub, room, "duet1masterpay", Duration::from_secs(5)).await;
    master
        .handle
        .init_room(opts(deposit))
        .await
        .expect("init room");

    let slave = spawn_peer(hub, room, "duet1slavepay", Duration::from_secs(5)).await;

    wait_for(&slave.handle, "slave co-initialization", |s| {
        s.role == Some(Role::Slave) && s.state.is_some()
    })
    .await;
    wait_for(&master.handle, "master adopting the echo", |s| {
        s.state
            .as_ref()
            .is_some_and(|st| st.cosigners.slave.is_some())
    })
    .await;

    (master, slave)
}

// ---------------------------------------------------------------------------
// 1. Room Initialization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn join_co_initializes_and_echoes() {
    let hub = MemoryHub::new();
    let (master, slave) = establish_room(&hub, "room-init", 50).await;

    let m = master.handle.snapshot().await.unwrap();
    let s = slave.handle.snapshot().await.unwrap();

    assert_eq!(m.role, Some(Role::Master));
    assert_eq!(s.role, Some(Role::Slave));

    let m_state = m.state.unwrap();
    let s_state = s.state.unwrap();

    // Both sessions report untouched stakes and totals after the opening
    // exchange.
    for state in [&m_state, &s_state] {
        assert_eq!(state.stake.master, 0);
        assert_eq!(state.stake.slave, 0);
        assert_eq!(state.total.master, 0);
        assert_eq!(state.total.slave, 0);
        assert_eq!(state.deposit_amount, 50);
    }

    // The merged state carries both settlement addresses and both keys.
    assert_eq!(s_state.settlement.master, "duet1masterpay");
    assert_eq!(s_state.settlement.slave.as_deref(), Some("duet1slavepay"));
    assert_eq!(m_state.cosigners.slave, s_state.cosigners.slave);

    // Both peers persisted their sessions.
    assert!(master.store.load("room-init").unwrap().is_some());
    assert!(slave.store.load("room-init").unwrap().is_some());
}

#[tokio::test]
async fn slots_are_assigned_by_probing() {
    let hub = MemoryHub::new();
    let first = spawn_peer(&hub, "room-slots", "duet1a", Duration::from_secs(5)).await;
    let second = spawn_peer(&hub, "room-slots", "duet1b", Duration::from_secs(5)).await;

    // The hub has both registered under distinct slots.
    assert_eq!(hub.registered(), 2);
    drop((first, second));
}

// ---------------------------------------------------------------------------
// 2. Deposits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deposits_apply_locally_and_propagate() {
    let hub = MemoryHub::new();
    let (master, slave) = establish_room(&hub, "room-deposit", 50).await;

    let after = master.handle.deposit().await.expect("master deposit");
    assert_eq!(after.stake.master, 50);
    assert_eq!(after.stake.slave, 0);
    assert_eq!(after.total.master, 0);

    // The counterparty validates and adopts the broadcast state.
    wait_for(&slave.handle, "slave seeing master stake", |s| {
        s.state.as_ref().is_some_and(|st| st.stake.master == 50)
    })
    .await;

    let after = slave.handle.deposit().await.expect("slave deposit");
    assert_eq!(after.stake.slave, 50);
    wait_for(&master.handle, "master seeing slave stake", |s| {
        s.state.as_ref().is_some_and(|st| st.stake.slave == 50)
    })
    .await;

    // Depositing twice is refused.
    let again = master.handle.deposit().await;
    assert!(matches!(again, Err(ChannelError::InvalidState { .. })));
    let snap = master.handle.snapshot().await.unwrap();
    assert!(snap.full_deposit_made);
}

// ---------------------------------------------------------------------------
// 3. Master-Initiated Transactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn master_transfer_moves_totals_and_appends_one_bundle() {
    let hub = MemoryHub::new();
    let (master, slave) = establish_room(&hub, "room-mtx", 50).await;

    let before = master.handle.snapshot().await.unwrap().state.unwrap();
    let after = master
        .handle
        .transfer(10, TransferDirection::ToSlave)
        .await
        .expect("transfer");

    // Totals shift by the amount and stay conserved.
    assert_eq!(after.total.master, before.total.master - 10);
    assert_eq!(after.total.slave, before.total.slave + 10);
    assert_eq!(after.total.sum(), before.total.sum());

    // Exactly one new bundle, fully signed, and the address handshake ran
    // implicitly first (cursor advanced by one).
    assert_eq!(after.occupied_bundles(), 1);
    assert!(after.latest_fully_signed_bundle().is_some());
    assert_eq!(after.address_index, before.address_index + 1);
    assert_eq!(after.remainder, before.remainder - 20);

    // The slave committed the identical co-signed state.
    let s = wait_for(&slave.handle, "slave holding co-signed state", |s| {
        s.state.as_ref().is_some_and(|st| st.version == after.version)
    })
    .await;
    let s_state = s.state.unwrap();
    assert_eq!(s_state.occupied_bundles(), 1);
    assert_eq!(s_state.total, after.total);
}

#[tokio::test]
async fn repeated_transfers_derive_fresh_addresses() {
    let hub = MemoryHub::new();
    let (master, _slave) = establish_room(&hub, "room-repeat", 50).await;

    let first = master
        .handle
        .transfer(10, TransferDirection::ToSlave)
        .await
        .expect("first transfer");
    let second = master
        .handle
        .transfer(5, TransferDirection::ToMaster)
        .await
        .expect("second transfer");

    assert_eq!(second.address_index, 2);
    assert_eq!(second.occupied_bundles(), 2);
    assert_eq!(second.total.master, -5);
    assert_eq!(second.total.slave, 5);
    assert_eq!(second.remainder, first.remainder - 10);
}

#[tokio::test]
async fn transfer_beyond_capacity_is_refused() {
    let hub = MemoryHub::new();
    let (master, _slave) = establish_room(&hub, "room-cap", 50).await;

    // Capacity is deposit * 2 = 100; a transfer of `amount` reserves
    // double, so 51 cannot fit.
    let result = master.handle.transfer(51, TransferDirection::ToSlave).await;
    assert!(matches!(
        result,
        Err(ChannelError::InsufficientCapacity { needed: 102, .. })
    ));

    // Nothing moved.
    let snap = master.handle.snapshot().await.unwrap().state.unwrap();
    assert_eq!(snap.occupied_bundles(), 0);
    assert_eq!(snap.remainder, 100);
}

// ---------------------------------------------------------------------------
// 4. Slave-Initiated Paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slave_requested_transfer_pays_the_master() {
    let hub = MemoryHub::new();
    let (master, slave) = establish_room(&hub, "room-stx", 50).await;

    let after = slave
        .handle
        .transfer(5, TransferDirection::ToMaster)
        .await
        .expect("slave transfer");

    // The requester pays: master gains, slave loses.
    assert_eq!(after.total.master, 5);
    assert_eq!(after.total.slave, -5);
    assert_eq!(after.occupied_bundles(), 1);

    // The master, who autonomously originated the handshake, holds the
    // same totals.
    wait_for(&master.handle, "master totals", |s| {
        s.state
            .as_ref()
            .is_some_and(|st| st.total.master == 5 && st.total.slave == -5)
    })
    .await;
}

#[tokio::test]
async fn slave_cannot_originate_toward_itself() {
    let hub = MemoryHub::new();
    let (_master, slave) = establish_room(&hub, "room-sdir", 50).await;

    let result = slave.handle.transfer(5, TransferDirection::ToSlave).await;
    assert!(matches!(result, Err(ChannelError::RoleMismatch { .. })));
}

#[tokio::test]
async fn slave_requested_address_advances_cursor_once() {
    let hub = MemoryHub::new();
    let (master, slave) = establish_room(&hub, "room-saddr", 50).await;

    let after = slave.handle.create_address().await.expect("create address");
    assert_eq!(after.address_index, 1);
    assert_eq!(after.addresses.len(), 1);
    assert!(after.addresses[0].is_cosigned());

    wait_for(&master.handle, "master cursor", |s| {
        s.state.as_ref().is_some_and(|st| st.address_index == 1)
    })
    .await;
}

// ---------------------------------------------------------------------------
// 5. Exchange Discipline
// ---------------------------------------------------------------------------

use duet_protocol::ledger::{LedgerClient, Seed};
use duet_protocol::transport::{ClaimedSlot, Signaling, SignalingEvent};
use duet_protocol::wire::ChannelMessage;

/// A counterparty that completes co-initialization by hand and then never
/// answers anything again: the silent peer every timeout path is written
/// for.
async fn co_init_then_mute(hub: &MemoryHub, room: &str) -> ClaimedSlot {
    let mut claimed = hub
        .claim(&PeerId::new(room, 1))
        .await
        .expect("claim mute slot");
    let _ = claimed.handle.dial(&PeerId::new(room, 0)).await;

    let ledger = SimLedger::new();
    let seed = Seed::generate();
    loop {
        match claimed.events.recv().await.expect("hub event") {
            SignalingEvent::Message { from, payload } => {
                if let Ok(ChannelMessage::FlashState { channel_state }) =
                    ChannelMessage::decode(&payload)
                {
                    let mut merged = ledger
                        .slave_co_initialize(&seed, "duet1mutepay", &channel_state)
                        .await
                        .expect("co-init");
                    merged.version = channel_state.version + 1;
                    claimed
                        .handle
                        .send(
                            &from,
                            ChannelMessage::FlashState {
                                channel_state: merged,
                            }
                            .encode(),
                        )
                        .await
                        .expect("echo");
                    return claimed;
                }
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn second_exchange_while_pending_is_rejected() {
    let hub = MemoryHub::new();
    let master = spawn_peer(&hub, "room-busy", "duet1m", Duration::from_secs(3)).await;
    master.handle.init_room(opts(50)).await.expect("init");

    let _mute = co_init_then_mute(&hub, "room-busy").await;
    wait_for(&master.handle, "co-init echo adopted", |s| {
        s.state
            .as_ref()
            .is_some_and(|st| st.cosigners.slave.is_some())
    })
    .await;

    // First exchange hangs against the mute peer...
    let first = {
        let handle = master.handle.clone();
        tokio::spawn(async move { handle.create_address().await })
    };
    wait_for(&master.handle, "exchange in flight", |s| {
        s.phase == duet_protocol::channel::ChannelPhase::Transacting
    })
    .await;

    // ...so a second one must fail loudly instead of corrupting state.
    let second = master.handle.create_address().await;
    assert!(matches!(second, Err(ChannelError::ExchangeInFlight { .. })));

    // The first eventually times out on its own.
    let first = first.await.unwrap();
    assert!(matches!(first, Err(ChannelError::HandshakeTimeout { .. })));
}

#[tokio::test]
async fn timeout_leaves_persisted_state_untouched() {
    let hub = MemoryHub::new();
    let master = spawn_peer(&hub, "room-tmo", "duet1m", Duration::from_millis(300)).await;
    master.handle.init_room(opts(50)).await.expect("init");

    let _mute = co_init_then_mute(&hub, "room-tmo").await;
    let before = wait_for(&master.handle, "co-init echo adopted", |s| {
        s.state
            .as_ref()
            .is_some_and(|st| st.cosigners.slave.is_some())
    })
    .await
    .state
    .unwrap();

    // signAddress goes out, nothing ever comes back.
    let result = master.handle.create_address().await;
    match result {
        Err(ChannelError::HandshakeTimeout { timeout_ms, .. }) => {
            assert_eq!(timeout_ms, 300);
        }
        other => panic!("expected HandshakeTimeout, got {other:?}"),
    }

    // The address cursor never advanced and nothing was persisted.
    let after = master.handle.snapshot().await.unwrap().state.unwrap();
    assert_eq!(after.address_index, before.address_index);
    assert_eq!(after.version, before.version);
    assert!(after.addresses.is_empty());

    let stored = master.store.load("room-tmo").unwrap().unwrap();
    assert_eq!(stored.channel_state.unwrap().version, before.version);
}

#[tokio::test]
async fn counterparty_disconnect_cancels_the_exchange() {
    let hub = MemoryHub::new();
    // A generous deadline, so the only thing that can fail the exchange
    // here is the disconnect itself.
    let master = spawn_peer(&hub, "room-gone", "duet1m", Duration::from_secs(30)).await;
    master.handle.init_room(opts(50)).await.expect("init");

    let mute = co_init_then_mute(&hub, "room-gone").await;
    wait_for(&master.handle, "co-init echo adopted", |s| {
        s.state
            .as_ref()
            .is_some_and(|st| st.cosigners.slave.is_some())
    })
    .await;

    let pending = {
        let handle = master.handle.clone();
        tokio::spawn(async move { handle.create_address().await })
    };
    wait_for(&master.handle, "exchange in flight", |s| {
        s.phase == duet_protocol::channel::ChannelPhase::Transacting
    })
    .await;

    // The counterparty vanishes mid-handshake; the exchange fails now,
    // not thirty seconds from now.
    mute.handle.close().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ChannelError::PeerUnavailable { .. })));

    // No partial state was applied.
    let after = master.handle.snapshot().await.unwrap().state.unwrap();
    assert_eq!(after.address_index, 0);
    assert!(after.addresses.is_empty());
}

#[tokio::test]
async fn transfer_without_a_peer_fails_fast() {
    let hub = MemoryHub::new();
    let master = spawn_peer(&hub, "room-alone", "duet1m", Duration::from_secs(3)).await;
    master.handle.init_room(opts(50)).await.expect("init");

    let result = master.handle.transfer(10, TransferDirection::ToSlave).await;
    assert!(matches!(result, Err(ChannelError::PeerUnavailable { .. })));
}

// ---------------------------------------------------------------------------
// 6. Close & Settlement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_settles_the_newest_bundle_and_destroys_the_session() {
    let hub = MemoryHub::new();
    let (master, slave) = establish_room(&hub, "room-close", 50).await;

    master
        .handle
        .transfer(10, TransferDirection::ToSlave)
        .await
        .expect("transfer");

    let report = master.handle.close().await.expect("close");

    // remainder after one 10-transfer is 80; each side gets half on top
    // of its running total.
    assert_eq!(report.payout.master, -10 + 40);
    assert_eq!(report.payout.slave, 10 + 40);
    assert_eq!(report.payout.master_address, "duet1masterpay");

    // Exactly one settlement reached the (simulated) ledger.
    let broadcasts = master.ledger.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].digest, report.bundle_digest);

    // The session record is gone and the channel refuses further work.
    assert!(master.store.load("room-close").unwrap().is_none());
    let refused = master.handle.transfer(1, TransferDirection::ToSlave).await;
    assert!(matches!(refused, Err(ChannelError::ChannelClosed)));

    drop(slave);
}

#[tokio::test]
async fn close_without_any_signed_bundle_is_refused() {
    let hub = MemoryHub::new();
    let (master, _slave) = establish_room(&hub, "room-close-empty", 50).await;

    let result = master.handle.close().await;
    assert!(matches!(result, Err(ChannelError::InvalidState { .. })));

    // Session survives a refused close.
    assert!(master.store.load("room-close-empty").unwrap().is_some());
}

// ---------------------------------------------------------------------------
// 7. Signaling Resilience
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signaling_drop_reconnects_without_losing_the_room() {
    let hub = MemoryHub::new();
    let (master, slave) = establish_room(&hub, "room-drop", 50).await;

    // The relay loses the master's connection. The master re-claims its
    // slot; the slave sees a departure and redials.
    hub.sever(&PeerId::new("room-drop", 0));

    wait_for(&slave.handle, "slave relinked to master", |s| {
        !s.peers.is_empty()
    })
    .await;
    wait_for(&master.handle, "master still sees the slave", |s| {
        !s.peers.is_empty()
    })
    .await;

    // The channel keeps working across the reconnect.
    let after = master
        .handle
        .transfer(10, TransferDirection::ToSlave)
        .await
        .expect("transfer after reconnect");
    assert_eq!(after.total.slave, 10);
}

// ---------------------------------------------------------------------------
// 8. Restart Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a_restarted_peer_resumes_its_session() {
    let hub = MemoryHub::new();
    let dir = tempfile::tempdir().unwrap();

    // First life: create the room on a disk-backed store, then vanish.
    {
        let ledger = Arc::new(SimLedger::new());
        let store = SessionStore::open(dir.path()).unwrap();
        let (transport, events) =
            PeerTransport::connect(Arc::new(hub.clone()), "room-restart", fast_transport())
                .await
                .unwrap();
        let handle = ChannelProtocol::spawn(
            ChannelConfig::new("room-restart", "duet1m"),
            transport,
            events,
            ledger,
            store,
        )
        .unwrap();
        handle.init_room(opts(50)).await.expect("init");
        handle.shutdown().await;
    }

    // Second life: same store, same room. The session comes back with
    // role and state intact.
    let ledger = Arc::new(SimLedger::new());
    let store = SessionStore::open(dir.path()).unwrap();
    let (transport, events) =
        PeerTransport::connect(Arc::new(hub.clone()), "room-restart", fast_transport())
            .await
            .unwrap();
    let handle = ChannelProtocol::spawn(
        ChannelConfig::new("room-restart", "duet1m"),
        transport,
        events,
        ledger,
        store,
    )
    .unwrap();

    let snap = handle.snapshot().await.unwrap();
    assert_eq!(snap.role, Some(Role::Master));
    assert_eq!(snap.state.unwrap().deposit_amount, 50);

    // And a second init is refused — the session already exists.
    let again = handle.init_room(opts(50)).await;
    assert!(matches!(again, Err(ChannelError::InvalidState { .. })));
}
