//! # The Channel Protocol State Machine
//!
//! One [`ChannelProtocol`] instance drives one session: it owns the
//! session exclusively, consumes a single serialized stream of transport
//! events and local intents, and mediates between the transport, the
//! session store, and the ledger client. Nothing else ever touches the
//! channel state.
//!
//! ## Handshake flows
//!
//! ```text
//! Room initialization              Address creation (master path)
//! ──────────────────               ──────────────────────────────
//! Master            Slave          Master                  Slave
//!   │ flashState      │              │ signAddress           │
//!   ├────────────────►│              ├──────────────────────►│
//!   │ flashState      │              │ signAddressResult     │
//!   │◄────────────────┤              │◄──────────────────────┤
//!
//! Transaction (slave-initiated)
//! ─────────────────────────────
//! Slave                            Master
//!   │ createTransaction{amount}     │
//!   ├──────────────────────────────►│  (master originates the
//!   │ signTransaction               │   normal master path,
//!   │◄──────────────────────────────┤   paying the master)
//!   │ signTransactionResult         │
//!   ├──────────────────────────────►│
//! ```
//!
//! ## Commit discipline
//!
//! Every handshake is all-or-nothing. Proposed states live only in the
//! outbound message and the exchange slot; the session is mutated and
//! persisted exactly once per handshake, when the counter-signed result
//! validates. A timeout, disconnect, or validation failure leaves the
//! persisted state byte-identical to where it started. Persistence always
//! happens before the outbound message that would reveal the new state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config;
use crate::ledger::{ChannelOptions, LedgerClient, Seed, TransferSplit};
use crate::store::SessionStore;
use crate::transport::{PeerId, PeerTransport, TransportEvent};
use crate::wire::ChannelMessage;

use super::error::ChannelError;
use super::exchange::{ExchangeSlot, Replier, ResponseKind};
use super::session::{ChannelPhase, Role, Session};
use super::settlement::{self, CloseReport};
use super::state::{BalancePair, ChannelState};

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Which way value moves in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// The slave pays the master.
    ToMaster,
    /// The master pays the slave.
    ToSlave,
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Room identifier: the namespace key for discovery and persistence.
    pub room_id: String,
    /// This peer's settlement address, used at initialization (master) or
    /// co-initialization (slave).
    pub settlement_address: String,
    /// Deadline for an in-flight exchange.
    pub handshake_timeout: Duration,
}

impl ChannelConfig {
    /// Config with the default handshake deadline.
    pub fn new(room_id: impl Into<String>, settlement_address: impl Into<String>) -> Self {
        ChannelConfig {
            room_id: room_id.into(),
            settlement_address: settlement_address.into(),
            handshake_timeout: config::HANDSHAKE_TIMEOUT,
        }
    }
}

/// A point-in-time view of a session, for display and assertions.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    /// Current lifecycle phase.
    pub phase: ChannelPhase,
    /// This peer's role, once assigned.
    pub role: Option<Role>,
    /// Connected counterparties.
    pub peers: Vec<PeerId>,
    /// Latest committed channel state.
    pub state: Option<ChannelState>,
    /// Whether this peer has made its full deposit.
    pub full_deposit_made: bool,
}

/// User intents, issued through a [`ChannelHandle`].
enum Intent {
    InitRoom {
        opts: ChannelOptions,
        reply: Replier,
    },
    Deposit {
        reply: Replier,
    },
    Transfer {
        amount: u64,
        direction: TransferDirection,
        reply: Replier,
    },
    CreateAddress {
        reply: Replier,
    },
    Close {
        reply: oneshot::Sender<Result<CloseReport, ChannelError>>,
    },
    Inspect {
        reply: oneshot::Sender<ChannelSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle for issuing intents to a running session.
#[derive(Clone)]
pub struct ChannelHandle {
    intents: mpsc::Sender<Intent>,
}

impl ChannelHandle {
    /// Initializes a room as its creator (master).
    pub async fn init_room(&self, opts: ChannelOptions) -> Result<ChannelState, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(Intent::InitRoom { opts, reply: tx })
            .await
            .map_err(|_| ChannelError::SessionTerminated)?;
        rx.await.map_err(|_| ChannelError::SessionTerminated)?
    }

    /// Applies this peer's deposit and broadcasts the new state.
    pub async fn deposit(&self) -> Result<ChannelState, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(Intent::Deposit { reply: tx })
            .await
            .map_err(|_| ChannelError::SessionTerminated)?;
        rx.await.map_err(|_| ChannelError::SessionTerminated)?
    }

    /// Runs a transaction handshake moving `amount` in `direction`.
    pub async fn transfer(
        &self,
        amount: u64,
        direction: TransferDirection,
    ) -> Result<ChannelState, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(Intent::Transfer {
                amount,
                direction,
                reply: tx,
            })
            .await
            .map_err(|_| ChannelError::SessionTerminated)?;
        rx.await.map_err(|_| ChannelError::SessionTerminated)?
    }

    /// Runs an address-creation handshake.
    pub async fn create_address(&self) -> Result<ChannelState, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(Intent::CreateAddress { reply: tx })
            .await
            .map_err(|_| ChannelError::SessionTerminated)?;
        rx.await.map_err(|_| ChannelError::SessionTerminated)?
    }

    /// Settles the channel on the ledger and destroys the session.
    pub async fn close(&self) -> Result<CloseReport, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(Intent::Close { reply: tx })
            .await
            .map_err(|_| ChannelError::SessionTerminated)?;
        rx.await.map_err(|_| ChannelError::SessionTerminated)?
    }

    /// Fetches a point-in-time snapshot of the session.
    pub async fn snapshot(&self) -> Result<ChannelSnapshot, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(Intent::Inspect { reply: tx })
            .await
            .map_err(|_| ChannelError::SessionTerminated)?;
        rx.await.map_err(|_| ChannelError::SessionTerminated)
    }

    /// Stops the event loop and releases the transport.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .intents
            .send(Intent::Shutdown { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Exchange continuations
// ---------------------------------------------------------------------------

/// A transfer queued behind an address handshake.
#[derive(Debug, Clone, Copy)]
struct QueuedTransfer {
    amount: u64,
    direction: TransferDirection,
}

/// What the protocol does when an in-flight exchange resolves.
enum Continuation {
    /// Master awaiting `signAddressResult`; optionally chains a transfer.
    MasterAddress { then: Option<QueuedTransfer> },
    /// Master awaiting `signTransactionResult`.
    MasterTransaction,
    /// Slave awaiting the master's `signAddress` after `createAddress`.
    SlaveAddress,
    /// Slave awaiting the master's `signTransaction` after
    /// `createTransaction` for `amount`.
    SlaveTransaction { amount: u64 },
}

// ---------------------------------------------------------------------------
// ChannelProtocol
// ---------------------------------------------------------------------------

/// The per-session state machine. Constructed with explicit dependencies
/// and spawned onto its own task; all interaction goes through the
/// returned [`ChannelHandle`].
pub struct ChannelProtocol {
    cfg: ChannelConfig,
    transport: PeerTransport,
    events: mpsc::Receiver<TransportEvent>,
    intents: mpsc::Receiver<Intent>,
    intents_open: bool,
    ledger: Arc<dyn LedgerClient>,
    store: SessionStore,
    session: Option<Session>,
    phase: ChannelPhase,
    slot: ExchangeSlot<Continuation>,
    /// A full-state replacement that arrived mid-handshake, deferred until
    /// the exchange resolves. Only the newest is kept.
    queued_remote_state: Option<ChannelState>,
}

impl ChannelProtocol {
    /// Wires a session to its transport, ledger client, and store, resumes
    /// any persisted session for the room, and spawns the event loop.
    pub fn spawn(
        cfg: ChannelConfig,
        transport: PeerTransport,
        events: mpsc::Receiver<TransportEvent>,
        ledger: Arc<dyn LedgerClient>,
        store: SessionStore,
    ) -> Result<ChannelHandle, ChannelError> {
        let session = store.load(&cfg.room_id)?;
        let phase = if session.is_some() {
            ChannelPhase::AwaitingPeer
        } else {
            ChannelPhase::Uninitialized
        };
        if let Some(s) = &session {
            info!(room = %cfg.room_id, role = %s.role, version = s.state_version(),
                  "resumed persisted session");
        }

        let (intents_tx, intents_rx) = mpsc::channel(config::SESSION_EVENT_CAPACITY);
        let protocol = ChannelProtocol {
            cfg,
            transport,
            events,
            intents: intents_rx,
            intents_open: true,
            ledger,
            store,
            session,
            phase,
            slot: ExchangeSlot::new(),
            queued_remote_state: None,
        };
        tokio::spawn(protocol.run());

        Ok(ChannelHandle { intents: intents_tx })
    }

    /// The serialized event loop: transport events, intents, and the
    /// exchange deadline, one at a time.
    async fn run(mut self) {
        let ack = loop {
            let deadline = self
                .slot
                .deadline()
                .map(tokio::time::Instant::from_std);

            tokio::select! {
                intent = self.intents.recv(), if self.intents_open => {
                    match intent {
                        Some(Intent::Shutdown { reply }) => {
                            self.transport.shutdown().await;
                            break Some(reply);
                        }
                        Some(intent) => self.handle_intent(intent).await,
                        // All handles dropped; keep serving the protocol.
                        None => self.intents_open = false,
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_transport(event).await,
                        None => {
                            debug!(room = %self.cfg.room_id, "transport stream ended");
                            break None;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() =>
                {
                    self.handle_timeout().await;
                }
            }
        };

        // Release the store and transport before acking so a caller can
        // reopen the same data directory the moment shutdown() returns.
        drop(self);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    // -- Intent handling ----------------------------------------------------

    async fn handle_intent(&mut self, intent: Intent) {
        // Inspection is always allowed, even on a closed channel.
        let intent = match intent {
            Intent::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
                return;
            }
            other => other,
        };

        if self.phase == ChannelPhase::Closed {
            match intent {
                Intent::InitRoom { reply, .. }
                | Intent::Deposit { reply }
                | Intent::Transfer { reply, .. }
                | Intent::CreateAddress { reply } => {
                    let _ = reply.send(Err(ChannelError::ChannelClosed));
                }
                Intent::Close { reply } => {
                    let _ = reply.send(Err(ChannelError::ChannelClosed));
                }
                Intent::Inspect { .. } | Intent::Shutdown { .. } => {}
            }
            return;
        }

        match intent {
            Intent::InitRoom { opts, reply } => {
                let result = self.init_room(opts).await;
                let _ = reply.send(result);
            }
            Intent::Deposit { reply } => {
                let result = self.deposit().await;
                let _ = reply.send(result);
            }
            Intent::Transfer {
                amount,
                direction,
                reply,
            } => {
                if let Err(e) = self.start_transfer(amount, direction, Some(reply)).await {
                    // start_transfer only returns the replier on failure-
                    // before-send; the error carries it back here.
                    match e {
                        StartFailure { error, reply: Some(reply) } => {
                            let _ = reply.send(Err(error));
                        }
                        StartFailure { error, reply: None } => {
                            warn!(room = %self.cfg.room_id, error = %error,
                                  "autonomous transfer failed to start");
                        }
                    }
                }
            }
            Intent::CreateAddress { reply } => {
                if let Err(StartFailure { error, reply: r }) =
                    self.start_create_address(Some(reply)).await
                {
                    if let Some(r) = r {
                        let _ = r.send(Err(error));
                    }
                }
            }
            Intent::Close { reply } => {
                let result = self.close_channel().await;
                let _ = reply.send(result);
            }
            // Inspect resolved above; Shutdown never leaves the run loop.
            Intent::Inspect { .. } | Intent::Shutdown { .. } => {}
        }
    }

    async fn init_room(&mut self, opts: ChannelOptions) -> Result<ChannelState, ChannelError> {
        if self.session.is_some() {
            return Err(ChannelError::InvalidState {
                phase: self.phase.to_string(),
                message: "room already initialized locally".to_string(),
            });
        }

        let seed = Seed::generate();
        let mut state = self.ledger.master_initialize(&seed, &opts).await?;
        state.version = 1;

        let session = Session::new(Role::Master, seed, self.cfg.room_id.clone(), state.clone());
        self.store.save(&session)?;
        self.session = Some(session);
        self.phase = if self.transport.connected_peers().is_empty() {
            ChannelPhase::AwaitingPeer
        } else {
            ChannelPhase::Open
        };
        info!(room = %self.cfg.room_id, role = %Role::Master, "room initialized");

        // Anyone already connected learns the opening state immediately;
        // later joiners get it from the PeerJoined handler.
        self.broadcast_flash_state(&state).await;
        Ok(state)
    }

    async fn deposit(&mut self) -> Result<ChannelState, ChannelError> {
        if self.slot.is_pending() {
            return Err(ChannelError::ExchangeInFlight {
                pending: self.pending_name(),
            });
        }
        let session = self.session.as_ref().ok_or_else(|| self.no_session())?;
        if session.full_deposit_made {
            return Err(ChannelError::InvalidState {
                phase: self.phase.to_string(),
                message: "deposit already made".to_string(),
            });
        }
        let role = session.role;
        let mut state = session
            .channel_state
            .clone()
            .ok_or_else(|| self.no_session())?;

        self.phase = ChannelPhase::Depositing;
        *state.stake.get_mut(role) += state.deposit_amount as i64;
        state.version += 1;

        let result = self.commit(state.clone(), |s| s.full_deposit_made = true);
        self.settle_phase();
        result?;

        info!(room = %self.cfg.room_id, role = %role, amount = state.deposit_amount,
              "deposit applied");
        self.broadcast_flash_state(&state).await;
        Ok(state)
    }

    async fn close_channel(&mut self) -> Result<CloseReport, ChannelError> {
        if self.slot.is_pending() {
            return Err(ChannelError::ExchangeInFlight {
                pending: self.pending_name(),
            });
        }
        let session = self.session.as_ref().ok_or_else(|| self.no_session())?;
        let state = session
            .channel_state
            .clone()
            .ok_or_else(|| self.no_session())?;

        self.phase = ChannelPhase::Closing;
        let result = async {
            let bundle = settlement::select_bundle(&state)?;
            debug!(digest = %bundle.digest, "settling bundle");
            let payout = settlement::compute_payout(&state);
            let settlement = self.ledger.settlement_bundle(&state, &payout).await?;
            self.ledger.broadcast_settlement(&settlement).await?;
            self.store.delete(&self.cfg.room_id)?;
            Ok(CloseReport {
                bundle_digest: settlement.digest,
                payout,
            })
        }
        .await;

        match &result {
            Ok(report) => {
                self.phase = ChannelPhase::Closed;
                info!(room = %self.cfg.room_id, master = report.payout.master,
                      slave = report.payout.slave, "channel closed and settled");
            }
            Err(_) => self.settle_phase(),
        }
        result
    }

    // -- Exchange starters --------------------------------------------------

    /// Starts a transfer. On the master this runs the transaction
    /// handshake (chaining an address handshake in front when no unused
    /// address remains); on the slave it asks the master to originate.
    /// `reply` is `None` for exchanges run autonomously on the
    /// counterparty's behalf.
    async fn start_transfer(
        &mut self,
        amount: u64,
        direction: TransferDirection,
        reply: Option<Replier>,
    ) -> Result<(), StartFailure> {
        let fail = |error, reply| Err(StartFailure { error, reply });

        if self.slot.is_pending() {
            return fail(
                ChannelError::ExchangeInFlight {
                    pending: self.pending_name(),
                },
                reply,
            );
        }
        if amount == 0 {
            return fail(
                ChannelError::InvalidState {
                    phase: self.phase.to_string(),
                    message: "transfer amount must be positive".to_string(),
                },
                reply,
            );
        }
        let Some(session) = self.session.as_ref() else {
            return fail(self.no_session(), reply);
        };
        let Some(state) = session.channel_state.clone() else {
            return fail(self.no_session(), reply);
        };
        let role = session.role;
        let seed = session.seed.clone();

        if self.transport.connected_peers().is_empty() {
            return fail(
                ChannelError::PeerUnavailable {
                    peer: self.counterpart_id(role).to_string(),
                },
                reply,
            );
        }

        match role {
            Role::Slave => {
                if direction != TransferDirection::ToMaster {
                    return fail(
                        ChannelError::RoleMismatch {
                            role,
                            operation: "originating a transfer toward itself",
                        },
                        reply,
                    );
                }
                if let Err(error) = self.slot.begin(
                    ResponseKind::SignTransaction,
                    Continuation::SlaveTransaction { amount },
                    self.cfg.handshake_timeout,
                    reply,
                ) {
                    // begin() hands the replier back only via the error
                    // path here; it never stored it.
                    return Err(StartFailure { error, reply: None });
                }
                self.phase = ChannelPhase::Transacting;
                self.broadcast_message(&ChannelMessage::CreateTransaction { amount })
                    .await;
                Ok(())
            }
            Role::Master => {
                let needed = amount as i64 * 2;
                if state.remainder < needed {
                    return fail(
                        ChannelError::InsufficientCapacity {
                            needed,
                            remainder: state.remainder,
                        },
                        reply,
                    );
                }

                if state.has_unused_address() {
                    self.start_master_transaction(&seed, &state, amount, direction, reply)
                        .await
                } else {
                    // No spendable address: derive one first and chain the
                    // transfer behind the address handshake.
                    self.start_master_address(
                        &seed,
                        &state,
                        Some(QueuedTransfer { amount, direction }),
                        reply,
                    )
                    .await
                }
            }
        }
    }

    async fn start_create_address(
        &mut self,
        reply: Option<Replier>,
    ) -> Result<(), StartFailure> {
        if self.slot.is_pending() {
            return Err(StartFailure {
                error: ChannelError::ExchangeInFlight {
                    pending: self.pending_name(),
                },
                reply,
            });
        }
        let Some(session) = self.session.as_ref() else {
            return Err(StartFailure {
                error: self.no_session(),
                reply,
            });
        };
        let role = session.role;
        let seed = session.seed.clone();
        let state = session.channel_state.clone();

        if self.transport.connected_peers().is_empty() {
            return Err(StartFailure {
                error: ChannelError::PeerUnavailable {
                    peer: self.counterpart_id(role).to_string(),
                },
                reply,
            });
        }

        match role {
            Role::Master => {
                let Some(state) = state else {
                    return Err(StartFailure {
                        error: self.no_session(),
                        reply,
                    });
                };
                self.start_master_address(&seed, &state, None, reply).await
            }
            Role::Slave => {
                // Signing order demands the master originate; we ask and
                // wait for its signAddress to come back around.
                if let Err(error) = self.slot.begin(
                    ResponseKind::SignAddress,
                    Continuation::SlaveAddress,
                    self.cfg.handshake_timeout,
                    reply,
                ) {
                    return Err(StartFailure { error, reply: None });
                }
                self.phase = ChannelPhase::Transacting;
                self.broadcast_message(&ChannelMessage::CreateAddress).await;
                Ok(())
            }
        }
    }

    /// Master side: derive the next address and send it for counter-signing.
    async fn start_master_address(
        &mut self,
        seed: &Seed,
        state: &ChannelState,
        then: Option<QueuedTransfer>,
        reply: Option<Replier>,
    ) -> Result<(), StartFailure> {
        let mut staged = match self.ledger.master_new_address(seed, state).await {
            Ok(s) => s,
            Err(e) => {
                return Err(StartFailure {
                    error: e.into(),
                    reply,
                })
            }
        };
        staged.version = state.version + 1;

        if let Err(error) = self.slot.begin(
            ResponseKind::SignAddressResult,
            Continuation::MasterAddress { then },
            self.cfg.handshake_timeout,
            reply,
        ) {
            return Err(StartFailure { error, reply: None });
        }
        self.phase = ChannelPhase::Transacting;
        self.broadcast_message(&ChannelMessage::SignAddress {
            channel_state: staged,
        })
        .await;
        Ok(())
    }

    /// Master side: build the transaction proposal and send it for
    /// counter-signing. The staged state carries the adjusted remainder
    /// and updated totals; nothing is persisted until the counter-signed
    /// result returns.
    async fn start_master_transaction(
        &mut self,
        seed: &Seed,
        state: &ChannelState,
        amount: u64,
        direction: TransferDirection,
        reply: Option<Replier>,
    ) -> Result<(), StartFailure> {
        let split = match direction {
            TransferDirection::ToMaster => TransferSplit {
                master: amount,
                slave: 0,
            },
            TransferDirection::ToSlave => TransferSplit {
                master: 0,
                slave: amount,
            },
        };

        let mut base = state.clone();
        base.remainder -= amount as i64 * 2;

        let mut staged = match self.ledger.master_new_transaction(seed, &base, &split).await {
            Ok(s) => s,
            Err(e) => {
                return Err(StartFailure {
                    error: e.into(),
                    reply,
                })
            }
        };
        staged.total = apply_transfer_totals(state.total, &split);
        staged.version = state.version + 1;

        if let Err(error) = self.slot.begin(
            ResponseKind::SignTransactionResult,
            Continuation::MasterTransaction,
            self.cfg.handshake_timeout,
            reply,
        ) {
            return Err(StartFailure { error, reply: None });
        }
        self.phase = ChannelPhase::Transacting;
        self.broadcast_message(&ChannelMessage::SignTransaction {
            channel_state: staged,
        })
        .await;
        Ok(())
    }

    // -- Transport handling -------------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerJoined { peer } => {
                if self.phase == ChannelPhase::AwaitingPeer {
                    self.phase = ChannelPhase::Open;
                }
                // Whoever holds a state announces it to the newcomer. For
                // the master this is how the slave bootstraps; for a peer
                // with the newer state it is how a restarted counterparty
                // catches up.
                let announce = self
                    .session
                    .as_ref()
                    .and_then(|s| s.channel_state.clone());
                if let Some(state) = announce {
                    debug!(peer = %peer, version = state.version, "announcing state to joiner");
                    self.send_flash_state(&peer, &state).await;
                }
            }
            TransportEvent::PeerLeft { peer } => {
                if self.transport.connected_peers().is_empty()
                    && self.phase == ChannelPhase::Open
                {
                    self.phase = ChannelPhase::AwaitingPeer;
                }
                // A handshake cannot complete against a departed peer;
                // fail it now rather than letting the deadline do it.
                if let Some(exchange) = self.slot.take() {
                    warn!(peer = %peer, awaiting = exchange.expected.as_str(),
                          "counterparty disconnected mid-exchange");
                    exchange.resolve(Err(ChannelError::PeerUnavailable {
                        peer: peer.to_string(),
                    }));
                    self.settle_phase();
                    self.apply_queued_state();
                }
            }
            TransportEvent::Message { from, payload } => {
                match ChannelMessage::decode(&payload) {
                    Ok(msg) => {
                        debug!(from = %from, cmd = msg.cmd(), "inbound message");
                        self.dispatch(from, msg).await;
                    }
                    Err(e) => {
                        warn!(from = %from, error = %e, "dropping malformed message");
                    }
                }
            }
        }
    }

    /// The role/command dispatch table. Every `{role, cmd}` pair routes to
    /// exactly one handler; pairs outside the table are protocol noise and
    /// are logged and dropped.
    async fn dispatch(&mut self, from: PeerId, msg: ChannelMessage) {
        if self.phase == ChannelPhase::Closed {
            debug!(from = %from, cmd = msg.cmd(), "channel closed, ignoring message");
            return;
        }
        let role = self.session.as_ref().map(|s| s.role);
        match (role, msg) {
            // A peer with no session adopts the announced state as slave.
            (None, ChannelMessage::FlashState { channel_state }) => {
                self.on_first_flash_state(channel_state).await;
            }

            // Full-state replacement for an existing session (either role).
            (Some(_), ChannelMessage::FlashState { channel_state }) => {
                self.on_flash_state_update(channel_state);
            }

            // Slave counter-signs what the master originates.
            (Some(Role::Slave), ChannelMessage::SignAddress { channel_state }) => {
                self.on_sign_address(from, channel_state).await;
            }
            (Some(Role::Slave), ChannelMessage::SignTransaction { channel_state }) => {
                self.on_sign_transaction(from, channel_state).await;
            }

            // Master applies counter-signed results.
            (Some(Role::Master), ChannelMessage::SignAddressResult { channel_state }) => {
                self.on_sign_address_result(channel_state).await;
            }
            (Some(Role::Master), ChannelMessage::SignTransactionResult { channel_state }) => {
                self.on_sign_transaction_result(channel_state);
            }

            // Master originates on the slave's request.
            (Some(Role::Master), ChannelMessage::CreateAddress) => {
                self.on_create_address_request().await;
            }
            (Some(Role::Master), ChannelMessage::CreateTransaction { amount }) => {
                self.on_create_transaction_request(amount).await;
            }

            (role, msg) => {
                warn!(from = %from, cmd = msg.cmd(), role = ?role,
                      "command outside role dispatch table, dropping");
            }
        }
    }

    /// First contact: adopt the announced state, co-initialize as slave,
    /// and echo the merged state back.
    async fn on_first_flash_state(&mut self, remote: ChannelState) {
        self.phase = ChannelPhase::Initializing;
        let seed = Seed::generate();
        let merged = match self
            .ledger
            .slave_co_initialize(&seed, &self.cfg.settlement_address, &remote)
            .await
        {
            Ok(mut merged) => {
                merged.version = remote.version + 1;
                merged
            }
            Err(e) => {
                warn!(room = %self.cfg.room_id, error = %e, "co-initialization failed");
                self.phase = ChannelPhase::Uninitialized;
                return;
            }
        };

        let session = Session::new(
            Role::Slave,
            seed,
            self.cfg.room_id.clone(),
            merged.clone(),
        );
        if let Err(e) = self.store.save(&session) {
            warn!(room = %self.cfg.room_id, error = %e,
                  "could not persist co-initialized session, discarding");
            self.phase = ChannelPhase::Uninitialized;
            return;
        }
        self.session = Some(session);
        self.phase = ChannelPhase::Open;
        info!(room = %self.cfg.room_id, role = %Role::Slave, "joined room as slave");

        self.broadcast_flash_state(&merged).await;
    }

    /// Versioned full-state replacement. Stale or malformed states are
    /// rejected; anything arriving mid-handshake is deferred.
    fn on_flash_state_update(&mut self, incoming: ChannelState) {
        if self.slot.is_pending() {
            debug!(version = incoming.version,
                   "state replacement deferred until exchange resolves");
            let newer = match self.queued_remote_state.take() {
                Some(queued) if queued.version >= incoming.version => queued,
                _ => incoming,
            };
            self.queued_remote_state = Some(newer);
            return;
        }
        if let Err(e) = self.apply_remote_state(incoming) {
            warn!(room = %self.cfg.room_id, error = %e, "rejected inbound state");
        }
    }

    fn apply_remote_state(&mut self, incoming: ChannelState) -> Result<(), ChannelError> {
        if self.session.is_none() {
            return Err(self.no_session());
        }
        let local = self.session.as_ref().and_then(|s| s.channel_state.clone());
        let Some(local) = local else {
            // No local state to defend; adopt the announcement wholesale.
            return self.commit(incoming, |_| {});
        };

        if incoming.version <= local.version {
            return Err(ChannelError::StateConflict {
                local_version: local.version,
                remote_version: incoming.version,
            });
        }
        validate_flash_replacement(&local, &incoming)?;
        let version = incoming.version;
        self.commit(incoming, |_| {})?;
        debug!(room = %self.cfg.room_id, version, "adopted remote state");
        Ok(())
    }

    /// Slave handler for `signAddress`: counter-sign, persist, reply. If
    /// this slave asked for the address itself, its own exchange resolves
    /// here — the local state is already final; no second round-trip.
    async fn on_sign_address(&mut self, from: PeerId, incoming: ChannelState) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let seed = session.seed.clone();
        let Some(local) = session.channel_state.clone() else {
            return;
        };

        let staged = match self.ledger.slave_sign_address(&seed, &incoming).await {
            Ok(mut staged) => {
                staged.version = local.version.max(incoming.version) + 1;
                staged
            }
            Err(e) => {
                warn!(from = %from, error = %e, "refusing to counter-sign address");
                return;
            }
        };

        if staged.address_index != local.address_index + 1 {
            warn!(from = %from, local = local.address_index, staged = staged.address_index,
                  "address cursor did not advance by one, dropping");
            return;
        }
        if let Err(e) = local.validate_successor(&staged) {
            warn!(from = %from, error = %e, "counter-signed address state not a successor");
            return;
        }

        // Commit before replying: the counterparty must never see a state
        // we could still lose.
        if let Err(e) = self.commit(staged.clone(), |_| {}) {
            warn!(from = %from, error = %e, "could not persist co-signed address");
            return;
        }
        self.send_to(&from, &ChannelMessage::SignAddressResult {
            channel_state: staged.clone(),
        })
        .await;

        if let Some(exchange) = self.slot.take_if_expecting(ResponseKind::SignAddress) {
            exchange.resolve(Ok(staged));
            self.settle_phase();
            self.apply_queued_state();
        }
    }

    /// Master handler for `signAddressResult`: validate, commit, and
    /// either resolve the intent or chain into the queued transfer.
    async fn on_sign_address_result(&mut self, incoming: ChannelState) {
        let Some(exchange) = self.slot.take_if_expecting(ResponseKind::SignAddressResult) else {
            debug!("unsolicited signAddressResult, dropping");
            return;
        };

        let outcome = self.validate_and_commit_address_result(&incoming);
        let (continuation, reply) = exchange.into_parts();

        match outcome {
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                self.settle_phase();
                self.apply_queued_state();
            }
            Ok(()) => {
                let then = match continuation {
                    Continuation::MasterAddress { then } => then,
                    _ => None,
                };
                match then {
                    Some(QueuedTransfer { amount, direction }) => {
                        // Address secured; the transfer that was waiting on
                        // it starts immediately, reusing the replier.
                        let seed = self.session.as_ref().map(|s| s.seed.clone());
                        let state = self
                            .session
                            .as_ref()
                            .and_then(|s| s.channel_state.clone());
                        if let (Some(seed), Some(state)) = (seed, state) {
                            if let Err(StartFailure { error, reply }) = self
                                .start_master_transaction(
                                    &seed, &state, amount, direction, reply,
                                )
                                .await
                            {
                                if let Some(reply) = reply {
                                    let _ = reply.send(Err(error));
                                }
                                self.settle_phase();
                            }
                        }
                    }
                    None => {
                        let state = self
                            .session
                            .as_ref()
                            .and_then(|s| s.channel_state.clone());
                        if let (Some(reply), Some(state)) = (reply, state) {
                            let _ = reply.send(Ok(state));
                        }
                        self.settle_phase();
                        self.apply_queued_state();
                    }
                }
            }
        }
    }

    fn validate_and_commit_address_result(
        &mut self,
        incoming: &ChannelState,
    ) -> Result<(), ChannelError> {
        let local = self
            .session
            .as_ref()
            .and_then(|s| s.channel_state.clone())
            .ok_or_else(|| self.no_session())?;

        if incoming.address_index != local.address_index + 1 {
            return Err(ChannelError::RejectedRemoteState(format!(
                "address cursor moved {} -> {}, expected exactly one step",
                local.address_index, incoming.address_index
            )));
        }
        local.validate_successor(incoming)?;
        if !incoming
            .addresses
            .last()
            .is_some_and(|a| a.is_cosigned())
        {
            return Err(ChannelError::RejectedRemoteState(
                "newest address is not counter-signed".to_string(),
            ));
        }
        self.commit(incoming.clone(), |_| {})
    }

    /// Slave handler for `signTransaction`: validate the proposal,
    /// counter-sign, persist, reply. Resolves the slave's own exchange if
    /// this proposal is the one it requested.
    async fn on_sign_transaction(&mut self, from: PeerId, incoming: ChannelState) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let seed = session.seed.clone();
        let Some(local) = session.channel_state.clone() else {
            return;
        };

        let staged = match self.ledger.slave_sign_transaction(&seed, &incoming).await {
            Ok(mut staged) => {
                staged.version = local.version.max(incoming.version) + 1;
                staged
            }
            Err(e) => {
                warn!(from = %from, error = %e, "refusing to counter-sign transaction");
                return;
            }
        };

        let split = match validate_transaction_step(&local, &staged) {
            Ok(split) => split,
            Err(e) => {
                warn!(from = %from, error = %e, "transaction proposal rejected");
                return;
            }
        };

        if let Err(e) = self.commit(staged.clone(), |_| {}) {
            warn!(from = %from, error = %e, "could not persist counter-signed transaction");
            return;
        }
        self.send_to(&from, &ChannelMessage::SignTransactionResult {
            channel_state: staged.clone(),
        })
        .await;
        info!(room = %self.cfg.room_id, master = split.master, slave = split.slave,
              "transaction counter-signed");

        // Resolve our own pending request only if this is the transfer we
        // asked for; an unrelated master-initiated transfer leaves the
        // request outstanding.
        let is_ours = matches!(
            self.slot.continuation(),
            Some(Continuation::SlaveTransaction { amount }) if split.master == *amount
        );
        if is_ours {
            if let Some(exchange) = self.slot.take_if_expecting(ResponseKind::SignTransaction) {
                exchange.resolve(Ok(staged));
                self.settle_phase();
                self.apply_queued_state();
            }
        }
    }

    /// Master handler for `signTransactionResult`: validate, commit,
    /// resolve.
    fn on_sign_transaction_result(&mut self, incoming: ChannelState) {
        let Some(exchange) = self.slot.take_if_expecting(ResponseKind::SignTransactionResult)
        else {
            debug!("unsolicited signTransactionResult, dropping");
            return;
        };

        let outcome = (|| -> Result<ChannelState, ChannelError> {
            let Some(session) = self.session.as_ref() else {
                return Err(self.no_session());
            };
            let Some(local) = session.channel_state.as_ref() else {
                return Err(self.no_session());
            };
            validate_transaction_step(local, &incoming)?;
            let newest_signed = incoming
                .bundles
                .last()
                .and_then(|slot| slot.as_ref())
                .is_some_and(|b| b.is_fully_signed());
            if !newest_signed {
                return Err(ChannelError::RejectedRemoteState(
                    "newest bundle is not fully signed".to_string(),
                ));
            }
            self.commit(incoming.clone(), |_| {})?;
            Ok(incoming)
        })();

        exchange.resolve(outcome);
        self.settle_phase();
        self.apply_queued_state();
    }

    /// Master handler for the slave's `createAddress` request: originate
    /// the address handshake with no local intent behind it.
    async fn on_create_address_request(&mut self) {
        if self.slot.is_pending() {
            warn!(room = %self.cfg.room_id,
                  "dropping slave address request: exchange already in flight");
            return;
        }
        if let Err(StartFailure { error, .. }) = self.start_create_address(None).await {
            warn!(room = %self.cfg.room_id, error = %error,
                  "autonomous address creation failed");
        }
    }

    /// Master handler for the slave's `createTransaction` request: the
    /// requester pays, so direction is always toward the master.
    async fn on_create_transaction_request(&mut self, amount: u64) {
        if self.slot.is_pending() {
            warn!(room = %self.cfg.room_id,
                  "dropping slave transaction request: exchange already in flight");
            return;
        }
        if let Err(StartFailure { error, .. }) = self
            .start_transfer(amount, TransferDirection::ToMaster, None)
            .await
        {
            warn!(room = %self.cfg.room_id, error = %error,
                  "autonomous transaction creation failed");
        }
    }

    async fn handle_timeout(&mut self) {
        let Some(exchange) = self.slot.take() else {
            return;
        };
        let elapsed_ms = exchange.elapsed_ms();
        warn!(room = %self.cfg.room_id, awaiting = exchange.expected.as_str(),
              elapsed_ms, "exchange deadline expired");
        exchange.resolve(Err(ChannelError::HandshakeTimeout {
            elapsed_ms,
            timeout_ms: self.cfg.handshake_timeout.as_millis() as u64,
        }));
        self.settle_phase();
        self.apply_queued_state();
    }

    // -- Plumbing -----------------------------------------------------------

    /// Commits a new channel state: clone the session, apply, persist,
    /// swap. The in-memory session never diverges from disk.
    fn commit(
        &mut self,
        state: ChannelState,
        mutate: impl FnOnce(&mut Session),
    ) -> Result<(), ChannelError> {
        let Some(mut session) = self.session.clone() else {
            return Err(self.no_session());
        };
        session.channel_state = Some(state);
        mutate(&mut session);
        session.touch();
        self.store.save(&session)?;
        self.session = Some(session);
        Ok(())
    }

    /// Applies a deferred full-state replacement after an exchange ends.
    fn apply_queued_state(&mut self) {
        if let Some(queued) = self.queued_remote_state.take() {
            if let Err(e) = self.apply_remote_state(queued) {
                warn!(room = %self.cfg.room_id, error = %e, "rejected deferred state");
            }
        }
    }

    fn settle_phase(&mut self) {
        if !self.phase.is_steady() && self.phase != ChannelPhase::Closed {
            self.phase = if self.transport.connected_peers().is_empty() {
                ChannelPhase::AwaitingPeer
            } else {
                ChannelPhase::Open
            };
        }
    }

    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            phase: self.phase,
            role: self.session.as_ref().map(|s| s.role),
            peers: self.transport.connected_peers(),
            state: self.session.as_ref().and_then(|s| s.channel_state.clone()),
            full_deposit_made: self.session.as_ref().is_some_and(|s| s.full_deposit_made),
        }
    }

    fn no_session(&self) -> ChannelError {
        ChannelError::InvalidState {
            phase: self.phase.to_string(),
            message: "no initialized session for this room".to_string(),
        }
    }

    fn pending_name(&self) -> String {
        self.slot
            .pending_kind()
            .map(|k| k.as_str().to_string())
            .unwrap_or_default()
    }

    fn counterpart_id(&self, role: Role) -> PeerId {
        // The master is always slot 0; the bilateral counterpart of the
        // master is slot 1.
        let slot = match role {
            Role::Master => 1,
            Role::Slave => 0,
        };
        PeerId::new(self.cfg.room_id.clone(), slot)
    }

    async fn send_to(&self, peer: &PeerId, msg: &ChannelMessage) {
        if let Err(e) = self.transport.send(peer, msg.encode()).await {
            debug!(peer = %peer, cmd = msg.cmd(), error = %e, "send failed");
        }
    }

    /// Sends toward the counterpart. A bilateral room has exactly one
    /// live counterparty, so this is a fan-out over the connection pool.
    async fn broadcast_message(&self, msg: &ChannelMessage) {
        self.transport.broadcast(msg.encode()).await;
    }

    async fn send_flash_state(&self, peer: &PeerId, state: &ChannelState) {
        self.send_to(peer, &ChannelMessage::FlashState {
            channel_state: state.clone(),
        })
        .await;
    }

    async fn broadcast_flash_state(&self, state: &ChannelState) {
        self.transport
            .broadcast(
                ChannelMessage::FlashState {
                    channel_state: state.clone(),
                }
                .encode(),
            )
            .await;
    }
}

/// A failed exchange start: the error plus the replier if it was never
/// consumed, so the caller can deliver the bad news.
struct StartFailure {
    error: ChannelError,
    reply: Option<Replier>,
}

// ---------------------------------------------------------------------------
// Pure validators
// ---------------------------------------------------------------------------

/// Totals after applying a transfer split: the credited party gains, the
/// other party pays.
fn apply_transfer_totals(totals: BalancePair, split: &TransferSplit) -> BalancePair {
    BalancePair {
        master: totals.master + split.master as i64 - split.slave as i64,
        slave: totals.slave + split.slave as i64 - split.master as i64,
    }
}

/// Validates an unsigned full-state replacement (`flashState`).
///
/// Beyond successor validation, the only mutation a bare `flashState` may
/// carry relative to what we hold is a deposit: exactly one stake grown by
/// exactly `deposit_amount`, totals untouched. Anything else must arrive
/// through a signing handshake.
fn validate_flash_replacement(
    local: &ChannelState,
    incoming: &ChannelState,
) -> Result<(), ChannelError> {
    local.validate_successor(incoming)?;

    let master_delta = incoming.stake.master - local.stake.master;
    let slave_delta = incoming.stake.slave - local.stake.slave;
    let deposit = local.deposit_amount as i64;
    match (master_delta, slave_delta) {
        (0, 0) => Ok(()),
        (d, 0) | (0, d) if d == deposit => {
            if incoming.total != local.total {
                return Err(ChannelError::RejectedRemoteState(
                    "deposit must not move totals".to_string(),
                ));
            }
            Ok(())
        }
        _ => Err(ChannelError::RejectedRemoteState(format!(
            "stake deltas ({master_delta}, {slave_delta}) do not match a {deposit} deposit"
        ))),
    }
}

/// Validates one transaction handshake step: exactly one new bundle, the
/// remainder reserved accordingly, totals shifted by the bundle's split
/// and conserved overall, stakes untouched.
///
/// Returns the new bundle's split so callers can report or match it.
fn validate_transaction_step(
    local: &ChannelState,
    staged: &ChannelState,
) -> Result<TransferSplit, ChannelError> {
    local.validate_successor(staged)?;

    if staged.occupied_bundles() != local.occupied_bundles() + 1 {
        return Err(ChannelError::RejectedRemoteState(format!(
            "expected exactly one new bundle, had {} now {}",
            local.occupied_bundles(),
            staged.occupied_bundles()
        )));
    }
    let bundle = staged
        .bundles
        .last()
        .and_then(|slot| slot.as_ref())
        .ok_or_else(|| {
            ChannelError::RejectedRemoteState("newest bundle slot is empty".to_string())
        })?;
    let split = bundle.split;
    let amount = (split.master + split.slave) as i64;

    if staged.remainder != local.remainder - amount * 2 {
        return Err(ChannelError::RejectedRemoteState(format!(
            "remainder moved {} -> {}, expected reservation of {}",
            local.remainder,
            staged.remainder,
            amount * 2
        )));
    }
    if staged.total != apply_transfer_totals(local.total, &split) {
        return Err(ChannelError::RejectedRemoteState(
            "totals do not match the bundle split".to_string(),
        ));
    }
    if staged.total.sum() != local.total.sum() {
        return Err(ChannelError::RejectedRemoteState(
            "transaction does not conserve totals".to_string(),
        ));
    }
    if staged.stake != local.stake {
        return Err(ChannelError::RejectedRemoteState(
            "transaction must not move stakes".to_string(),
        ));
    }
    Ok(split)
}
