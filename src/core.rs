//! ClientCore: the top-level session state machine that owns and drives
//! every other component.
//!
//! Runs as the body of a single `tokio::task`, draining one command
//! channel. That channel is fed both by the cross-thread [`EngineHandle`]
//! API and by the [`OperationScheduler`]'s timer fires, so every mutation
//! of engine state happens on one logical thread without a mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::config::EngineConfig;
use crate::digest::Digest;
use crate::error::{EngineError, EngineResult};
use crate::listener::{AckHandle, ApplicationListener, RegistrationState};
use crate::metrics::Metrics;
use crate::model::{
    ClientToken, Invalidation, Nonce, ObjectId, PersistentTiclState, RegistrationOpKind,
    SessionState,
};
use crate::persistence::PersistenceCodec;
use crate::protocol::{ProtocolHandler, SendOutcome};
use crate::registration::{RegistrationEvent, RegistrationManager};
use crate::resources::{PersistentStore, Transport};
use crate::scheduler::{OpId, OperationScheduler};
use crate::smear::{NonceSource, Smearer};
use crate::throttle::{ThrottleRule, Throttler};
use crate::validator::MessageValidator;
use crate::wire::{ClientToServerPayload, ConfigParams, ServerToClientPayload};

/// Commands accepted on the engine's single channel: the cross-thread API
/// surface plus the scheduler's own timer fires.
enum Command {
    Start,
    Stop,
    Register(ObjectId),
    Unregister(ObjectId),
    Receive(Vec<u8>),
    AckInvoked(Invalidation),
    AckAllInvoked,
    TimerFired(OpId),
}

/// The resources a [`ClientCore`] is built from: everything it consumes
/// but does not itself implement, plus the injected randomness/digest
/// seams.
pub struct EngineResources {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn PersistentStore>,
    pub listener: Arc<dyn ApplicationListener>,
    pub digest: Arc<dyn Digest>,
    pub smear_rng: Box<dyn crate::smear::SmearRng>,
    pub nonce_source: Box<dyn NonceSource>,
}

/// A cheaply cloneable, `Send + Sync` handle to a running engine. Every
/// method posts a command onto the engine's channel and returns
/// immediately; none of them touch engine state directly.
#[derive(Clone)]
pub struct EngineHandle {
    sender: UnboundedSender<Command>,
    stopped: Arc<AtomicBool>,
}

impl EngineHandle {
    pub fn start(&self) {
        let _ = self.sender.send(Command::Start);
    }

    /// Idempotent: stopping an already-stopped engine is a no-op, not an
    /// error.
    pub fn stop(&self) {
        let _ = self.sender.send(Command::Stop);
    }

    /// Rejected with [`EngineError::Stopped`] once the engine has stopped,
    /// rather than being silently queued forever on a channel nothing
    /// will ever drain again.
    pub fn register(&self, object_id: ObjectId) -> EngineResult<()> {
        self.post(Command::Register(object_id))
    }

    pub fn unregister(&self, object_id: ObjectId) -> EngineResult<()> {
        self.post(Command::Unregister(object_id))
    }

    /// Hands the engine a raw inbound message received from the
    /// transport. The engine decodes, validates, and dispatches it.
    pub fn receive(&self, bytes: Vec<u8>) -> EngineResult<()> {
        self.post(Command::Receive(bytes))
    }

    fn post(&self, cmd: Command) -> EngineResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        let _ = self.sender.send(cmd);
        Ok(())
    }
}

/// Spawns the engine's driving task and returns a handle to it. The
/// engine begins in whatever state persistence restores it to; nothing
/// is sent to the transport until [`EngineHandle::start`] is called.
pub async fn spawn(config: EngineConfig, resources: EngineResources) -> EngineHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let stopped = Arc::new(AtomicBool::new(false));
    let handle = EngineHandle { sender: tx.clone(), stopped: Arc::clone(&stopped) };

    let restored = match resources.store.read().await {
        Ok(Some(bytes)) => {
            let codec = PersistenceCodec::new(Box::new(ArcDigest(Arc::clone(&resources.digest))));
            codec.read(&bytes)
        }
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read persisted state, starting fresh");
            None
        }
    };

    let core = ClientCore::new(config, resources, tx, restored);
    tokio::spawn(core.run(rx, stopped));
    handle
}

/// Adapts a shared `Arc<dyn Digest>` into its own `Box<dyn Digest>` slot,
/// since [`PersistenceCodec`] owns its digest rather than borrowing it.
struct ArcDigest(Arc<dyn Digest>);
impl Digest for ArcDigest {
    fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        self.0.digest(bytes)
    }
}

struct ClientCore {
    config: EngineConfig,
    session: SessionState,
    current_token: Option<ClientToken>,
    command_sender: UnboundedSender<Command>,

    transport_metrics: Arc<Metrics>,
    registration: RegistrationManager,
    protocol: ProtocolHandler,
    throttler: Throttler,
    validator: MessageValidator,
    scheduler: OperationScheduler<Command>,
    persistence: PersistenceCodec,
    store: Arc<dyn PersistentStore>,
    listener: Arc<dyn ApplicationListener>,
    nonce_source: Box<dyn NonceSource>,
    application_client_id: Vec<u8>,

    heartbeat_due: bool,
    poll_due: bool,
    initialize_pending: bool,
    info_requested: bool,
    initialize_attempt: u32,

    start_time: Instant,
}

impl ClientCore {
    fn new(
        config: EngineConfig,
        resources: EngineResources,
        sender: UnboundedSender<Command>,
        restored: Option<PersistentTiclState>,
    ) -> Self {
        let metrics = Arc::new(Metrics::default());
        let smearer = Arc::new(Smearer::new(
            config.smear_percent,
            resources.smear_rng,
        ));

        let scheduler = OperationScheduler::new(Arc::clone(&smearer), sender.clone(), Command::TimerFired);

        let throttle_rules = config
            .throttle_rules
            .iter()
            .map(|r| ThrottleRule { window: std::time::Duration::from_millis(r.window_ms), max_count: r.max_count })
            .collect();

        let (session, current_token, message_id) = match restored {
            Some(state) => (
                state.client_token.clone().map(SessionState::Running).unwrap_or(SessionState::Unassigned),
                state.client_token,
                state.last_message_id,
            ),
            None => (SessionState::Unassigned, None, 0),
        };

        Self {
            session,
            current_token,
            command_sender: sender,
            transport_metrics: Arc::clone(&metrics),
            registration: RegistrationManager::new(Arc::clone(&resources.digest)),
            protocol: ProtocolHandler::new(config.protocol_version, 0, message_id, Arc::clone(&resources.transport), metrics),
            throttler: Throttler::new(throttle_rules),
            validator: MessageValidator::new(config.max_message_bytes),
            scheduler,
            persistence: PersistenceCodec::new(Box::new(ArcDigest(Arc::clone(&resources.digest)))),
            store: resources.store,
            listener: resources.listener,
            nonce_source: resources.nonce_source,
            application_client_id: Vec::new(),
            heartbeat_due: false,
            poll_due: false,
            initialize_pending: false,
            info_requested: false,
            initialize_attempt: 0,
            config,
            start_time: Instant::now(),
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<Command>, stopped: Arc<AtomicBool>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Stop => {
                    self.scheduler.cancel_all();
                    self.session = SessionState::Stopped;
                    break;
                }
                other => self.handle_command(other).await,
            }
        }
        // Flips only after the loop has actually drained and stopped, so a
        // command already in flight when `stop()` was posted still lands;
        // only commands posted after this point are rejected synchronously.
        stopped.store(true, Ordering::SeqCst);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => self.on_start(),
            Command::Stop => unreachable!("handled in run()"),
            Command::Register(object_id) => {
                self.registration.enqueue(object_id, RegistrationOpKind::Register);
                self.maybe_schedule_batcher();
            }
            Command::Unregister(object_id) => {
                self.registration.enqueue(object_id, RegistrationOpKind::Unregister);
                self.maybe_schedule_batcher();
            }
            Command::Receive(bytes) => self.on_receive(&bytes).await,
            Command::AckInvoked(invalidation) => {
                self.protocol.add_pending_ack(invalidation);
                self.maybe_schedule_batcher();
            }
            Command::AckAllInvoked => {
                self.protocol.add_pending_ack_all();
                self.maybe_schedule_batcher();
            }
            Command::TimerFired(op_id) => self.on_timer(op_id).await,
        }
    }

    fn on_start(&mut self) {
        if matches!(self.session, SessionState::Unassigned) {
            self.begin_initialization();
        } else if matches!(self.session, SessionState::Running(_)) {
            self.scheduler.set_period(OpId::Heartbeat, std::time::Duration::from_millis(self.config.heartbeat_interval_ms));
            self.scheduler.set_period(OpId::Poll, std::time::Duration::from_millis(self.config.poll_interval_ms));
            self.scheduler.schedule_in(OpId::Heartbeat, std::time::Duration::from_millis(self.config.initial_persistent_heartbeat_delay_ms));
            self.scheduler.schedule(OpId::Poll);
            self.maybe_schedule_batcher();
        }
    }

    /// Generates a fresh nonce and moves to `AwaitingToken`, scheduling an
    /// Initialize send and the backoff retry that resends it if no
    /// `TokenControl` arrives in time.
    fn begin_initialization(&mut self) {
        let nonce = Nonce(self.nonce_source.generate());
        self.application_client_id = self.nonce_source.generate();
        self.session = SessionState::AwaitingToken(nonce);
        self.initialize_pending = true;
        self.initialize_attempt = 0;
        self.maybe_schedule_batcher();
    }

    async fn on_receive(&mut self, bytes: &[u8]) {
        let Some(msg) = self.protocol.handle_incoming(bytes, &self.validator, self.current_token.as_ref()) else {
            return;
        };

        if let Some(ms) = msg.header.next_heartbeat_interval_ms {
            self.scheduler.set_period(OpId::Heartbeat, std::time::Duration::from_millis(ms));
        }
        if let Some(ms) = msg.header.next_poll_interval_ms {
            self.scheduler.set_period(OpId::Poll, std::time::Duration::from_millis(ms));
        }
        if matches!(self.session, SessionState::Running(_)) {
            if let Some(server_summary) = &msg.header.registration_summary {
                self.registration.check_summary(server_summary);
            }
        }

        match msg.payload {
            ServerToClientPayload::TokenControl { new_token, nonce, status } => {
                self.on_token_control(new_token, nonce, status).await;
            }
            ServerToClientPayload::InvalidationMsg { invalidations, all_object_ids } => {
                if matches!(self.session, SessionState::Running(_)) {
                    if all_object_ids {
                        self.deliver_invalidate_all();
                    }
                    for inv in invalidations {
                        self.deliver_invalidation(inv);
                    }
                }
            }
            ServerToClientPayload::RegistrationStatusMsg { statuses } => {
                if matches!(self.session, SessionState::Running(_)) {
                    let events = self.registration.apply_status(statuses);
                    for event in events {
                        self.dispatch_registration_event(event);
                    }
                    self.maybe_schedule_batcher();
                }
            }
            ServerToClientPayload::RegistrationSyncRequest => {
                if matches!(self.session, SessionState::Running(_)) {
                    let subtrees = self.registration.apply_sync_request();
                    for subtree in subtrees {
                        self.listener.reissue_registrations(subtree.prefix, subtree.length);
                    }
                    self.maybe_schedule_batcher();
                }
            }
            ServerToClientPayload::InfoRequest { .. } => {
                if matches!(self.session, SessionState::Running(_)) {
                    self.info_requested = true;
                    self.maybe_schedule_batcher();
                }
            }
            ServerToClientPayload::ErrorMsg { status } => {
                self.listener.inform_error(status);
            }
        }
    }

    async fn on_token_control(&mut self, new_token: Option<ClientToken>, nonce: Nonce, status: crate::wire::TokenControlStatus) {
        use crate::wire::TokenControlStatus::*;

        enum Action {
            Activate(ClientToken),
            Reinitialize,
            Ignore,
        }

        let action = match (&self.session, status) {
            (SessionState::AwaitingToken(expected), Success) if *expected == nonce => match new_token {
                Some(token) => Action::Activate(token),
                None => Action::Ignore,
            },
            (SessionState::Running(_), AuthFailure) | (SessionState::Running(_), UnknownClient) => Action::Reinitialize,
            _ => Action::Ignore,
        };

        match action {
            Action::Activate(token) => {
                self.session = SessionState::Running(token.clone());
                self.set_token(Some(token));
                self.initialize_pending = false;
                self.scheduler.set_period(OpId::Heartbeat, std::time::Duration::from_millis(self.config.heartbeat_interval_ms));
                self.scheduler.set_period(OpId::Poll, std::time::Duration::from_millis(self.config.poll_interval_ms));
                self.scheduler
                    .schedule_in(OpId::Heartbeat, std::time::Duration::from_millis(self.config.initial_persistent_heartbeat_delay_ms));
                self.scheduler.schedule(OpId::Poll);
                self.listener.ready();
                self.maybe_schedule_batcher();
            }
            Action::Reinitialize => {
                self.scheduler.cancel_all();
                self.session = SessionState::Unassigned;
                self.set_token(None);
                self.begin_initialization();
            }
            Action::Ignore => {
                tracing::debug!("ignoring TokenControl not applicable to current session state");
            }
        }
    }

    /// Dispatches one inbound invalidation to the appropriate upcall:
    /// `invalidate` for an ordinary versioned entry, `invalidateUnknownVersion`
    /// when the server couldn't supply a usable version. Either way the ack
    /// handle, once invoked, adds the same `Invalidation` to the pending-ack
    /// set so it round-trips in the next `InvalidationAckMsg`.
    fn deliver_invalidation(&mut self, invalidation: Invalidation) {
        let sender = self.command_sender.clone();
        let inv = invalidation.clone();
        let ack = AckHandle::new(move || {
            let _ = sender.send(Command::AckInvoked(inv.clone()));
        });
        if invalidation.is_known_version {
            self.listener.invalidate(invalidation, ack);
        } else {
            self.listener.invalidate_unknown_version(invalidation.object_id.clone(), ack);
        }
    }

    /// Dispatches the all-object-ids sweep to `invalidateAll`. Its ack is
    /// tracked separately from per-object acks since there is no single
    /// object id to carry in the outbound `InvalidationAckMsg`.
    fn deliver_invalidate_all(&mut self) {
        let sender = self.command_sender.clone();
        let ack = AckHandle::new(move || {
            let _ = sender.send(Command::AckAllInvoked);
        });
        self.listener.invalidate_all(ack);
    }

    fn dispatch_registration_event(&mut self, event: RegistrationEvent) {
        match event {
            RegistrationEvent::Confirmed { object_id, registered } => {
                self.transport_metrics.record_registration_succeeded();
                let state = if registered { RegistrationState::Registered } else { RegistrationState::Unregistered };
                self.listener.inform_registration_status(object_id, state);
            }
            RegistrationEvent::PermanentFailure { object_id, reason } => {
                self.transport_metrics.record_registration_failed();
                self.listener.inform_registration_failure(object_id, false, reason);
            }
            RegistrationEvent::TransientFailure { object_id, reason } => {
                self.listener.inform_registration_failure(object_id, true, reason);
            }
        }
    }

    /// Records a possible change in the stored token and, if it changed
    /// (including to `None`), fires the authoritative `allRegistrationsLost`
    /// signal exactly once.
    fn set_token(&mut self, new_token: Option<ClientToken>) {
        if self.current_token != new_token {
            self.current_token = new_token;
            self.registration.reset_confirmed_summary();
            self.listener.all_registrations_lost();
        }
        self.persist();
    }

    fn persist(&self) {
        let state = PersistentTiclState { last_message_id: self.protocol.current_message_id(), client_token: self.current_token.clone() };
        let bytes = self.persistence.write(&state);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.write(bytes).await {
                tracing::warn!(error = %e, "persistence write failed");
            }
        });
    }

    async fn on_timer(&mut self, op_id: OpId) {
        match op_id {
            OpId::Batcher => self.fire_batcher().await,
            OpId::Heartbeat => {
                if matches!(self.session, SessionState::Running(_)) {
                    self.heartbeat_due = true;
                    self.maybe_schedule_batcher();
                    self.scheduler.schedule(OpId::Heartbeat);
                }
            }
            OpId::Poll => {
                if matches!(self.session, SessionState::Running(_)) {
                    self.poll_due = true;
                    self.maybe_schedule_batcher();
                    self.scheduler.schedule(OpId::Poll);
                }
            }
            OpId::InitializeRetry => {
                if let SessionState::AwaitingToken(_) = &self.session {
                    let nonce = Nonce(self.nonce_source.generate());
                    self.session = SessionState::AwaitingToken(nonce);
                    self.initialize_pending = true;
                    self.maybe_schedule_batcher();
                }
            }
        }
    }

    fn any_work_pending(&self) -> bool {
        self.registration.has_pending()
            || self.protocol.has_pending_acks()
            || self.registration.has_sync_subtrees()
            || self.heartbeat_due
            || self.poll_due
            || self.initialize_pending
            || self.info_requested
    }

    fn maybe_schedule_batcher(&mut self) {
        if self.any_work_pending() {
            self.scheduler.set_period(OpId::Batcher, std::time::Duration::from_millis(self.config.batching_delay_ms));
            self.scheduler.schedule(OpId::Batcher);
        }
    }

    /// Picks exactly one payload kind to send this fire, in priority
    /// order Initialize > registrations > sync > acks > info, falling
    /// back to an empty `RegistrationMsg` when only heartbeat/poll
    /// liveness is due.
    async fn fire_batcher(&mut self) {
        let client_time_ms = self.start_time.elapsed().as_millis() as i64;
        let now = Instant::now();

        let payload = if self.initialize_pending {
            let nonce = match &self.session {
                SessionState::AwaitingToken(n) => n.clone(),
                _ => {
                    self.initialize_pending = false;
                    return;
                }
            };
            ClientToServerPayload::Initialize { nonce, application_client_id: self.application_client_id.clone() }
        } else if self.registration.has_pending() {
            ClientToServerPayload::RegistrationMsg { ops: self.registration.peek_pending() }
        } else if self.registration.has_sync_subtrees() {
            ClientToServerPayload::RegistrationSyncMsg { subtrees: self.registration.peek_sync_subtrees() }
        } else if self.protocol.has_pending_acks() {
            let (invalidations, ack_all) = self.protocol.peek_pending_acks();
            ClientToServerPayload::InvalidationAckMsg { invalidations, ack_all }
        } else if self.info_requested {
            ClientToServerPayload::InfoMessage {
                counters: self.transport_metrics.snapshot(),
                config_params: ConfigParams {
                    batching_delay_ms: self.config.batching_delay_ms,
                    heartbeat_interval_ms: self.config.heartbeat_interval_ms,
                    poll_interval_ms: self.config.poll_interval_ms,
                    smear_percent: self.config.smear_percent,
                },
            }
        } else {
            ClientToServerPayload::RegistrationMsg { ops: Vec::new() }
        };

        let is_initialize = matches!(payload, ClientToServerPayload::Initialize { .. });
        let summary = self.registration.current_summary();
        let token = self.current_token.clone();

        let outcome = self
            .protocol
            .send_message(&mut self.throttler, &self.validator, &self.session, now, client_time_ms, token, summary, payload)
            .await;

        match outcome {
            Ok(SendOutcome::Sent) => {
                self.heartbeat_due = false;
                self.poll_due = false;
                if is_initialize {
                    self.initialize_pending = false;
                    self.schedule_initialize_retry();
                } else if self.registration.has_pending() {
                    self.registration.drain_pending();
                } else if self.registration.has_sync_subtrees() {
                    self.registration.drain_sync_subtrees();
                } else if self.protocol.has_pending_acks() {
                    self.protocol.drain_pending_acks();
                } else if self.info_requested {
                    self.info_requested = false;
                }
                self.maybe_schedule_batcher();
            }
            Ok(SendOutcome::Deferred(deadline)) => {
                let delay = deadline.saturating_duration_since(now);
                self.scheduler.schedule_in(OpId::Batcher, delay);
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "transport send failed, will retry on next batcher fire");
                self.maybe_schedule_batcher();
            }
            Err(e) => {
                tracing::error!(error = %e, "internal error building outbound message");
            }
        }
    }

    fn schedule_initialize_retry(&mut self) {
        let backoff = &self.config.initialize_backoff;
        let attempt = self.initialize_attempt;
        self.initialize_attempt = self.initialize_attempt.saturating_add(1);
        let delay_ms = (backoff.initial_delay_ms as f64 * backoff.multiplier.powi(attempt as i32)).min(backoff.max_delay_ms as f64) as u64;
        self.scheduler.schedule_in(OpId::InitializeRetry, std::time::Duration::from_millis(delay_ms.max(self.config.initialize_timeout_ms)));
    }
}

