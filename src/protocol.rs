//! ProtocolHandler: builds outbound messages, parses inbound messages,
//! and maintains last-known server time, token, and message id.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{EngineError, EngineResult};
use crate::metrics::Metrics;
use crate::model::{ClientToken, Invalidation, RegistrationSummary, SessionState};
use crate::resources::Transport;
use crate::throttle::{FireDecision, Throttler};
use crate::validator::MessageValidator;
use crate::wire::{BincodeCodec, ClientHeader, ClientToServer, ClientToServerPayload, MessageCodec, ServerToClient};

/// Outcome of a `send_message` call.
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    Deferred(Instant),
}

pub struct ProtocolHandler {
    protocol_version: u32,
    client_type: u32,
    message_id: i64,
    max_known_server_time_ms: i64,
    pending_acks: HashSet<Invalidation>,
    /// Set once the application has acked an `invalidateAll` delivery;
    /// has no corresponding `Invalidation` entry since there is no single
    /// object id to carry one.
    pending_ack_all: bool,
    codec: BincodeCodec,
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
}

impl ProtocolHandler {
    pub fn new(
        protocol_version: u32,
        client_type: u32,
        seeded_message_id: i64,
        transport: Arc<dyn Transport>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            protocol_version,
            client_type,
            message_id: seeded_message_id,
            max_known_server_time_ms: 0,
            pending_acks: HashSet::new(),
            pending_ack_all: false,
            codec: BincodeCodec,
            transport,
            metrics,
        }
    }

    pub fn current_message_id(&self) -> i64 {
        self.message_id
    }

    fn take_message_id(&mut self) -> i64 {
        let id = self.message_id;
        self.message_id += 1;
        id
    }

    pub fn add_pending_ack(&mut self, invalidation: Invalidation) {
        self.pending_acks.insert(invalidation);
    }

    pub fn add_pending_ack_all(&mut self) {
        self.pending_ack_all = true;
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty() || self.pending_ack_all
    }

    pub fn drain_pending_acks(&mut self) -> (Vec<Invalidation>, bool) {
        (self.pending_acks.drain().collect(), std::mem::take(&mut self.pending_ack_all))
    }

    pub fn peek_pending_acks(&self) -> (Vec<Invalidation>, bool) {
        (self.pending_acks.iter().cloned().collect(), self.pending_ack_all)
    }

    fn track_server_time(&mut self, server_time_ms: i64) {
        self.max_known_server_time_ms = self.max_known_server_time_ms.max(server_time_ms);
    }

    fn build_header(&mut self, token: Option<ClientToken>, registration_summary: RegistrationSummary, client_time_ms: i64) -> ClientHeader {
        ClientHeader {
            protocol_version: self.protocol_version,
            client_type: self.client_type,
            client_token: token,
            registration_summary,
            client_time_ms,
            message_id: self.take_message_id(),
            max_known_server_time_ms: self.max_known_server_time_ms,
            message_id_debug_string: None,
        }
    }

    /// Builds, validates, throttle-gates, and sends one outbound message.
    ///
    /// Compose header+payload, validate (an outbound validation failure is
    /// an internal invariant violation), ask the throttler for permission
    /// (a defer leaves the pending data untouched and tells the caller
    /// when to retry), then encode and hand to transport, updating
    /// counters on success.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_message(
        &mut self,
        throttler: &mut Throttler,
        validator: &MessageValidator,
        session: &SessionState,
        now: Instant,
        client_time_ms: i64,
        token: Option<ClientToken>,
        registration_summary: RegistrationSummary,
        payload: ClientToServerPayload,
    ) -> EngineResult<SendOutcome> {
        let header = self.build_header(token, registration_summary, client_time_ms);
        let msg = ClientToServer { header, payload };
        let encoded = self
            .codec
            .encode(&msg)
            .map_err(|e| EngineError::Internal(format!("failed to encode outbound message: {e}")))?;

        validator
            .validate_outbound(&msg, session, encoded.len())
            .map_err(|e| EngineError::Internal(format!("outbound message rejected by validator: {e}")))?;

        match throttler.try_fire(now) {
            FireDecision::DeferUntil(t) => {
                self.metrics.record_throttle_defer();
                // Roll back the message id we reserved: this attempt never
                // left the process, so the next real send should reuse it
                // rather than create a gap.
                self.message_id -= 1;
                Ok(SendOutcome::Deferred(t))
            }
            FireDecision::Allowed => {
                self.transport.send(encoded).await?;
                self.metrics.record_sent();
                Ok(SendOutcome::Sent)
            }
        }
    }

    /// Parses and validates an inbound message, dropping (and logging) it
    /// on any failure or client-token mismatch. Returns `None` in every
    /// dropped case.
    pub fn handle_incoming(
        &mut self,
        bytes: &[u8],
        validator: &MessageValidator,
        current_token: Option<&ClientToken>,
    ) -> Option<ServerToClient> {
        let msg: ServerToClient = match self.codec.decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed inbound message");
                self.metrics.record_dropped_invalid();
                return None;
            }
        };

        if let Err(e) = validator.validate_inbound(&msg, bytes.len()) {
            tracing::warn!(error = %e, "dropping invalid inbound message");
            self.metrics.record_dropped_invalid();
            return None;
        }

        if let (Some(incoming), Some(current)) = (&msg.header.client_token, current_token) {
            if incoming != current {
                tracing::info!("dropping message with mismatched client token");
                return None;
            }
        }

        self.track_server_time(msg.header.server_time_ms);
        self.metrics.record_received();
        Some(msg)
    }
}
