//! Wire protocol record shapes and the byte-exact codec used
//! to encode/decode them. The codec is a narrow, swappable seam
//! (`MessageCodec`) so an integration can pick a different bit-exact
//! format without touching the protocol engine; this crate ships a
//! `bincode` implementation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    ClientToken, Invalidation, Nonce, RegistrationOp, RegistrationStatus, RegistrationSubtree,
    RegistrationSummary,
};

/// Header carried on every outbound and inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHeader {
    pub protocol_version: u32,
    pub client_type: u32,
    pub client_token: Option<ClientToken>,
    pub registration_summary: RegistrationSummary,
    pub client_time_ms: i64,
    pub message_id: i64,
    pub max_known_server_time_ms: i64,
    pub message_id_debug_string: Option<String>,
}

/// Performance counters reported in an `InfoMessage`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineCounters {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped_invalid: u64,
    pub throttle_defers: u64,
    pub registrations_succeeded: u64,
    pub registrations_failed: u64,
}

/// Configuration parameters reported in an `InfoMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigParams {
    pub batching_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub smear_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientToServerPayload {
    Initialize { nonce: Nonce, application_client_id: Vec<u8> },
    InfoMessage { counters: EngineCounters, config_params: ConfigParams },
    RegistrationMsg { ops: Vec<RegistrationOp> },
    RegistrationSyncMsg { subtrees: Vec<RegistrationSubtree> },
    /// `ack_all` is set when the acknowledged batch includes the
    /// all-object-ids invalidation (`ApplicationListener::invalidate_all`);
    /// it has no corresponding entry in `invalidations` since there is no
    /// single object id to name.
    InvalidationAckMsg { invalidations: Vec<Invalidation>, ack_all: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientToServer {
    pub header: ClientHeader,
    pub payload: ClientToServerPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenControlStatus {
    Success,
    AuthFailure,
    UnknownClient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerToClientPayload {
    TokenControl { new_token: Option<ClientToken>, nonce: Nonce, status: TokenControlStatus },
    /// `all_object_ids` signals an invalidate-all sweep (delivered to the
    /// listener via `invalidateAll` instead of per-object `invalidate`
    /// calls); `invalidations` carries the ordinary per-object entries,
    /// which may be non-empty even when `all_object_ids` is set.
    InvalidationMsg { invalidations: Vec<Invalidation>, all_object_ids: bool },
    RegistrationStatusMsg { statuses: Vec<RegistrationStatus> },
    RegistrationSyncRequest,
    InfoRequest { info_types: Vec<String> },
    ErrorMsg { status: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerToClient {
    pub header: ServerHeader,
    pub payload: ServerToClientPayload,
}

/// Servers echo a header shape too (server_time_ms, the server's own view
/// of the registration summary for divergence detection, plus optional
/// interval overrides for heartbeat/poll cadence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHeader {
    pub client_token: Option<ClientToken>,
    pub server_time_ms: i64,
    /// The server's confirmed registration summary for this client, if it
    /// has one yet. Compared against `RegistrationManager`'s own summary
    /// via `check_summary` to detect divergence; absent before the server
    /// has ever confirmed a registration set.
    pub registration_summary: Option<RegistrationSummary>,
    pub next_heartbeat_interval_ms: Option<u64>,
    pub next_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Byte-exact serializer/parser for wire messages and the persistence
/// envelope. `encode` cannot fail for well-formed in-memory values in the
/// bincode implementation, but the trait allows for codecs that can.
pub trait MessageCodec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Default wire codec: `bincode` 1.x, a fixed little-endian binary format.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl MessageCodec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
