//! Core data model: object identifiers, invalidations, registrations,
//! tokens, and the persisted session state.

use serde::{Deserialize, Serialize};

/// Opaque identifier for a cacheable object. Equality and ordering are
/// structural, so this can be used as a map key and sorted canonically for
/// registration-summary digests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub source: i32,
    pub name: Vec<u8>,
}

impl ObjectId {
    pub fn new(source: i32, name: impl Into<Vec<u8>>) -> Self {
        Self { source, name: name.into() }
    }

    /// Canonical byte encoding used as input to the registration summary
    /// digest and as the sort key for deterministic ordering.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.name.len());
        buf.extend_from_slice(&self.source.to_be_bytes());
        buf.extend_from_slice(&self.name);
        buf
    }
}

/// A server-pushed version invalidation for an object.
///
/// Equality is structural on `object_id` + `version`: two invalidations for
/// the same object at the same version are the same invalidation even if
/// their payloads differ (payload is opaque, server-supplied auxiliary
/// data).
///
/// `is_known_version` distinguishes an ordinary versioned invalidation from
/// one the server sent without a usable version number (delivered to the
/// listener via `invalidateUnknownVersion` instead of `invalidate`); `version`
/// is meaningless (always `0`) when this is `false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invalidation {
    pub object_id: ObjectId,
    pub version: i64,
    pub payload: Option<Vec<u8>>,
    pub is_known_version: bool,
}

impl Invalidation {
    pub fn known(object_id: ObjectId, version: i64, payload: Option<Vec<u8>>) -> Self {
        Self { object_id, version, payload, is_known_version: true }
    }

    pub fn unknown_version(object_id: ObjectId) -> Self {
        Self { object_id, version: 0, payload: None, is_known_version: false }
    }
}

impl PartialEq for Invalidation {
    fn eq(&self, other: &Self) -> bool {
        self.object_id == other.object_id && self.version == other.version
    }
}
impl Eq for Invalidation {}

impl std::hash::Hash for Invalidation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.object_id.hash(state);
        self.version.hash(state);
    }
}

/// A desired registration change for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationOpKind {
    Register,
    Unregister,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationOp {
    pub object_id: ObjectId,
    pub op: RegistrationOpKind,
}

/// Outcome of a registration attempt the server reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationFailureKind {
    Permanent,
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationOutcome {
    Success,
    Failure(RegistrationFailureKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationStatus {
    pub object_id: ObjectId,
    pub op: RegistrationOpKind,
    pub outcome: RegistrationOutcome,
}

/// A commutative digest over a desired registration set: two sets with the
/// same members produce the same summary regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSummary {
    pub num_registrations: u64,
    pub digest: Vec<u8>,
}

impl RegistrationSummary {
    /// The summary for an empty desired set.
    pub fn empty() -> Self {
        Self { num_registrations: 0, digest: Vec::new() }
    }
}

/// Subtree of the registration namespace the server wants resynced:
/// `prefix` is the leading bytes of a canonical object id and `length` the
/// number of significant bits within it. An empty prefix with `length ==
/// 0` denotes the whole namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationSubtree {
    pub prefix: Vec<u8>,
    pub length: u32,
}

/// Opaque server-issued client token. Absence means the client is
/// unassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientToken(pub Vec<u8>);

/// Client-generated single-use value correlating an Initialize with its
/// TokenControl response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce(pub Vec<u8>);

/// The session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unassigned,
    AwaitingToken(Nonce),
    Running(ClientToken),
    RunningStale,
    Stopped,
}

/// State persisted across restarts: the last outbound message id and the
/// currently assigned token (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentTiclState {
    pub last_message_id: i64,
    pub client_token: Option<ClientToken>,
}

/// On-disk envelope: the persisted state plus a MAC over its serialized
/// bytes. A blob whose recomputed MAC mismatches the stored one is
/// discarded as though absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentStateBlob {
    pub state: PersistentTiclState,
    pub mac: Vec<u8>,
}
