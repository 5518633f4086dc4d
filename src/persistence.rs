//! PersistenceCodec: MAC-wraps and MAC-verifies the session blob written
//! to the host's persistent byte store.

use crate::digest::Digest;
use crate::model::{PersistentStateBlob, PersistentTiclState};
use crate::wire::{BincodeCodec, MessageCodec};

pub struct PersistenceCodec {
    digest: Box<dyn Digest>,
    codec: BincodeCodec,
}

impl PersistenceCodec {
    pub fn new(digest: Box<dyn Digest>) -> Self {
        Self { digest, codec: BincodeCodec }
    }

    /// Serializes `state` wrapped in an envelope carrying `H(serialize(state))`.
    pub fn write(&self, state: &PersistentTiclState) -> Vec<u8> {
        let state_bytes = self
            .codec
            .encode(state)
            .expect("PersistentTiclState is always serializable");
        let mac = self.digest.digest(&state_bytes);
        let blob = PersistentStateBlob { state: state.clone(), mac };
        self.codec.encode(&blob).expect("PersistentStateBlob is always serializable")
    }

    /// Parses an envelope and returns the contained state only if its MAC
    /// recomputes to match. Any parse failure or MAC mismatch is treated
    /// as "no persisted state".
    pub fn read(&self, bytes: &[u8]) -> Option<PersistentTiclState> {
        let blob: PersistentStateBlob = self.codec.decode(bytes).ok()?;
        let state_bytes = self.codec.encode(&blob.state).ok()?;
        let recomputed = self.digest.digest(&state_bytes);
        if recomputed == blob.mac {
            Some(blob.state)
        } else {
            None
        }
    }
}
