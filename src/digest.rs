//! The injected digest function `H` used by both the persistence MAC and
//! the registration-summary combiner. Plain integrity hashing, not a
//! keyed MAC — this protocol never introduces a shared secret, so `H`
//! only needs to be collision-resistant, not unforgeable against an
//! adversary holding the wire bytes.

use sha2::{Digest as _, Sha256};

/// A digest function, injectable so tests can swap it to observe the
/// "wrong digest function yields none" behavior on a persisted blob.
pub trait Digest: Send + Sync {
    fn digest(&self, bytes: &[u8]) -> Vec<u8>;
}

/// Default production digest: SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Digest;

impl Digest for Sha256Digest {
    fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hasher.finalize().to_vec()
    }
}
