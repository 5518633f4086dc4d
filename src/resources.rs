//! The external collaborators the core consumes but does not implement:
//! a network transport and a persistent byte-blob store. The wall clock
//! and the delayed-task scheduler are
//! supplied by `tokio` itself (see `scheduler.rs`) rather than modeled as
//! separate traits, since `tokio::time` already gives the core an
//! injectable, test-controllable clock (paused virtual time) without a
//! hand-rolled abstraction.

use async_trait::async_trait;

use crate::error::EngineResult;

/// A delivery channel to the remote invalidation service. `send` is
/// fire-and-forget: failures are reported through the return value so the
/// caller can retain pending work and retry on the next batcher fire.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> EngineResult<()>;
}

/// The host's persistent byte-blob store. `write` is fire-and-forget by
/// design: the engine does not await it, and a write that completes
/// after `stop()` may simply be lost.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn read(&self) -> EngineResult<Option<Vec<u8>>>;
    async fn write(&self, bytes: Vec<u8>) -> EngineResult<()>;
}
