//! The application upcall surface and the ack-callback every invalidation
//! delivery carries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::model::{Invalidation, ObjectId};

/// A one-shot handle passed alongside every invalidation upcall. Invoking
/// it is the only signal that tells the engine it may ack the
/// invalidation to the server; repeat invocations are dropped. An
/// invalidation is only added to the pending-ack set once this is
/// invoked, never when the upcall is first issued.
#[derive(Clone)]
pub struct AckHandle {
    invoked: Arc<AtomicBool>,
    on_ack: Arc<dyn Fn() + Send + Sync>,
}

impl AckHandle {
    pub fn new(on_ack: impl Fn() + Send + Sync + 'static) -> Self {
        Self { invoked: Arc::new(AtomicBool::new(false)), on_ack: Arc::new(on_ack) }
    }

    /// Invokes the callback exactly once; subsequent calls are no-ops.
    pub fn ack(&self) {
        if self.invoked.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            (self.on_ack)();
        }
    }
}

/// State reported via `informRegistrationStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Registered,
    Unregistered,
}

/// The host application's upcall surface. Every method is invoked from
/// the engine's single internal task; an implementation must not block
/// on I/O, and any panic it raises is not the engine's concern — the
/// engine neither retries the upcall nor acks until `ack` is invoked.
pub trait ApplicationListener: Send + Sync {
    fn ready(&self) {}

    fn invalidate(&self, invalidation: Invalidation, ack: AckHandle);

    fn invalidate_unknown_version(&self, object_id: ObjectId, ack: AckHandle);

    fn invalidate_all(&self, ack: AckHandle);

    fn inform_registration_status(&self, _object_id: ObjectId, _state: RegistrationState) {}

    fn inform_registration_failure(&self, _object_id: ObjectId, _is_transient: bool, _reason: String) {}

    /// Requests that the host re-call `register` for everything matching
    /// `prefix` (a registration subtree the server asked to resync).
    fn reissue_registrations(&self, _prefix: Vec<u8>, _length: u32) {}

    fn inform_error(&self, _reason: String) {}

    /// Called exactly once whenever the stored token changes value or is
    /// cleared. This is the authoritative signal that every prior
    /// registration is now unconfirmed and must be re-issued.
    fn all_registrations_lost(&self) {}
}
