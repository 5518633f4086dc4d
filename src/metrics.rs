//! Internal counters, snapshotted into an `EngineCounters` for the
//! `InfoMessage` payload.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::wire::EngineCounters;

#[derive(Default)]
pub struct Metrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped_invalid: AtomicU64,
    throttle_defers: AtomicU64,
    registrations_succeeded: AtomicU64,
    registrations_failed: AtomicU64,
}

impl Metrics {
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_invalid(&self) {
        self.messages_dropped_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle_defer(&self) {
        self.throttle_defers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration_succeeded(&self) {
        self.registrations_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration_failed(&self) {
        self.registrations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineCounters {
        EngineCounters {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped_invalid: self.messages_dropped_invalid.load(Ordering::Relaxed),
            throttle_defers: self.throttle_defers.load(Ordering::Relaxed),
            registrations_succeeded: self.registrations_succeeded.load(Ordering::Relaxed),
            registrations_failed: self.registrations_failed.load(Ordering::Relaxed),
        }
    }
}
