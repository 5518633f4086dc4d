//! OperationScheduler: maps an operation id to a nominal period and
//! coalesces repeated scheduling requests into a single pending fire.
//!
//! Fires are delivered by sending a message back onto the engine's single
//! command channel rather than invoking a handler in place, which is what
//! keeps every handler running on one logical thread: the channel *is*
//! that thread, in the form of the one task that drains it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::smear::Smearer;

/// Identifies a schedulable periodic or one-shot operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpId {
    Batcher,
    Heartbeat,
    Poll,
    InitializeRetry,
}

/// Schedules smeared delayed fires per [`OpId`], coalescing duplicate
/// requests so at most one fire is ever pending for a given op.
pub struct OperationScheduler<M: Send + 'static> {
    smearer: Arc<Smearer>,
    sender: UnboundedSender<M>,
    make_message: Arc<dyn Fn(OpId) -> M + Send + Sync>,
    periods: HashMap<OpId, Duration>,
    pending: HashMap<OpId, JoinHandle<()>>,
}

impl<M: Send + 'static> OperationScheduler<M> {
    pub fn new(
        smearer: Arc<Smearer>,
        sender: UnboundedSender<M>,
        make_message: impl Fn(OpId) -> M + Send + Sync + 'static,
    ) -> Self {
        Self {
            smearer,
            sender,
            make_message: Arc::new(make_message),
            periods: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Sets (or updates) the nominal period for `op_id`. A fire already in
    /// flight keeps its original delay — the new period takes effect only
    /// from the *next* fire.
    pub fn set_period(&mut self, op_id: OpId, period: Duration) {
        self.periods.insert(op_id, period);
    }

    /// Ensures exactly one future fire is pending for `op_id`, smeared
    /// from `delay`. If a fire is already pending, this call is a no-op
    /// (coalesced).
    pub fn schedule_in(&mut self, op_id: OpId, delay: Duration) {
        if let Some(handle) = self.pending.get(&op_id) {
            if !handle.is_finished() {
                return;
            }
        }
        let smeared = self.smearer.smear(delay);
        let sender = self.sender.clone();
        let make_message = Arc::clone(&self.make_message);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(smeared).await;
            let _ = sender.send(make_message(op_id));
        });
        self.pending.insert(op_id, handle);
    }

    /// Schedules `op_id` using its currently configured nominal period
    /// (falling back to `Duration::ZERO`, i.e. fire promptly, if none is
    /// configured — used for one-shot work like the initial Initialize).
    pub fn schedule(&mut self, op_id: OpId) {
        let period = self.periods.get(&op_id).copied().unwrap_or(Duration::ZERO);
        self.schedule_in(op_id, period);
    }

    /// True if a fire for `op_id` is currently pending.
    pub fn is_pending(&self, op_id: OpId) -> bool {
        self.pending.get(&op_id).map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Cancels every pending fire (engine stop).
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}
