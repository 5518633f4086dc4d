//! RegistrationManager: tracks desired registrations, pending ops, and the
//! server-confirmed summary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::digest::Digest;
use crate::model::{
    ObjectId, RegistrationOp, RegistrationOpKind, RegistrationOutcome, RegistrationStatus,
    RegistrationSubtree, RegistrationSummary,
};

/// What happened to one object as a result of `apply_status`, surfaced to
/// the application listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    Confirmed { object_id: ObjectId, registered: bool },
    PermanentFailure { object_id: ObjectId, reason: String },
    TransientFailure { object_id: ObjectId, reason: String },
}

pub struct RegistrationManager {
    digest: Arc<dyn Digest>,
    pending_ops: HashMap<ObjectId, RegistrationOpKind>,
    desired: HashSet<ObjectId>,
    confirmed_summary: RegistrationSummary,
    sync_subtrees: HashSet<RegistrationSubtree>,
    /// Set when the server's summary disagrees with ours; the next
    /// outbound header must carry a freshly computed local summary.
    summary_dirty: bool,
}

impl RegistrationManager {
    pub fn new(digest: Arc<dyn Digest>) -> Self {
        Self {
            digest,
            pending_ops: HashMap::new(),
            desired: HashSet::new(),
            confirmed_summary: RegistrationSummary::empty(),
            sync_subtrees: HashSet::new(),
            summary_dirty: false,
        }
    }

    /// Resets all bookkeeping to the empty state. Called whenever the
    /// stored token changes.
    pub fn reset_confirmed_summary(&mut self) {
        self.confirmed_summary = RegistrationSummary::empty();
        self.summary_dirty = false;
    }

    /// Enqueues a registration intent. A newly enqueued op for an
    /// already-pending object overwrites the previous one outright — the
    /// most recent intent wins.
    pub fn enqueue(&mut self, object_id: ObjectId, op: RegistrationOpKind) {
        match op {
            RegistrationOpKind::Register => {
                self.desired.insert(object_id.clone());
            }
            RegistrationOpKind::Unregister => {
                self.desired.remove(&object_id);
            }
        }
        self.pending_ops.insert(object_id, op);
    }

    /// Removes and returns all currently pending ops, in arbitrary order.
    pub fn drain_pending(&mut self) -> Vec<RegistrationOp> {
        self.pending_ops
            .drain()
            .map(|(object_id, op)| RegistrationOp { object_id, op })
            .collect()
    }

    /// Non-destructive view of the currently pending ops, used to build an
    /// outbound message before knowing whether the throttler will allow it
    /// to actually go out: a deferred send must leave pending data
    /// untouched.
    pub fn peek_pending(&self) -> Vec<RegistrationOp> {
        self.pending_ops
            .iter()
            .map(|(object_id, op)| RegistrationOp { object_id: object_id.clone(), op: *op })
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_ops.is_empty()
    }

    pub fn has_sync_subtrees(&self) -> bool {
        !self.sync_subtrees.is_empty()
    }

    pub fn drain_sync_subtrees(&mut self) -> Vec<RegistrationSubtree> {
        self.sync_subtrees.drain().collect()
    }

    pub fn peek_sync_subtrees(&self) -> Vec<RegistrationSubtree> {
        self.sync_subtrees.iter().cloned().collect()
    }

    /// Applies server-reported outcomes for previously sent ops.
    ///
    /// - success matching the desired state: record confirmation.
    /// - permanent failure: revert `desired` for that object and surface
    ///   an event for the listener.
    /// - transient failure: re-populate `pending_ops` so the next batch
    ///   retries.
    pub fn apply_status(&mut self, statuses: Vec<RegistrationStatus>) -> Vec<RegistrationEvent> {
        let mut events = Vec::with_capacity(statuses.len());
        for status in statuses {
            match status.outcome {
                RegistrationOutcome::Success => {
                    let matches_desired = match status.op {
                        RegistrationOpKind::Register => self.desired.contains(&status.object_id),
                        RegistrationOpKind::Unregister => !self.desired.contains(&status.object_id),
                    };
                    if matches_desired {
                        events.push(RegistrationEvent::Confirmed {
                            object_id: status.object_id,
                            registered: matches!(status.op, RegistrationOpKind::Register),
                        });
                    }
                }
                RegistrationOutcome::Failure(kind) => match kind {
                    crate::model::RegistrationFailureKind::Permanent => {
                        self.desired.remove(&status.object_id);
                        self.pending_ops.remove(&status.object_id);
                        events.push(RegistrationEvent::PermanentFailure {
                            object_id: status.object_id,
                            reason: "permanent registration failure".to_string(),
                        });
                    }
                    crate::model::RegistrationFailureKind::Transient => {
                        events.push(RegistrationEvent::TransientFailure {
                            object_id: status.object_id.clone(),
                            reason: "transient registration failure".to_string(),
                        });
                        self.pending_ops.insert(status.object_id, status.op);
                    }
                },
            }
        }
        events
    }

    /// Rebuilds sync subtrees covering the full desired set for the next
    /// send, in response to a server-requested re-sync, and returns them
    /// so the caller can ask the host to `reissueRegistrations` against
    /// each one.
    pub fn apply_sync_request(&mut self) -> Vec<RegistrationSubtree> {
        // A single subtree spanning the whole namespace is sufficient:
        // the server's `RegistrationSyncRequest` names no narrower scope.
        let subtree = RegistrationSubtree { prefix: Vec::new(), length: 0 };
        self.sync_subtrees.insert(subtree.clone());
        vec![subtree]
    }

    /// Compares the server's summary against ours; a mismatch marks the
    /// next outbound header's summary as needing a recompute and ensures
    /// a sync subtree will accompany a subsequent server sync request.
    pub fn check_summary(&mut self, server_summary: &RegistrationSummary) {
        if *server_summary != self.confirmed_summary {
            self.summary_dirty = true;
        }
    }

    /// The registration summary to put on the next outbound header:
    /// freshly recomputed if dirty, otherwise the last confirmed one.
    pub fn current_summary(&mut self) -> RegistrationSummary {
        if self.summary_dirty {
            self.confirmed_summary = self.compute_summary();
            self.summary_dirty = false;
        }
        self.confirmed_summary.clone()
    }

    /// Digest combiner: sort serialized object ids lexicographically,
    /// concatenate, hash once. Deterministic regardless of insertion
    /// order and collision-resistant the way XOR-of-per-object-digests
    /// is not.
    fn compute_summary(&self) -> RegistrationSummary {
        let mut ids: Vec<&ObjectId> = self.desired.iter().collect();
        ids.sort_by(|a, b| a.canonical_bytes().cmp(&b.canonical_bytes()));
        let mut buf = Vec::new();
        for id in &ids {
            buf.extend_from_slice(&id.canonical_bytes());
        }
        let digest = self.digest.digest(&buf);
        RegistrationSummary { num_registrations: ids.len() as u64, digest }
    }

    pub fn desired(&self) -> &HashSet<ObjectId> {
        &self.desired
    }
}
