//! Completion of a circulation
//!
//! The oldest live node completes every circulation. It claims the routine
//! id exactly once, turns the finished start token into the acknowledgment,
//! rolls partial starts back when the acknowledgment carries errors and
//! finally disseminates the acknowledgment, which resolves the caller's
//! pending registration on the initiating node.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use crate::continuous::lifecycle::{LifecycleTracker, RoutineLifecycle};
use crate::continuous::message::{
    CatchUpMessage, RoutineMessage, StartRoutineAckMessage, StartRoutineMessage,
};
use crate::continuous::registry::RoutineRegistry;
use crate::continuous::rollback::RollbackCoordinator;
use crate::error::{ContinuumError, ContinuumResult, LifecycleError};
use crate::transport::RingTransport;
use crate::types::{BoundedHistory, NodeId, RoutineId};

/// Finished attempts remembered to reject late duplicate completions
const RETIRED_COMPLETIONS: usize = 1024;

const SUCCESS_PATH: &[RoutineLifecycle] = &[
    RoutineLifecycle::Completing,
    RoutineLifecycle::Acked,
    RoutineLifecycle::Consumed,
];

const FAILURE_PATH: &[RoutineLifecycle] = &[
    RoutineLifecycle::Completing,
    RoutineLifecycle::Acked,
    RoutineLifecycle::RolledBack,
    RoutineLifecycle::Consumed,
];

/// Registration waiting for its acknowledgment on the initiating node
#[derive(Debug)]
pub struct PendingRegistration {
    routine_id: RoutineId,
    /// Topology snapshot taken when the token was sent
    expected: BTreeSet<NodeId>,
    lifecycle: LifecycleTracker,
    reply: Option<oneshot::Sender<ContinuumResult<RoutineId>>>,
}

impl PendingRegistration {
    pub fn routine_id(&self) -> RoutineId {
        self.routine_id
    }

    pub fn expected(&self) -> &BTreeSet<NodeId> {
        &self.expected
    }

    pub fn state(&self) -> RoutineLifecycle {
        self.lifecycle.state()
    }
}

/// Caller's handle on a registration in flight
#[derive(Debug)]
pub struct PendingRoutine {
    routine_id: RoutineId,
    reply: oneshot::Receiver<ContinuumResult<RoutineId>>,
}

impl PendingRoutine {
    /// Id assigned to the routine, usable before the outcome is known
    pub fn routine_id(&self) -> RoutineId {
        self.routine_id
    }

    /// Wait for the cluster-wide outcome
    pub async fn outcome(self) -> ContinuumResult<RoutineId> {
        let routine_id = self.routine_id;
        self.reply
            .await
            .unwrap_or(Err(ContinuumError::Abandoned(routine_id)))
    }
}

/// Detects end of circulation and finalizes registration attempts
#[derive(Debug)]
pub struct CompletionCoordinator {
    node_id: NodeId,
    registry: Arc<RoutineRegistry>,
    rollback: Arc<RollbackCoordinator>,
    transport: Arc<dyn RingTransport>,
    /// Attempts being completed by this node
    completions: DashMap<RoutineId, LifecycleTracker>,
    /// Transition history of attempts this node finished; a claim for one fails
    retired: Mutex<BoundedHistory<RoutineId, Vec<RoutineLifecycle>>>,
    pending: Mutex<HashMap<RoutineId, PendingRegistration>>,
}

impl CompletionCoordinator {
    pub fn new(
        node_id: NodeId,
        registry: Arc<RoutineRegistry>,
        rollback: Arc<RollbackCoordinator>,
        transport: Arc<dyn RingTransport>,
    ) -> Self {
        Self {
            node_id,
            registry,
            rollback,
            transport,
            completions: DashMap::new(),
            retired: Mutex::new(BoundedHistory::new(RETIRED_COMPLETIONS)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Record a registration about to be sent and hand back the caller's handle
    pub fn begin(&self, routine_id: RoutineId, expected: BTreeSet<NodeId>) -> PendingRoutine {
        let (reply, receiver) = oneshot::channel();
        self.pending.lock().insert(
            routine_id,
            PendingRegistration {
                routine_id,
                expected,
                lifecycle: LifecycleTracker::new(routine_id),
                reply: Some(reply),
            },
        );
        PendingRoutine {
            routine_id,
            reply: receiver,
        }
    }

    /// The token is being handed to the ring
    pub fn mark_in_transit(&self, routine_id: RoutineId) -> Result<(), LifecycleError> {
        match self.pending.lock().get_mut(&routine_id) {
            Some(pending) => pending.lifecycle.advance(RoutineLifecycle::InTransit),
            None => Ok(()),
        }
    }

    /// Drop a pending registration whose token never left this node
    pub fn abandon(&self, routine_id: RoutineId) {
        self.pending.lock().remove(&routine_id);
    }

    pub fn pending_state(&self, routine_id: RoutineId) -> Option<RoutineLifecycle> {
        self.pending.lock().get(&routine_id).map(PendingRegistration::state)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Transition history of an attempt completed by this node
    pub fn completion_history(&self, routine_id: RoutineId) -> Option<Vec<RoutineLifecycle>> {
        if let Some(tracker) = self.completions.get(&routine_id) {
            return Some(tracker.history().to_vec());
        }
        self.retired.lock().get(&routine_id).cloned()
    }

    /// Attempts whose completion is still under way
    pub fn in_progress_count(&self) -> usize {
        self.completions.len()
    }

    fn claim(&self, routine_id: RoutineId) -> Result<bool, LifecycleError> {
        if self.retired.lock().contains(&routine_id) {
            return Ok(false);
        }
        match self.completions.entry(routine_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                let mut tracker = LifecycleTracker::new(routine_id);
                tracker.advance_through(&[RoutineLifecycle::InTransit, RoutineLifecycle::Completing])?;
                entry.insert(tracker);
                Ok(true)
            }
        }
    }

    /// Move a consumed attempt out of the in-progress map
    fn retire(&self, routine_id: RoutineId) {
        let history = match self.completions.get(&routine_id) {
            Some(tracker) => tracker.history().to_vec(),
            None => return,
        };
        self.retired.lock().insert(routine_id, history);
        self.completions.remove(&routine_id);
    }

    fn advance(&self, routine_id: RoutineId, next: RoutineLifecycle) {
        if let Some(mut tracker) = self.completions.get_mut(&routine_id) {
            if let Err(err) = tracker.advance(next) {
                warn!(%routine_id, error = %err, "completion lifecycle out of order");
            }
        }
    }

    /// Finalize a token that every live expected node has processed.
    ///
    /// Returns `None` when this routine was already completed here, so at
    /// most one acknowledgment is produced per attempt.
    pub async fn complete(&self, token: StartRoutineMessage) -> ContinuumResult<Option<StartRoutineAckMessage>> {
        let routine_id = token.routine_id();
        if !self.claim(routine_id)? {
            debug!(%routine_id, node_id = %self.node_id, "duplicate completion ignored");
            return Ok(None);
        }

        let expected = token.expected().clone();
        let ack = token.ack_message();
        self.advance(routine_id, RoutineLifecycle::Acked);
        info!(
            %routine_id,
            node_id = %self.node_id,
            nodes = expected.len(),
            failed = ack.errs().len(),
            "circulation complete"
        );

        if !ack.is_success() {
            let reached = self.rollback.roll_back(&ack).await;
            debug!(%routine_id, reached, "rollback converged");
            self.advance(routine_id, RoutineLifecycle::RolledBack);
        }

        self.apply_ack(&ack).await;
        let reached = self.transport.broadcast(self.node_id, RoutineMessage::Ack(ack.clone())).await;
        debug!(%routine_id, reached, "ack disseminated");

        if ack.is_success() {
            self.catch_up_late_joiners(routine_id, &expected).await;
        }
        self.advance(routine_id, RoutineLifecycle::Consumed);
        self.retire(routine_id);
        Ok(Some(ack))
    }

    /// Nodes that joined while the token circulated never saw it
    async fn catch_up_late_joiners(&self, routine_id: RoutineId, expected: &BTreeSet<NodeId>) {
        let Some(routine) = self.registry.completed_routine(routine_id) else {
            return;
        };
        for node in self.transport.topology().await {
            if node == self.node_id || expected.contains(&node) {
                continue;
            }
            let message = RoutineMessage::CatchUp(CatchUpMessage {
                routines: vec![routine.clone()],
            });
            if let Err(err) = self.transport.send(node, message).await {
                debug!(%routine_id, error = %err, "late joiner left before catch-up");
            }
        }
    }

    /// Reconcile this node with a disseminated acknowledgment
    pub async fn apply_ack(&self, ack: &StartRoutineAckMessage) {
        self.registry.apply_ack(ack.routine_id(), ack.is_success()).await;
        self.resolve_pending(ack);
    }

    fn resolve_pending(&self, ack: &StartRoutineAckMessage) {
        let routine_id = ack.routine_id();
        let Some(mut pending) = self.pending.lock().remove(&routine_id) else {
            return;
        };

        let (path, outcome) = if ack.is_success() {
            (SUCCESS_PATH, Ok(routine_id))
        } else {
            (
                FAILURE_PATH,
                Err(ContinuumError::AggregateRegistration {
                    routine_id,
                    errs: ack.errs().clone(),
                }),
            )
        };
        if let Err(err) = pending.lifecycle.advance_through(path) {
            warn!(%routine_id, error = %err, "pending registration lifecycle out of order");
        }
        debug!(
            %routine_id,
            expected = pending.expected.len(),
            success = ack.is_success(),
            "pending registration resolved"
        );

        if let Some(reply) = pending.reply.take() {
            if reply.send(outcome).is_err() {
                debug!(%routine_id, "caller stopped waiting for registration outcome");
            }
        }
    }
}
