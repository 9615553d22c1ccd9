//! Local start processing
//!
//! Runs on every node a start token reaches. A local failure is written
//! into the token's error map and the token moves on; nothing here stops
//! circulation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use crate::continuous::message::{CompletedRoutine, StartRoutineMessage};
use crate::continuous::registry::{RegistrationState, RoutineRegistration, RoutineRegistry};
use crate::engine::ExecutionEngine;
use crate::error::RoutineError;
use crate::types::{LogicalClock, NodeId};

/// Outcome of replaying one completed routine on this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpOutcome {
    Installed,
    AlreadyPresent,
    Stopped,
    /// Initiator left and asked for its routines to follow it
    InitiatorDeparted,
    Failed(RoutineError),
}

/// Attempts local starts for tokens passing through this node
#[derive(Debug)]
pub struct LocalStartProcessor {
    node_id: NodeId,
    registry: Arc<RoutineRegistry>,
    engine: Arc<dyn ExecutionEngine>,
    clock: Arc<LogicalClock>,
    start_timeout: Duration,
}

impl LocalStartProcessor {
    pub fn new(
        node_id: NodeId,
        registry: Arc<RoutineRegistry>,
        engine: Arc<dyn ExecutionEngine>,
        clock: Arc<LogicalClock>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            registry,
            engine,
            clock,
            start_timeout,
        }
    }

    /// Process a token arriving at this node and hand it back for forwarding
    pub async fn process(&self, mut token: StartRoutineMessage) -> StartRoutineMessage {
        if !token.awaits(self.node_id) {
            debug!(
                routine_id = %token.routine_id(),
                node_id = %self.node_id,
                "token passing through without local start"
            );
            return token;
        }

        if let Err(err) = self.start_local(&token).await {
            warn!(
                routine_id = %token.routine_id(),
                node_id = %self.node_id,
                error = %err,
                "local start failed"
            );
            token.add_error(self.node_id, err);
        }
        token.mark_visited(self.node_id);
        token
    }

    async fn start_local(&self, token: &StartRoutineMessage) -> Result<(), RoutineError> {
        let routine_id = token.routine_id();
        let mut slot = self.registry.lock(routine_id).await;

        if let Some(outcome) = slot.cached_start(token.seq()) {
            debug!(%routine_id, node_id = %self.node_id, "duplicate start token, replaying cached outcome");
            return outcome;
        }

        if self.registry.settled_at_or_after(routine_id, token.seq()) {
            debug!(%routine_id, node_id = %self.node_id, "start of an attempt already settled here, skipping");
            slot.record_start(token.seq(), Ok(()));
            slot.mark_acked();
            drop(slot);
            self.registry.release(routine_id);
            return Ok(());
        }

        if slot.stopped_after(token.seq()) {
            debug!(%routine_id, node_id = %self.node_id, "stop already ordered after this start, skipping");
            slot.record_start(token.seq(), Ok(()));
            return Ok(());
        }

        // the departed initiator's routines are already unsubscribed on this node
        if token.start_request().auto_unsubscribe && self.registry.has_departed(token.initiator()) {
            debug!(
                %routine_id,
                node_id = %self.node_id,
                initiator = %token.initiator(),
                "initiator left the ring, not installing"
            );
            self.clock.observe(token.seq());
            slot.record_stop(self.clock.tick(self.node_id));
            slot.record_start(token.seq(), Ok(()));
            return Ok(());
        }

        let outcome = match tokio::time::timeout(
            self.start_timeout,
            self.engine.start_local(routine_id, token.start_request()),
        )
        .await
        {
            Ok(Ok(handle)) => {
                slot.install(RoutineRegistration {
                    routine_id,
                    initiator: token.initiator(),
                    seq: token.seq(),
                    request: token.start_request().clone(),
                    handle,
                    state: RegistrationState::ActivePendingAck,
                });
                debug!(%routine_id, node_id = %self.node_id, "routine started, awaiting ack");
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RoutineError::Timeout(self.start_timeout.as_millis() as u64)),
        };

        slot.record_start(token.seq(), outcome.clone());
        outcome
    }

    /// Install a routine that was acknowledged before this node could see its token
    pub async fn catch_up(&self, routine: &CompletedRoutine) -> CatchUpOutcome {
        let routine_id = routine.routine_id;
        let outcome = self.install_completed(routine).await;
        if let CatchUpOutcome::Failed(err) = &outcome {
            warn!(%routine_id, node_id = %self.node_id, error = %err, "catch-up start failed");
        }
        self.registry.release(routine_id);
        outcome
    }

    async fn install_completed(&self, routine: &CompletedRoutine) -> CatchUpOutcome {
        let mut slot = self.registry.lock(routine.routine_id).await;
        // the routine was acknowledged cluster-wide, so no further ack comes for it
        slot.mark_acked();

        if slot.registration().is_some() {
            return CatchUpOutcome::AlreadyPresent;
        }
        if slot.stopped_after(routine.seq) || self.registry.settled_at_or_after(routine.routine_id, routine.seq) {
            return CatchUpOutcome::Stopped;
        }
        if routine.request.auto_unsubscribe && self.registry.has_departed(routine.initiator) {
            self.clock.observe(routine.seq);
            slot.record_stop(self.clock.tick(self.node_id));
            return CatchUpOutcome::InitiatorDeparted;
        }

        match tokio::time::timeout(
            self.start_timeout,
            self.engine.start_local(routine.routine_id, &routine.request),
        )
        .await
        {
            Ok(Ok(handle)) => {
                slot.install(RoutineRegistration {
                    routine_id: routine.routine_id,
                    initiator: routine.initiator,
                    seq: routine.seq,
                    request: routine.request.clone(),
                    handle,
                    state: RegistrationState::Active,
                });
                self.registry.mark_completed(routine.clone());
                CatchUpOutcome::Installed
            }
            Ok(Err(err)) => {
                slot.record_start(routine.seq, Err(err.clone()));
                CatchUpOutcome::Failed(err)
            }
            Err(_) => {
                let err = RoutineError::Timeout(self.start_timeout.as_millis() as u64);
                slot.record_start(routine.seq, Err(err.clone()));
                CatchUpOutcome::Failed(err)
            }
        }
    }
}
