//! Stop directives and rollback
//!
//! The same stop directive serves three purposes: an explicit unregister,
//! the compensation issued after an aggregate start failure, and the local
//! teardown of routines whose initiator left the cluster. Each directive
//! carries a sequence number; a node only removes a registration whose
//! start was ordered before the stop, and remembers the stop so a start
//! arriving late is skipped.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::continuous::message::{
    RoutineMessage, StartRoutineAckMessage, StopReason, StopRoutineMessage,
};
use crate::continuous::registry::{RegistrationState, RoutineRegistry};
use crate::engine::ExecutionEngine;
use crate::transport::RingTransport;
use crate::types::{LogicalClock, NodeId, RoutineId};

/// Issues and applies stop directives on one node
#[derive(Debug)]
pub struct RollbackCoordinator {
    node_id: NodeId,
    registry: Arc<RoutineRegistry>,
    engine: Arc<dyn ExecutionEngine>,
    transport: Arc<dyn RingTransport>,
    clock: Arc<LogicalClock>,
    stop_timeout: Duration,
}

impl RollbackCoordinator {
    pub fn new(
        node_id: NodeId,
        registry: Arc<RoutineRegistry>,
        engine: Arc<dyn ExecutionEngine>,
        transport: Arc<dyn RingTransport>,
        clock: Arc<LogicalClock>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            registry,
            engine,
            transport,
            clock,
            stop_timeout,
        }
    }

    /// Undo partial starts after an acknowledgment that carries errors
    pub async fn roll_back(&self, ack: &StartRoutineAckMessage) -> usize {
        info!(
            routine_id = %ack.routine_id(),
            failed_nodes = ack.errs().len(),
            "rolling back partially started routine"
        );
        self.issue_stop(ack.routine_id(), StopReason::Rollback).await
    }

    /// Stop a routine locally and on every other live node.
    ///
    /// Returns the number of nodes, this one included, that handled the
    /// directive. Nodes that depart before it reaches them are dropped.
    pub async fn issue_stop(&self, routine_id: RoutineId, reason: StopReason) -> usize {
        let stop = StopRoutineMessage::new(routine_id, self.clock.tick(self.node_id), reason);
        self.apply_stop(&stop).await;
        let remote = self.transport.broadcast(self.node_id, RoutineMessage::Stop(stop)).await;
        debug!(%routine_id, ?reason, remote, "stop directive delivered");
        remote + 1
    }

    /// Apply a stop directive to this node's registry.
    ///
    /// Returns whether a local registration was torn down.
    pub async fn apply_stop(&self, stop: &StopRoutineMessage) -> bool {
        let torn_down = self.stop_local(stop).await;
        self.registry.release(stop.routine_id());
        torn_down
    }

    async fn stop_local(&self, stop: &StopRoutineMessage) -> bool {
        let routine_id = stop.routine_id();
        let mut slot = self.registry.lock(routine_id).await;
        slot.record_stop(stop.seq());

        let tear_down = match slot.registration() {
            Some(registration) if registration.seq < stop.seq() => match stop.reason() {
                StopReason::Rollback => registration.state == RegistrationState::ActivePendingAck,
                StopReason::Unregister | StopReason::AutoUnsubscribe => true,
            },
            _ => false,
        };

        if stop.reason() != StopReason::Rollback {
            self.registry.forget_completed(routine_id);
        }

        if !tear_down {
            return false;
        }

        let Some(registration) = slot.take() else {
            return false;
        };
        match tokio::time::timeout(
            self.stop_timeout,
            self.engine.stop_local(routine_id, registration.handle),
        )
        .await
        {
            Ok(Ok(())) => debug!(%routine_id, node_id = %self.node_id, reason = ?stop.reason(), "routine stopped"),
            Ok(Err(err)) => warn!(%routine_id, node_id = %self.node_id, error = %err, "engine failed to stop routine"),
            Err(_) => warn!(%routine_id, node_id = %self.node_id, "engine stop timed out"),
        }
        true
    }

    /// Tear down routines started by a departed node that asked to follow it
    pub async fn unsubscribe_departed(&self, departed: NodeId) -> Vec<RoutineId> {
        let mut stopped = Vec::new();
        for registration in self.registry.started_by(departed).await {
            if !registration.request.auto_unsubscribe {
                continue;
            }
            let stop = StopRoutineMessage::new(
                registration.routine_id,
                self.clock.tick(self.node_id),
                StopReason::AutoUnsubscribe,
            );
            if self.apply_stop(&stop).await {
                stopped.push(registration.routine_id);
            }
        }
        if !stopped.is_empty() {
            info!(%departed, count = stopped.len(), "unsubscribed routines of departed initiator");
        }
        stopped
    }
}
