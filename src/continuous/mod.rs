//! Continuous routine coordination
//!
//! A [`ContinuousProcessor`] is the per-node context of the protocol. It is
//! built when the node starts, owns the node's routine registry and the
//! coordinators, and is handed every message the ring delivers to the node.
//!
//! Registration of a routine:
//!
//! 1. The initiator snapshots the ring, records a pending registration and
//!    sends the start token to itself.
//! 2. Each node the token reaches attempts a local start, notes a failure
//!    in the token and forwards it to the next live node that still has to
//!    see it.
//! 3. When no such node remains, the token goes to the oldest live node,
//!    which produces the single acknowledgment, rolls partial starts back
//!    if any node failed and disseminates the acknowledgment.
//! 4. The acknowledgment resolves the caller on the initiating node.

pub mod completion;
pub mod lifecycle;
pub mod message;
pub mod processor;
pub mod registry;
pub mod rollback;

pub use completion::{CompletionCoordinator, PendingRegistration, PendingRoutine};
pub use lifecycle::{LifecycleTracker, RoutineLifecycle};
pub use message::{
    CatchUpMessage, CompletedRoutine, ErrorMap, RoutineMessage, StartRequestData,
    StartRoutineAckMessage, StartRoutineMessage, StopReason, StopRoutineMessage,
};
pub use processor::{CatchUpOutcome, LocalStartProcessor};
pub use registry::{RegistrationState, RoutineRegistration, RoutineRegistry};
pub use rollback::RollbackCoordinator;

use std::sync::Arc;
use tracing::{debug, info, warn};
use crate::config::RoutineConfig;
use crate::engine::ExecutionEngine;
use crate::error::{ContinuumError, ContinuumResult, TransportError};
use crate::transport::{coordinator, RingTransport, SendError, TopologyEvent};
use crate::types::{LogicalClock, NodeId, RoutineId};

/// Per-node context of the routine coordination protocol
#[derive(Debug)]
pub struct ContinuousProcessor {
    node_id: NodeId,
    config: RoutineConfig,
    clock: Arc<LogicalClock>,
    registry: Arc<RoutineRegistry>,
    transport: Arc<dyn RingTransport>,
    processor: LocalStartProcessor,
    completion: CompletionCoordinator,
    rollback: Arc<RollbackCoordinator>,
}

impl ContinuousProcessor {
    pub fn new(
        node_id: NodeId,
        config: RoutineConfig,
        engine: Arc<dyn ExecutionEngine>,
        transport: Arc<dyn RingTransport>,
    ) -> Self {
        let clock = Arc::new(LogicalClock::new());
        let registry = Arc::new(RoutineRegistry::new(node_id));
        let processor = LocalStartProcessor::new(
            node_id,
            Arc::clone(&registry),
            Arc::clone(&engine),
            Arc::clone(&clock),
            config.start_timeout,
        );
        let rollback = Arc::new(RollbackCoordinator::new(
            node_id,
            Arc::clone(&registry),
            engine,
            Arc::clone(&transport),
            Arc::clone(&clock),
            config.stop_timeout,
        ));
        let completion = CompletionCoordinator::new(
            node_id,
            Arc::clone(&registry),
            Arc::clone(&rollback),
            Arc::clone(&transport),
        );

        Self {
            node_id,
            config,
            clock,
            registry,
            transport,
            processor,
            completion,
            rollback,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &RoutineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoutineRegistry> {
        &self.registry
    }

    pub fn completion(&self) -> &CompletionCoordinator {
        &self.completion
    }

    /// Register a routine on every live node and wait for the outcome
    pub async fn register_routine(&self, request: StartRequestData) -> ContinuumResult<RoutineId> {
        self.start_routine(request).await?.outcome().await
    }

    /// Send the start token and return as soon as it is on the ring
    pub async fn start_routine(&self, request: StartRequestData) -> ContinuumResult<PendingRoutine> {
        request.validate(&self.config)?;

        let ring = self.transport.topology().await;
        if ring.is_empty() {
            return Err(TransportError::EmptyRing.into());
        }

        let routine_id = RoutineId::new();
        let seq = self.clock.tick(self.node_id);
        let pending = self.completion.begin(routine_id, ring.iter().copied().collect());
        let token = StartRoutineMessage::new(routine_id, self.node_id, seq, request, ring);

        self.completion.mark_in_transit(routine_id)?;
        if let Err(err) = self.transport.send(self.node_id, RoutineMessage::Start(token)).await {
            self.completion.abandon(routine_id);
            return Err(TransportError::NodeLeft(err.node).into());
        }

        info!(%routine_id, node_id = %self.node_id, "routine registration started");
        Ok(pending)
    }

    /// Stop a routine on every live node.
    ///
    /// The stop is stamped with this node's clock, so it is only ordered
    /// after the start if this node has seen that start: either it began
    /// the registration or the start token or a catch-up reached it.
    /// Unregistering a routine this node has never seen is rejected.
    pub async fn unregister_routine(&self, routine_id: RoutineId) -> ContinuumResult<()> {
        if !self.registry.has_seen(routine_id) && self.completion.pending_state(routine_id).is_none() {
            return Err(ContinuumError::UnknownRoutine(routine_id));
        }
        let reached = self.rollback.issue_stop(routine_id, StopReason::Unregister).await;
        info!(%routine_id, node_id = %self.node_id, reached, "routine unregistered");
        Ok(())
    }

    /// Delivery handler: every message the ring hands to this node lands here
    pub async fn deliver(&self, message: RoutineMessage) -> ContinuumResult<()> {
        match message {
            RoutineMessage::Start(token) => {
                self.clock.observe(token.seq());
                let token = self.processor.process(token).await;
                self.route(token).await
            }
            RoutineMessage::Ack(ack) => {
                self.completion.apply_ack(&ack).await;
                Ok(())
            }
            RoutineMessage::Stop(stop) => {
                self.clock.observe(stop.seq());
                self.rollback.apply_stop(&stop).await;
                Ok(())
            }
            RoutineMessage::CatchUp(catch_up) => {
                for routine in &catch_up.routines {
                    self.clock.observe(routine.seq);
                    let outcome = self.processor.catch_up(routine).await;
                    debug!(routine_id = %routine.routine_id, node_id = %self.node_id, ?outcome, "catch-up applied");
                }
                Ok(())
            }
        }
    }

    /// Forward a processed token, or complete it if no live expected node is left
    async fn route(&self, mut token: StartRoutineMessage) -> ContinuumResult<()> {
        loop {
            let ring = self.transport.topology().await;
            for departed in token.retain_live(&ring) {
                debug!(routine_id = %token.routine_id(), %departed, "dropping departed node from expected set");
            }

            let target = match token.next_hop(self.node_id, &ring) {
                Some(next) => next,
                None => match coordinator(&ring) {
                    Some(coordinator) if coordinator == self.node_id => {
                        self.completion.complete(token).await?;
                        return Ok(());
                    }
                    Some(coordinator) => coordinator,
                    None => return Err(TransportError::EmptyRing.into()),
                },
            };

            match self.transport.send(target, RoutineMessage::Start(token)).await {
                Ok(()) => return Ok(()),
                Err(SendError { node, message }) => {
                    debug!(%node, "next hop left the ring, rerouting");
                    let RoutineMessage::Start(returned) = message else {
                        return Err(TransportError::Undeliverable("start").into());
                    };
                    token = returned;
                }
            }
        }
    }

    /// React to a membership change reported by the ring
    pub async fn on_topology_event(&self, event: TopologyEvent) -> ContinuumResult<()> {
        match event {
            TopologyEvent::Joined(node) => {
                self.registry.mark_rejoined(node);
                if !self.config.catch_up_on_join || node == self.node_id {
                    return Ok(());
                }
                let ring = self.transport.topology().await;
                if coordinator(&ring) != Some(self.node_id) {
                    return Ok(());
                }
                let routines = self.registry.completed_routines();
                if routines.is_empty() {
                    return Ok(());
                }
                info!(%node, count = routines.len(), "replaying completed routines to joining node");
                if let Err(err) = self.transport
                    .send(node, RoutineMessage::CatchUp(CatchUpMessage { routines }))
                    .await
                {
                    warn!(%node, error = %err, "joining node left before catch-up");
                }
                Ok(())
            }
            TopologyEvent::Left(node) => {
                // starts of this initiator arriving later are refused
                self.registry.mark_departed(node);
                self.rollback.unsubscribe_departed(node).await;
                Ok(())
            }
        }
    }
}
