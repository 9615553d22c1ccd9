//! Cluster-level tests for routine registration
//!
//! Every test drives an in-process ring and waits for it to settle before
//! inspecting node state.

use std::sync::Arc;
use async_trait::async_trait;
use continuum::*;
use tokio::sync::Notify;

fn node(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

/// Engine whose starts block until the test releases them
#[derive(Debug, Default)]
struct GatedEngine {
    inner: InMemoryEngine,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ExecutionEngine for GatedEngine {
    async fn start_local(
        &self,
        routine_id: RoutineId,
        request: &StartRequestData,
    ) -> Result<HandlerHandle, RoutineError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.start_local(routine_id, request).await
    }

    async fn stop_local(&self, routine_id: RoutineId, handle: HandlerHandle) -> Result<(), RoutineError> {
        self.inner.stop_local(routine_id, handle).await
    }
}

struct Cluster {
    ring: LocalRing,
    engines: Vec<(NodeId, Arc<InMemoryEngine>)>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            ring: LocalRing::new(),
            engines: Vec::new(),
        }
    }

    fn with_nodes(count: u128) -> Self {
        let mut cluster = Self::new();
        for n in 1..=count {
            cluster.add(node(n), InMemoryEngine::default());
        }
        cluster
    }

    fn add(&mut self, node_id: NodeId, engine: InMemoryEngine) -> Arc<ContinuousProcessor> {
        let engine = Arc::new(engine);
        let processor = self
            .ring
            .join(node_id, engine.clone(), RoutineConfig::default())
            .unwrap();
        self.engines.push((node_id, engine));
        processor
    }

    fn add_gated(&mut self, node_id: NodeId) -> Arc<GatedEngine> {
        let engine = Arc::new(GatedEngine::default());
        self.ring
            .join(node_id, engine.clone(), RoutineConfig::default())
            .unwrap();
        engine
    }

    fn processor(&self, node_id: NodeId) -> Arc<ContinuousProcessor> {
        self.ring.processor(node_id).unwrap()
    }

    fn engine(&self, node_id: NodeId) -> &InMemoryEngine {
        &self.engines.iter().find(|(id, _)| *id == node_id).unwrap().1
    }

    async fn state(&self, node_id: NodeId, routine_id: RoutineId) -> Option<RegistrationState> {
        self.processor(node_id).registry().state(routine_id).await
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.ring.shutdown();
    }
}

#[cfg(test)]
mod registration_scenarios {
    use super::*;

    #[tokio::test]
    async fn test_all_nodes_succeed() {
        let cluster = Cluster::with_nodes(3);

        let routine_id = cluster
            .processor(node(1))
            .register_routine(StartRequestData::new("orders"))
            .await
            .unwrap();
        cluster.ring.settled().await;

        for n in 1..=3 {
            assert_eq!(cluster.state(node(n), routine_id).await, Some(RegistrationState::Active));
            assert!(cluster.engine(node(n)).is_active(routine_id));
            assert!(cluster.processor(node(n)).registry().is_completed(routine_id));
        }
    }

    #[tokio::test]
    async fn test_any_node_may_initiate() {
        let cluster = Cluster::with_nodes(4);

        let routine_id = cluster
            .processor(node(3))
            .register_routine(StartRequestData::new("orders").with_buffer_size(32))
            .await
            .unwrap();
        cluster.ring.settled().await;

        for n in 1..=4 {
            assert_eq!(cluster.state(node(n), routine_id).await, Some(RegistrationState::Active));
        }
        assert_eq!(cluster.processor(node(3)).completion().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_one_failing_node_rolls_back_everywhere() {
        let mut cluster = Cluster::new();
        cluster.add(node(1), InMemoryEngine::default());
        cluster.add(node(2), InMemoryEngine::default().reject_factory("orders"));
        cluster.add(node(3), InMemoryEngine::default());

        let pending = cluster
            .processor(node(1))
            .start_routine(StartRequestData::new("orders"))
            .await
            .unwrap();
        let routine_id = pending.routine_id();
        let err = pending.outcome().await.unwrap_err();
        cluster.ring.settled().await;

        let errs = err.node_errors().unwrap();
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[&node(2)], RoutineError::Validation(_)));
        assert!(matches!(err, ContinuumError::AggregateRegistration { .. }));

        for n in 1..=3 {
            assert!(cluster.state(node(n), routine_id).await.is_none());
            assert_eq!(cluster.engine(node(n)).active_count(), 0);
            assert!(!cluster.processor(node(n)).registry().is_completed(routine_id));
        }
    }

    #[tokio::test]
    async fn test_every_failure_is_reported_once() {
        let mut cluster = Cluster::new();
        cluster.add(node(1), InMemoryEngine::default());
        cluster.add(node(2), InMemoryEngine::new(0));
        cluster.add(node(3), InMemoryEngine::default().reject_factory("orders"));

        let err = cluster
            .processor(node(2))
            .register_routine(StartRequestData::new("orders"))
            .await
            .unwrap_err();

        let errs = err.node_errors().unwrap();
        assert_eq!(errs.keys().copied().collect::<Vec<_>>(), vec![node(2), node(3)]);
        assert!(matches!(errs[&node(2)], RoutineError::ResourceLimit(_)));
        assert!(matches!(errs[&node(3)], RoutineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_token_starts_once_and_acks_once() {
        let cluster = Cluster::with_nodes(3);
        let routine_id = RoutineId::new();
        let token = StartRoutineMessage::new(
            routine_id,
            node(1),
            Seq { counter: 100, node: node(1) },
            StartRequestData::new("orders"),
            [node(1), node(2), node(3)],
        );

        cluster.ring.send(node(1), RoutineMessage::Start(token.clone())).await.unwrap();
        cluster.ring.send(node(1), RoutineMessage::Start(token)).await.unwrap();
        cluster.ring.settled().await;

        for n in 1..=3 {
            assert_eq!(cluster.engine(node(n)).start_calls(), 1);
            assert_eq!(cluster.state(node(n), routine_id).await, Some(RegistrationState::Active));
        }
        let history = cluster
            .processor(node(1))
            .completion()
            .completion_history(routine_id)
            .unwrap();
        assert_eq!(history.last(), Some(&continuous::RoutineLifecycle::Consumed));
    }

    #[tokio::test]
    async fn test_departed_node_is_dropped_without_error() {
        let mut cluster = Cluster::new();
        let gate = cluster.add_gated(node(1));
        cluster.add(node(2), InMemoryEngine::default());
        cluster.add(node(3), InMemoryEngine::default());

        let pending = cluster
            .processor(node(1))
            .start_routine(StartRequestData::new("orders"))
            .await
            .unwrap();

        // node 1 is starting locally; node 2 has not seen the token yet
        gate.entered.notified().await;
        assert!(cluster.ring.leave(node(2)));
        gate.release.notify_one();

        let routine_id = pending.outcome().await.unwrap();
        cluster.ring.settled().await;

        assert_eq!(cluster.state(node(1), routine_id).await, Some(RegistrationState::Active));
        assert_eq!(cluster.state(node(3), routine_id).await, Some(RegistrationState::Active));
        assert_eq!(cluster.engine(node(2)).start_calls(), 0);
    }

    #[tokio::test]
    async fn test_token_resumes_when_holder_departs() {
        let mut cluster = Cluster::new();
        cluster.add(node(1), InMemoryEngine::default());
        let gate = cluster.add_gated(node(2));
        cluster.add(node(3), InMemoryEngine::default());

        let routine_id = cluster
            .processor(node(1))
            .start_routine(StartRequestData::new("orders"))
            .await
            .unwrap()
            .routine_id();

        gate.entered.notified().await;
        assert!(cluster.ring.leave(node(2)));
        cluster.ring.settled().await;

        assert_eq!(cluster.state(node(1), routine_id).await, Some(RegistrationState::Active));
        assert_eq!(cluster.state(node(3), routine_id).await, Some(RegistrationState::Active));
    }

    #[tokio::test]
    async fn test_completion_survives_initiator_departure() {
        let mut cluster = Cluster::new();
        cluster.add(node(1), InMemoryEngine::default());
        let gate = cluster.add_gated(node(2));
        cluster.add(node(3), InMemoryEngine::default());

        let routine_id = cluster
            .processor(node(2))
            .start_routine(StartRequestData::new("orders").with_auto_unsubscribe(false))
            .await
            .unwrap()
            .routine_id();

        gate.entered.notified().await;
        cluster.ring.leave(node(2));
        cluster.ring.settled().await;

        assert_eq!(cluster.state(node(1), routine_id).await, Some(RegistrationState::Active));
        assert_eq!(cluster.state(node(3), routine_id).await, Some(RegistrationState::Active));
        assert!(cluster.processor(node(1)).registry().is_completed(routine_id));
    }

    #[tokio::test]
    async fn test_stop_issued_right_after_start() {
        let cluster = Cluster::with_nodes(3);
        let initiator = cluster.processor(node(1));

        let pending = initiator.start_routine(StartRequestData::new("orders")).await.unwrap();
        let routine_id = pending.routine_id();
        initiator.unregister_routine(routine_id).await.unwrap();
        pending.outcome().await.unwrap();
        cluster.ring.settled().await;

        for n in 1..=3 {
            assert!(cluster.state(node(n), routine_id).await.is_none());
            assert_eq!(cluster.engine(node(n)).active_count(), 0);
            assert!(!cluster.processor(node(n)).registry().is_completed(routine_id));
        }
    }

    #[tokio::test]
    async fn test_stop_overtaking_the_ack() {
        let mut cluster = Cluster::new();
        cluster.add(node(1), InMemoryEngine::default());
        cluster.add(node(2), InMemoryEngine::default());
        let gate = cluster.add_gated(node(3));
        let initiator = cluster.processor(node(1));

        let pending = initiator.start_routine(StartRequestData::new("orders")).await.unwrap();
        let routine_id = pending.routine_id();

        // nodes 1 and 2 hold pending registrations, node 3 is mid-start
        gate.entered.notified().await;
        assert_eq!(
            cluster.state(node(2), routine_id).await,
            Some(RegistrationState::ActivePendingAck)
        );
        let stop = {
            let initiator = Arc::clone(&initiator);
            tokio::spawn(async move { initiator.unregister_routine(routine_id).await })
        };
        gate.release.notify_one();

        stop.await.unwrap().unwrap();
        pending.outcome().await.unwrap();
        cluster.ring.settled().await;

        for n in 1..=2 {
            assert!(cluster.state(node(n), routine_id).await.is_none());
            assert_eq!(cluster.engine(node(n)).active_count(), 0);
        }
        assert!(cluster.state(node(3), routine_id).await.is_none());
        assert!(!gate.inner.is_active(routine_id));
    }
}

#[cfg(test)]
mod membership_tests {
    use super::*;

    #[tokio::test]
    async fn test_joining_node_catches_up() {
        let mut cluster = Cluster::with_nodes(2);
        let routine_id = cluster
            .processor(node(1))
            .register_routine(StartRequestData::new("orders"))
            .await
            .unwrap();
        cluster.ring.settled().await;

        cluster.add(node(3), InMemoryEngine::default());
        cluster.ring.settled().await;

        assert_eq!(cluster.state(node(3), routine_id).await, Some(RegistrationState::Active));
        assert!(cluster.engine(node(3)).is_active(routine_id));
    }

    #[tokio::test]
    async fn test_node_joining_mid_circulation_catches_up() {
        let mut cluster = Cluster::new();
        let gate = cluster.add_gated(node(1));
        cluster.add(node(2), InMemoryEngine::default());

        let pending = cluster
            .processor(node(1))
            .start_routine(StartRequestData::new("orders"))
            .await
            .unwrap();
        gate.entered.notified().await;
        cluster.add(node(3), InMemoryEngine::default());
        gate.release.notify_one();

        let routine_id = pending.outcome().await.unwrap();
        cluster.ring.settled().await;

        for n in 1..=3 {
            assert_eq!(cluster.state(node(n), routine_id).await, Some(RegistrationState::Active));
        }
        assert_eq!(cluster.engine(node(3)).start_calls(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_routine_is_not_replayed() {
        let mut cluster = Cluster::with_nodes(2);
        let initiator = cluster.processor(node(1));
        let kept = initiator.register_routine(StartRequestData::new("orders")).await.unwrap();
        let dropped = initiator.register_routine(StartRequestData::new("audit")).await.unwrap();
        initiator.unregister_routine(dropped).await.unwrap();
        cluster.ring.settled().await;

        cluster.add(node(3), InMemoryEngine::default());
        cluster.ring.settled().await;

        assert_eq!(cluster.state(node(3), kept).await, Some(RegistrationState::Active));
        assert!(cluster.state(node(3), dropped).await.is_none());
    }

    #[tokio::test]
    async fn test_initiator_departure_unsubscribes_followers() {
        let cluster = Cluster::with_nodes(3);
        let initiator = cluster.processor(node(2));
        let following = initiator.register_routine(StartRequestData::new("orders")).await.unwrap();
        let staying = initiator
            .register_routine(StartRequestData::new("audit").with_auto_unsubscribe(false))
            .await
            .unwrap();
        cluster.ring.settled().await;

        cluster.ring.leave(node(2));
        cluster.ring.settled().await;

        for n in [1, 3] {
            assert!(cluster.state(node(n), following).await.is_none());
            assert!(!cluster.engine(node(n)).is_active(following));
            assert_eq!(cluster.state(node(n), staying).await, Some(RegistrationState::Active));
        }
        let completed = cluster.processor(node(1)).registry().completed_routines();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].routine_id, staying);
    }

    #[tokio::test]
    async fn test_start_reaching_node_after_initiator_left_is_not_installed() {
        let mut cluster = Cluster::new();
        cluster.add(node(1), InMemoryEngine::default());
        let gate = cluster.add_gated(node(2));
        cluster.add(node(3), InMemoryEngine::default());

        let routine_id = cluster
            .processor(node(1))
            .start_routine(StartRequestData::new("orders"))
            .await
            .unwrap()
            .routine_id();

        // node 2 is mid-start while node 3 learns that node 1 left
        gate.entered.notified().await;
        assert!(cluster.ring.leave(node(1)));
        let observer = cluster.processor(node(3));
        while !observer.registry().has_departed(node(1)) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        gate.release.notify_one();
        cluster.ring.settled().await;

        for n in [2, 3] {
            assert!(cluster.state(node(n), routine_id).await.is_none());
            assert!(!cluster.processor(node(n)).registry().is_completed(routine_id));
        }
        assert!(!gate.inner.is_active(routine_id));
        assert_eq!(cluster.engine(node(3)).start_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_registrations() {
        let cluster = Cluster::with_nodes(3);

        let registrations = (1..=3).map(|n| {
            let processor = cluster.processor(node(n));
            async move {
                processor
                    .register_routine(StartRequestData::new(format!("feed-{}", n)))
                    .await
            }
        });
        let routine_ids: Vec<RoutineId> = futures::future::join_all(registrations)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        cluster.ring.settled().await;

        for n in 1..=3 {
            assert_eq!(cluster.engine(node(n)).active_count(), 3);
            for routine_id in &routine_ids {
                assert_eq!(cluster.state(node(n), *routine_id).await, Some(RegistrationState::Active));
            }
        }
    }
}

#[cfg(test)]
mod bookkeeping_tests {
    use super::*;

    #[tokio::test]
    async fn test_settled_routines_release_their_bookkeeping() {
        let mut cluster = Cluster::with_nodes(2);
        cluster.add(node(3), InMemoryEngine::default().reject_factory("audit"));
        let initiator = cluster.processor(node(1));

        for _ in 0..25 {
            let routine_id = initiator.register_routine(StartRequestData::new("orders")).await.unwrap();
            initiator.unregister_routine(routine_id).await.unwrap();

            let err = initiator
                .register_routine(StartRequestData::new("audit"))
                .await
                .unwrap_err();
            assert!(err.node_errors().is_some());
        }
        cluster.ring.settled().await;

        for n in 1..=3 {
            let processor = cluster.processor(node(n));
            assert_eq!(processor.registry().slot_count(), 0);
            assert!(processor.registry().registrations().await.is_empty());
            assert!(processor.registry().completed_routines().is_empty());
            assert_eq!(processor.completion().in_progress_count(), 0);
            assert_eq!(cluster.engine(node(n)).active_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_installed_routine_keeps_its_slot() {
        let cluster = Cluster::with_nodes(2);
        let routine_id = cluster
            .processor(node(2))
            .register_routine(StartRequestData::new("orders"))
            .await
            .unwrap();
        cluster.ring.settled().await;

        for n in 1..=2 {
            assert_eq!(cluster.processor(node(n)).registry().slot_count(), 1);
            assert_eq!(cluster.state(node(n), routine_id).await, Some(RegistrationState::Active));
        }
    }
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_request_never_reaches_the_ring() {
        let cluster = Cluster::with_nodes(2);

        let err = cluster
            .processor(node(1))
            .register_routine(StartRequestData::new("orders").with_buffer_size(0))
            .await
            .unwrap_err();

        assert!(matches!(err, ContinuumError::Routine(RoutineError::Validation(_))));
        assert_eq!(cluster.engine(node(1)).start_calls(), 0);
        assert_eq!(cluster.engine(node(2)).start_calls(), 0);
    }

    #[tokio::test]
    async fn test_registration_from_departed_node_fails() {
        let cluster = Cluster::with_nodes(2);
        let departed = cluster.processor(node(2));
        cluster.ring.leave(node(2));

        let err = departed
            .register_routine(StartRequestData::new("orders"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContinuumError::Transport(TransportError::NodeLeft(id)) if id == node(2)
        ));
        assert_eq!(departed.completion().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistering_unseen_routine_is_rejected() {
        let cluster = Cluster::with_nodes(2);
        let unknown = RoutineId::new();

        let err = cluster
            .processor(node(1))
            .unregister_routine(unknown)
            .await
            .unwrap_err();

        assert!(matches!(err, ContinuumError::UnknownRoutine(id) if id == unknown));
        assert_eq!(cluster.processor(node(1)).registry().slot_count(), 0);
        assert_eq!(cluster.processor(node(2)).registry().slot_count(), 0);
    }
}
