//! In-process ring transport
//!
//! Every member owns a FIFO inbox drained by a single tokio task, so a node
//! handles one message at a time in arrival order. Members are kept in join
//! order, which makes the oldest live node the first entry.
//!
//! The ring remembers the last copy of each start token it handed to a
//! node. When that node leaves before passing the token on, the copy is
//! re-delivered to the departed node's successor and circulation resumes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::config::RoutineConfig;
use crate::continuous::{ContinuousProcessor, RoutineMessage, StartRoutineMessage};
use crate::engine::ExecutionEngine;
use crate::error::{ContinuumResult, TransportError};
use crate::transport::{RingTransport, SendError, TopologyEvent};
use crate::types::{NodeId, RoutineId};

type Inbox = mpsc::UnboundedSender<Envelope>;

enum Delivery {
    Message {
        message: RoutineMessage,
        done: Option<oneshot::Sender<()>>,
    },
    Topology(TopologyEvent),
}

struct Envelope {
    delivery: Delivery,
    _in_flight: InFlight,
}

/// Counts deliveries that are queued or being handled
#[derive(Debug, Default)]
struct Tracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

struct InFlight(Arc<Tracker>);

impl InFlight {
    fn new(tracker: &Arc<Tracker>) -> Self {
        tracker.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(tracker))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

struct Member {
    node_id: NodeId,
    inbox: Inbox,
    task: JoinHandle<()>,
    processor: Arc<ContinuousProcessor>,
}

#[derive(Default)]
struct RingInner {
    members: RwLock<Vec<Member>>,
    retained: Mutex<HashMap<RoutineId, (NodeId, StartRoutineMessage)>>,
    tracker: Arc<Tracker>,
}

/// Ring of in-process nodes
#[derive(Clone, Default)]
pub struct LocalRing {
    inner: Arc<RingInner>,
}

impl std::fmt::Debug for LocalRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRing")
            .field("members", &self.members())
            .field("in_flight", &self.inner.tracker.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl LocalRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node at the end of the ring and start its delivery task
    pub fn join(
        &self,
        node_id: NodeId,
        engine: Arc<dyn ExecutionEngine>,
        config: RoutineConfig,
    ) -> ContinuumResult<Arc<ContinuousProcessor>> {
        let processor = Arc::new(ContinuousProcessor::new(
            node_id,
            config,
            engine,
            Arc::new(self.clone()),
        ));

        let others: Vec<Inbox> = {
            let mut members = self.inner.members.write();
            if members.iter().any(|member| member.node_id == node_id) {
                return Err(TransportError::DuplicateNode(node_id).into());
            }
            let others = members.iter().map(|member| member.inbox.clone()).collect();
            let (inbox, receiver) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_member(Arc::clone(&processor), receiver));
            members.push(Member {
                node_id,
                inbox,
                task,
                processor: Arc::clone(&processor),
            });
            others
        };

        for inbox in &others {
            let _ = self.enqueue(inbox, Delivery::Topology(TopologyEvent::Joined(node_id)));
        }
        info!(%node_id, ring_size = others.len() + 1, "node joined ring");
        Ok(processor)
    }

    /// Remove a node, stop its delivery task and resume any token it held.
    ///
    /// Returns false if the node was not a member.
    pub fn leave(&self, node_id: NodeId) -> bool {
        let (member, successors, remaining) = {
            let mut members = self.inner.members.write();
            let Some(position) = members.iter().position(|member| member.node_id == node_id) else {
                return false;
            };
            let member = members.remove(position);
            // successors in the ring order the departed node had
            let successors: Vec<NodeId> = members[position..]
                .iter()
                .chain(members[..position].iter())
                .map(|member| member.node_id)
                .collect();
            let remaining: Vec<Inbox> = members.iter().map(|member| member.inbox.clone()).collect();
            (member, successors, remaining)
        };
        member.task.abort();

        for inbox in &remaining {
            let _ = self.enqueue(inbox, Delivery::Topology(TopologyEvent::Left(node_id)));
        }
        info!(%node_id, ring_size = remaining.len(), "node left ring");

        let orphaned: Vec<StartRoutineMessage> = {
            let mut retained = self.inner.retained.lock();
            let held: Vec<RoutineId> = retained
                .iter()
                .filter(|(_, (holder, _))| *holder == node_id)
                .map(|(routine_id, _)| *routine_id)
                .collect();
            held.into_iter()
                .filter_map(|routine_id| retained.remove(&routine_id))
                .map(|(_, token)| token)
                .collect()
        };
        for token in orphaned {
            self.redeliver(token, &successors);
        }
        true
    }

    fn redeliver(&self, token: StartRoutineMessage, successors: &[NodeId]) {
        let routine_id = token.routine_id();
        let mut message = RoutineMessage::Start(token);
        for successor in successors {
            let Some(inbox) = self.inbox(*successor) else {
                continue;
            };
            match self.post(&inbox, *successor, message, None) {
                Ok(()) => {
                    debug!(%routine_id, %successor, "start token re-delivered after holder left");
                    return;
                }
                Err(returned) => message = returned,
            }
        }
        warn!(%routine_id, "start token lost with its holder, no live successor");
    }

    pub fn processor(&self, node_id: NodeId) -> Option<Arc<ContinuousProcessor>> {
        self.inner
            .members
            .read()
            .iter()
            .find(|member| member.node_id == node_id)
            .map(|member| Arc::clone(&member.processor))
    }

    /// Live nodes in ring order
    pub fn members(&self) -> Vec<NodeId> {
        self.inner.members.read().iter().map(|member| member.node_id).collect()
    }

    /// Wait until every queued delivery has been handled
    pub async fn settled(&self) {
        let tracker = &self.inner.tracker;
        loop {
            let idle = tracker.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if tracker.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop every delivery task and drop all members
    pub fn shutdown(&self) {
        let members: Vec<Member> = self.inner.members.write().drain(..).collect();
        for member in &members {
            member.task.abort();
        }
        self.inner.retained.lock().clear();
        info!(stopped = members.len(), "ring shut down");
    }

    fn inbox(&self, node_id: NodeId) -> Option<Inbox> {
        self.inner
            .members
            .read()
            .iter()
            .find(|member| member.node_id == node_id)
            .map(|member| member.inbox.clone())
    }

    fn enqueue(&self, inbox: &Inbox, delivery: Delivery) -> Result<(), Delivery> {
        let envelope = Envelope {
            delivery,
            _in_flight: InFlight::new(&self.inner.tracker),
        };
        inbox.send(envelope).map_err(|err| err.0.delivery)
    }

    /// Queue a message for `to`, handing it back if the node is gone
    fn post(
        &self,
        inbox: &Inbox,
        to: NodeId,
        message: RoutineMessage,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<(), RoutineMessage> {
        if let RoutineMessage::Start(token) = &message {
            self.inner.retained.lock().insert(token.routine_id(), (to, token.clone()));
        }
        if let Err(Delivery::Message { message, .. }) = self.enqueue(inbox, Delivery::Message { message, done }) {
            return Err(message);
        }
        Ok(())
    }
}

#[async_trait]
impl RingTransport for LocalRing {
    async fn topology(&self) -> Vec<NodeId> {
        self.members()
    }

    async fn send(&self, to: NodeId, message: RoutineMessage) -> Result<(), SendError> {
        let Some(inbox) = self.inbox(to) else {
            return Err(SendError { node: to, message });
        };
        self.post(&inbox, to, message, None)
            .map_err(|message| SendError { node: to, message })
    }

    async fn broadcast(&self, from: NodeId, message: RoutineMessage) -> usize {
        if let RoutineMessage::Ack(ack) = &message {
            self.inner.retained.lock().remove(&ack.routine_id());
        }

        let targets: Vec<(NodeId, Inbox)> = self
            .inner
            .members
            .read()
            .iter()
            .filter(|member| member.node_id != from)
            .map(|member| (member.node_id, member.inbox.clone()))
            .collect();

        let mut handled = Vec::with_capacity(targets.len());
        for (node, inbox) in targets {
            let (done, receiver) = oneshot::channel();
            match self.post(&inbox, node, message.clone(), Some(done)) {
                Ok(()) => handled.push(receiver),
                Err(_) => debug!(%node, kind = message.kind(), "broadcast target already gone"),
            }
        }

        let mut reached = 0;
        for receiver in handled {
            // a sender dropped without firing means the node left first
            if receiver.await.is_ok() {
                reached += 1;
            }
        }
        reached
    }
}

async fn run_member(processor: Arc<ContinuousProcessor>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
    let node_id = processor.node_id();
    while let Some(Envelope { delivery, _in_flight }) = inbox.recv().await {
        match delivery {
            Delivery::Message { message, done } => {
                let kind = message.kind();
                if let Err(err) = processor.deliver(message).await {
                    warn!(%node_id, kind, error = %err, "message handling failed");
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Delivery::Topology(event) => {
                if let Err(err) = processor.on_topology_event(event).await {
                    warn!(%node_id, ?event, error = %err, "topology event handling failed");
                }
            }
        }
    }
}
