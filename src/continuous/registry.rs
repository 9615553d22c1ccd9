//! Per-node routine registry
//!
//! Every routine id owns a slot behind its own async mutex. The local
//! start processor, stop handling and rollback all go through
//! [`RoutineRegistry::lock`], so no two of them act on the same routine
//! at once while different routines proceed independently.
//!
//! A slot outlives its registration: it remembers the outcome of the last
//! start attempt (replayed on duplicate delivery) and the highest stop
//! sequence seen (a tombstone that defeats starts ordered before it).
//! Once the attempt's acknowledgment has been applied and no registration
//! is left, the slot is released and only its high-water sequence is kept
//! in a bounded history.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use dashmap::DashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use crate::continuous::message::{CompletedRoutine, StartRequestData};
use crate::engine::HandlerHandle;
use crate::error::RoutineError;
use crate::types::{BoundedHistory, NodeId, RoutineId, Seq};

/// Released routines remembered for late duplicate starts
const SETTLED_HISTORY: usize = 1024;

/// Local state of an installed routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    /// Started locally, cluster-wide outcome not known yet
    ActivePendingAck,
    /// Cluster-wide start acknowledged
    Active,
}

/// A routine installed on this node
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineRegistration {
    pub routine_id: RoutineId,
    pub initiator: NodeId,
    pub seq: Seq,
    pub request: StartRequestData,
    pub handle: HandlerHandle,
    pub state: RegistrationState,
}

impl RoutineRegistration {
    pub fn completed(&self) -> CompletedRoutine {
        CompletedRoutine {
            routine_id: self.routine_id,
            initiator: self.initiator,
            seq: self.seq,
            request: self.request.clone(),
        }
    }
}

/// Bookkeeping for one routine id
#[derive(Debug, Default)]
pub struct RoutineSlot {
    registration: Option<RoutineRegistration>,
    last_start: Option<(Seq, Result<(), RoutineError>)>,
    stopped_at: Option<Seq>,
    acked: bool,
}

impl RoutineSlot {
    pub fn registration(&self) -> Option<&RoutineRegistration> {
        self.registration.as_ref()
    }

    pub fn install(&mut self, registration: RoutineRegistration) {
        self.registration = Some(registration);
    }

    pub fn take(&mut self) -> Option<RoutineRegistration> {
        self.registration.take()
    }

    /// Outcome already produced for the start directive `seq`, if any
    pub fn cached_start(&self, seq: Seq) -> Option<Result<(), RoutineError>> {
        if matches!(&self.registration, Some(registration) if registration.seq == seq) {
            return Some(Ok(()));
        }
        match &self.last_start {
            Some((cached, outcome)) if *cached == seq => Some(outcome.clone()),
            _ => None,
        }
    }

    pub fn record_start(&mut self, seq: Seq, outcome: Result<(), RoutineError>) {
        self.last_start = Some((seq, outcome));
    }

    /// A stop ordered after the start directive `seq` has been seen
    pub fn stopped_after(&self, seq: Seq) -> bool {
        self.stopped_at.map_or(false, |stopped| stopped > seq)
    }

    pub fn record_stop(&mut self, seq: Seq) {
        self.stopped_at = Some(self.stopped_at.map_or(seq, |stopped| stopped.max(seq)));
    }

    /// Promote a pending registration; returns it if it is now active
    pub fn promote(&mut self) -> Option<&RoutineRegistration> {
        let registration = self.registration.as_mut()?;
        registration.state = RegistrationState::Active;
        Some(registration)
    }

    /// The attempt's acknowledgment has been applied on this node
    pub fn mark_acked(&mut self) {
        self.acked = true;
    }

    /// Nothing installed and the attempt is over
    pub fn is_settled(&self) -> bool {
        self.registration.is_none() && self.acked
    }

    /// Highest sequence this slot has seen a start or stop for
    pub fn high_water(&self) -> Option<Seq> {
        let started = self.last_start.as_ref().map(|(seq, _)| *seq);
        match (started, self.stopped_at) {
            (Some(started), Some(stopped)) => Some(started.max(stopped)),
            (started, stopped) => started.or(stopped),
        }
    }
}

/// Exclusive access to one routine's slot
pub type SlotGuard = OwnedMutexGuard<RoutineSlot>;

/// Registry of routines on one node
#[derive(Debug)]
pub struct RoutineRegistry {
    node_id: NodeId,
    slots: DashMap<RoutineId, Arc<Mutex<RoutineSlot>>>,
    /// Routines acknowledged cluster-wide, replayed to joining nodes
    completed: RwLock<BTreeMap<RoutineId, CompletedRoutine>>,
    /// High-water sequence of released slots
    settled: SyncMutex<BoundedHistory<RoutineId, Option<Seq>>>,
    /// Initiators that left the ring
    departed: RwLock<HashSet<NodeId>>,
}

impl RoutineRegistry {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            slots: DashMap::new(),
            completed: RwLock::new(BTreeMap::new()),
            settled: SyncMutex::new(BoundedHistory::new(SETTLED_HISTORY)),
            departed: RwLock::new(HashSet::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Acquire the routine's slot, creating it on first use
    pub async fn lock(&self, routine_id: RoutineId) -> SlotGuard {
        let slot = Arc::clone(self.slots.entry(routine_id).or_insert_with(Default::default).value());
        slot.lock_owned().await
    }

    async fn lock_existing(&self, routine_id: RoutineId) -> Option<SlotGuard> {
        let slot = self.slots.get(&routine_id).map(|entry| Arc::clone(entry.value()))?;
        Some(slot.lock_owned().await)
    }

    /// Drop the routine's slot if it is settled and nobody else holds it.
    ///
    /// Callers must have released their own guard first.
    pub fn release(&self, routine_id: RoutineId) -> bool {
        let mut high_water = None;
        let removed = self.slots.remove_if(&routine_id, |_, slot| {
            if Arc::strong_count(slot) != 1 {
                return false;
            }
            match slot.try_lock() {
                Ok(slot) if slot.is_settled() => {
                    high_water = slot.high_water();
                    true
                }
                _ => false,
            }
        });
        if removed.is_none() {
            return false;
        }
        self.settled.lock().insert(routine_id, high_water);
        true
    }

    /// A start stamped `seq` belongs to an attempt whose slot was already released
    pub fn settled_at_or_after(&self, routine_id: RoutineId, seq: Seq) -> bool {
        match self.settled.lock().get(&routine_id) {
            Some(Some(high_water)) => *high_water >= seq,
            _ => false,
        }
    }

    /// Number of routine ids with live bookkeeping
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// This node has seen the routine, either in flight, installed or settled
    pub fn has_seen(&self, routine_id: RoutineId) -> bool {
        self.slots.contains_key(&routine_id)
            || self.is_completed(routine_id)
            || self.settled.lock().contains(&routine_id)
    }

    pub fn mark_departed(&self, node: NodeId) {
        self.departed.write().insert(node);
    }

    pub fn mark_rejoined(&self, node: NodeId) {
        self.departed.write().remove(&node);
    }

    pub fn has_departed(&self, node: NodeId) -> bool {
        self.departed.read().contains(&node)
    }

    fn existing_slots(&self) -> Vec<Arc<Mutex<RoutineSlot>>> {
        self.slots.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub async fn state(&self, routine_id: RoutineId) -> Option<RegistrationState> {
        let slot = self.slots.get(&routine_id).map(|entry| Arc::clone(entry.value()))?;
        let slot = slot.lock().await;
        slot.registration().map(|registration| registration.state)
    }

    /// Snapshot of every installed routine
    pub async fn registrations(&self) -> Vec<RoutineRegistration> {
        let mut registrations = Vec::new();
        for slot in self.existing_slots() {
            if let Some(registration) = slot.lock().await.registration() {
                registrations.push(registration.clone());
            }
        }
        registrations.sort_by_key(|registration| registration.routine_id);
        registrations
    }

    /// Installed routines whose start was initiated by `initiator`
    pub async fn started_by(&self, initiator: NodeId) -> Vec<RoutineRegistration> {
        self.registrations()
            .await
            .into_iter()
            .filter(|registration| registration.initiator == initiator)
            .collect()
    }

    /// Apply an acknowledgment to the local slot.
    ///
    /// A successful one promotes the registration and records the routine
    /// as completed, which is returned. Afterwards a slot with nothing
    /// installed is released.
    pub async fn apply_ack(&self, routine_id: RoutineId, success: bool) -> Option<CompletedRoutine> {
        let mut slot = self.lock_existing(routine_id).await?;
        slot.mark_acked();
        let completed = if success {
            slot.promote().map(RoutineRegistration::completed)
        } else {
            None
        };
        drop(slot);

        match completed {
            Some(completed) => {
                self.mark_completed(completed.clone());
                Some(completed)
            }
            None => {
                self.release(routine_id);
                None
            }
        }
    }

    pub fn mark_completed(&self, routine: CompletedRoutine) {
        self.completed.write().insert(routine.routine_id, routine);
    }

    pub fn forget_completed(&self, routine_id: RoutineId) -> bool {
        self.completed.write().remove(&routine_id).is_some()
    }

    pub fn is_completed(&self, routine_id: RoutineId) -> bool {
        self.completed.read().contains_key(&routine_id)
    }

    pub fn completed_routine(&self, routine_id: RoutineId) -> Option<CompletedRoutine> {
        self.completed.read().get(&routine_id).cloned()
    }

    pub fn completed_routines(&self) -> Vec<CompletedRoutine> {
        self.completed.read().values().cloned().collect()
    }
}
