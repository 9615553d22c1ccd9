//! Execution engine seam
//!
//! The engine installs and removes the actual listener on a node. The
//! protocol only needs the two calls of [`ExecutionEngine`]; everything
//! about what a listener does with events stays behind this trait.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use crate::continuous::StartRequestData;
use crate::error::RoutineError;
use crate::types::RoutineId;

/// Opaque handle to a listener installed by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerHandle(pub u64);

/// Local listener execution, invoked by the protocol on each node
#[async_trait]
pub trait ExecutionEngine: Send + Sync + fmt::Debug {
    /// Install the listener described by `request`
    async fn start_local(
        &self,
        routine_id: RoutineId,
        request: &StartRequestData,
    ) -> Result<HandlerHandle, RoutineError>;

    /// Remove a listener previously installed by `start_local`
    async fn stop_local(&self, routine_id: RoutineId, handle: HandlerHandle) -> Result<(), RoutineError>;
}

/// In-process engine with a listener capacity
#[derive(Debug)]
pub struct InMemoryEngine {
    capacity: usize,
    latency: Duration,
    rejected_factories: HashSet<String>,
    failing: AtomicBool,
    next_handle: AtomicU64,
    start_calls: AtomicUsize,
    active: DashMap<RoutineId, HandlerHandle>,
}

impl InMemoryEngine {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            latency: Duration::ZERO,
            rejected_factories: HashSet::new(),
            failing: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            start_calls: AtomicUsize::new(0),
            active: DashMap::new(),
        }
    }

    /// Delay every start call, e.g. to exercise timeouts
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Refuse requests naming `factory`
    pub fn reject_factory(mut self, factory: impl Into<String>) -> Self {
        self.rejected_factories.insert(factory.into());
        self
    }

    /// Make every subsequent start fail validation
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_active(&self, routine_id: RoutineId) -> bool {
        self.active.contains_key(&routine_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of times `start_local` was invoked
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ExecutionEngine for InMemoryEngine {
    async fn start_local(
        &self,
        routine_id: RoutineId,
        request: &StartRequestData,
    ) -> Result<HandlerHandle, RoutineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(RoutineError::Validation(format!(
                "listener factory '{}' unavailable",
                request.factory
            )));
        }
        if self.rejected_factories.contains(&request.factory) {
            return Err(RoutineError::Validation(format!(
                "listener factory '{}' rejected",
                request.factory
            )));
        }
        if self.active.len() >= self.capacity {
            return Err(RoutineError::ResourceLimit(format!(
                "{} listeners already active",
                self.capacity
            )));
        }

        let handle = HandlerHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.active.insert(routine_id, handle);
        Ok(handle)
    }

    async fn stop_local(&self, routine_id: RoutineId, handle: HandlerHandle) -> Result<(), RoutineError> {
        match self.active.remove_if(&routine_id, |_, active| *active == handle) {
            Some(_) => Ok(()),
            None => Err(RoutineError::Engine(format!(
                "no listener {:?} for routine {}",
                handle, routine_id
            ))),
        }
    }
}
