//! Messages exchanged by the routine coordination protocol
//!
//! A [`StartRoutineMessage`] is the mutable token that circulates the
//! ring. Each hop receives it by value, may add one error entry and hands
//! it on. [`StartRoutineMessage::ack_message`] consumes the token, so once
//! the frozen [`StartRoutineAckMessage`] exists the start token can no
//! longer be touched.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::config::RoutineConfig;
use crate::error::RoutineError;
use crate::types::{NodeId, RoutineId, Seq};

/// Per-node failure causes, one entry per node
pub type ErrorMap = BTreeMap<NodeId, RoutineError>;

/// Description of the listener to install on every node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequestData {
    /// Name of the listener factory known to the execution engine
    pub factory: String,
    /// Number of events buffered before a batch is delivered
    pub buffer_size: usize,
    /// Maximum time events wait in the buffer, zero disables time-based flushing
    pub batch_interval_ms: u64,
    /// Opaque event filter handed to the execution engine
    pub filter: Option<Vec<u8>>,
    /// Tear the routine down when its initiating node leaves the cluster
    pub auto_unsubscribe: bool,
}

impl StartRequestData {
    pub fn new(factory: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            buffer_size: 1,
            batch_interval_ms: 0,
            filter: None,
            auto_unsubscribe: true,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_filter(mut self, filter: Vec<u8>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_auto_unsubscribe(mut self, auto_unsubscribe: bool) -> Self {
        self.auto_unsubscribe = auto_unsubscribe;
        self
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Structural checks performed by the caller before the token is created
    pub fn validate(&self, config: &RoutineConfig) -> Result<(), RoutineError> {
        if self.factory.trim().is_empty() {
            return Err(RoutineError::Validation("factory name is empty".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(RoutineError::Validation("buffer size must be positive".to_string()));
        }
        if self.buffer_size > config.max_buffer_size {
            return Err(RoutineError::Validation(format!(
                "buffer size {} exceeds maximum {}",
                self.buffer_size, config.max_buffer_size
            )));
        }
        if matches!(&self.filter, Some(filter) if filter.is_empty()) {
            return Err(RoutineError::Validation("filter is present but empty".to_string()));
        }
        Ok(())
    }
}

/// Start token circulated around the ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRoutineMessage {
    routine_id: RoutineId,
    initiator: NodeId,
    seq: Seq,
    start_req: StartRequestData,
    /// Nodes that must process the token; shrinks when nodes depart
    expected: BTreeSet<NodeId>,
    /// Nodes that have processed the token
    visited: BTreeSet<NodeId>,
    errs: ErrorMap,
}

impl StartRoutineMessage {
    pub fn new(
        routine_id: RoutineId,
        initiator: NodeId,
        seq: Seq,
        start_req: StartRequestData,
        expected: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        Self {
            routine_id,
            initiator,
            seq,
            start_req,
            expected: expected.into_iter().collect(),
            visited: BTreeSet::new(),
            errs: ErrorMap::new(),
        }
    }

    pub fn routine_id(&self) -> RoutineId {
        self.routine_id
    }

    pub fn initiator(&self) -> NodeId {
        self.initiator
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    pub fn start_request(&self) -> &StartRequestData {
        &self.start_req
    }

    pub fn expected(&self) -> &BTreeSet<NodeId> {
        &self.expected
    }

    pub fn errs(&self) -> &ErrorMap {
        &self.errs
    }

    /// Record a node's failure; a later entry for the same node replaces the earlier one
    pub fn add_error(&mut self, node_id: NodeId, err: RoutineError) {
        self.errs.insert(node_id, err);
    }

    pub fn mark_visited(&mut self, node_id: NodeId) {
        self.visited.insert(node_id);
    }

    pub fn is_visited(&self, node_id: NodeId) -> bool {
        self.visited.contains(&node_id)
    }

    /// Whether `node_id` still has to process this token
    pub fn awaits(&self, node_id: NodeId) -> bool {
        self.expected.contains(&node_id) && !self.visited.contains(&node_id)
    }

    /// Drop expected nodes missing from the live ring and return them
    pub fn retain_live(&mut self, ring: &[NodeId]) -> Vec<NodeId> {
        let departed: Vec<NodeId> = self.expected
            .iter()
            .filter(|node| !ring.contains(node))
            .copied()
            .collect();
        for node in &departed {
            self.expected.remove(node);
        }
        departed
    }

    /// First node after `from` in ring order that still has to process the token
    pub fn next_hop(&self, from: NodeId, ring: &[NodeId]) -> Option<NodeId> {
        let start = ring.iter().position(|node| *node == from).map_or(0, |pos| pos + 1);
        (0..ring.len())
            .map(|offset| ring[(start + offset) % ring.len()])
            .find(|node| self.awaits(*node))
    }

    /// Every node still expected has processed the token
    pub fn is_complete(&self) -> bool {
        self.expected.is_subset(&self.visited)
    }

    /// Freeze the accumulated outcome into the acknowledgment
    pub fn ack_message(self) -> StartRoutineAckMessage {
        StartRoutineAckMessage {
            routine_id: self.routine_id,
            errs: self.errs,
        }
    }
}

/// Acknowledgment produced once per registration attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRoutineAckMessage {
    routine_id: RoutineId,
    errs: ErrorMap,
}

impl StartRoutineAckMessage {
    pub fn routine_id(&self) -> RoutineId {
        self.routine_id
    }

    pub fn errs(&self) -> &ErrorMap {
        &self.errs
    }

    pub fn is_success(&self) -> bool {
        self.errs.is_empty()
    }
}

/// Why a stop directive was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Caller asked to unregister the routine
    Unregister,
    /// Compensation after an aggregate start failure
    Rollback,
    /// Initiating node left and the routine asked to follow it
    AutoUnsubscribe,
}

/// Directive to tear a routine down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRoutineMessage {
    routine_id: RoutineId,
    seq: Seq,
    reason: StopReason,
}

impl StopRoutineMessage {
    pub fn new(routine_id: RoutineId, seq: Seq, reason: StopReason) -> Self {
        Self { routine_id, seq, reason }
    }

    pub fn routine_id(&self) -> RoutineId {
        self.routine_id
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    pub fn reason(&self) -> StopReason {
        self.reason
    }
}

/// A routine that reached a successful acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedRoutine {
    pub routine_id: RoutineId,
    pub initiator: NodeId,
    pub seq: Seq,
    pub request: StartRequestData,
}

/// Replay of completed routines for a node that missed their start tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchUpMessage {
    pub routines: Vec<CompletedRoutine>,
}

/// Every message the protocol puts on the ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutineMessage {
    Start(StartRoutineMessage),
    Ack(StartRoutineAckMessage),
    Stop(StopRoutineMessage),
    CatchUp(CatchUpMessage),
}

impl RoutineMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RoutineMessage::Start(_) => "start",
            RoutineMessage::Ack(_) => "ack",
            RoutineMessage::Stop(_) => "stop",
            RoutineMessage::CatchUp(_) => "catch-up",
        }
    }

    /// Routine this message is about; catch-up messages cover several
    pub fn routine_id(&self) -> Option<RoutineId> {
        match self {
            RoutineMessage::Start(token) => Some(token.routine_id()),
            RoutineMessage::Ack(ack) => Some(ack.routine_id()),
            RoutineMessage::Stop(stop) => Some(stop.routine_id()),
            RoutineMessage::CatchUp(_) => None,
        }
    }
}
