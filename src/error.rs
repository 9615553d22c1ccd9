//! Error types for continuous routine coordination
//!
//! Per-node faults are folded into [`RoutineError`] values that travel
//! inside a token's error map. Only the aggregate outcome of a
//! registration attempt reaches the caller as a [`ContinuumError`].

use thiserror::Error;
use serde::{Deserialize, Serialize};
use crate::continuous::lifecycle::RoutineLifecycle;
use crate::continuous::ErrorMap;
use crate::types::{NodeId, RoutineId};

/// Result type for caller-facing operations
pub type ContinuumResult<T> = Result<T, ContinuumError>;

/// Main error type surfaced to callers
#[derive(Error, Debug)]
pub enum ContinuumError {
    /// One or more nodes failed to start the routine; partial starts were rolled back
    #[error("Routine {routine_id} failed to start on {} node(s): {}", .errs.len(), describe_errors(.errs))]
    AggregateRegistration {
        routine_id: RoutineId,
        errs: ErrorMap,
    },

    /// Request rejected before it left the local node
    #[error("Routine error: {0}")]
    Routine(#[from] RoutineError),

    /// Ring transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid token lifecycle transition
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire encoding errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// Stop requested for a routine this node has never seen
    #[error("Routine {0} is unknown on this node")]
    UnknownRoutine(RoutineId),

    /// The pending registration was dropped before its acknowledgment arrived
    #[error("Registration of routine {0} was abandoned before completion")]
    Abandoned(RoutineId),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContinuumError {
    /// Per-node causes if this is an aggregate registration failure
    pub fn node_errors(&self) -> Option<&ErrorMap> {
        match self {
            ContinuumError::AggregateRegistration { errs, .. } => Some(errs),
            _ => None,
        }
    }
}

fn describe_errors(errs: &ErrorMap) -> String {
    errs.iter()
        .map(|(node, cause)| format!("{} => {}", node, cause))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure cause recorded by a single node
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutineError {
    /// Request is not acceptable on this node
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Node cannot afford another listener
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Execution engine call exceeded its bound
    #[error("Local call timed out after {0} ms")]
    Timeout(u64),

    /// Execution engine failure
    #[error("Execution engine error: {0}")]
    Engine(String),
}

/// Ring transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Node {0} is not a live member of the ring")]
    NodeLeft(NodeId),

    #[error("Node {0} is already a member of the ring")]
    DuplicateNode(NodeId),

    #[error("Ring has no live members")]
    EmptyRing,

    #[error("Undeliverable {0} message")]
    Undeliverable(&'static str),

    #[error("Frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
}

/// Rejected lifecycle transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Routine {routine_id}: invalid transition from {from:?} to {to:?}")]
pub struct LifecycleError {
    pub routine_id: RoutineId,
    pub from: RoutineLifecycle,
    pub to: RoutineLifecycle,
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<bincode::Error> for ContinuumError {
    fn from(err: bincode::Error) -> Self {
        ContinuumError::Codec(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}
