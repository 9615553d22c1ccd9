//! # Continuum: cluster-wide continuous routines
//!
//! Registers a continuous listener (a routine) on every node of a dynamic
//! cluster by circulating a start token around the membership ring. Each
//! node attempts a local start and notes its failure in the token; the
//! oldest live node turns the finished token into a single acknowledgment,
//! rolls partial starts back when any node failed and reports the outcome
//! to the caller.
//!
//! Nodes that join late are caught up, nodes that leave are dropped from
//! circulation without producing errors, and stop directives are ordered
//! against starts with Lamport sequence numbers.

#![warn(clippy::all)]

pub mod config;
pub mod continuous;
pub mod engine;
pub mod error;
pub mod transport;
pub mod types;

// Re-export main types
pub use config::RoutineConfig;
pub use continuous::{
    ContinuousProcessor, ErrorMap, PendingRoutine, RegistrationState, RoutineMessage,
    StartRequestData, StartRoutineAckMessage, StartRoutineMessage, StopReason,
};
pub use engine::{ExecutionEngine, HandlerHandle, InMemoryEngine};
pub use error::{ContinuumError, ContinuumResult, RoutineError, TransportError};
pub use transport::{LocalRing, MessageCodec, RingTransport, TopologyEvent};
pub use types::{LogicalClock, NodeId, RoutineId, Seq};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
