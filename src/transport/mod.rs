//! Ring transport seam
//!
//! The protocol sits on top of a membership ring it does not own. The ring
//! knows the live nodes in a deterministic order (oldest first), hands
//! messages to a node's delivery handler and reports joins and departures.
//! [`LocalRing`] is the in-process implementation; [`MessageCodec`] frames
//! messages for transports that cross process boundaries.

pub mod codec;
pub mod local;

pub use codec::MessageCodec;
pub use local::LocalRing;

use std::fmt;
use async_trait::async_trait;
use thiserror::Error;
use crate::continuous::RoutineMessage;
use crate::types::NodeId;

/// Membership change reported by the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEvent {
    Joined(NodeId),
    Left(NodeId),
}

/// A message that could not be handed to its target, returned to the sender
#[derive(Error, Debug)]
#[error("node {node} did not accept {} message", .message.kind())]
pub struct SendError {
    pub node: NodeId,
    pub message: RoutineMessage,
}

/// Ring used by the coordination protocol
#[async_trait]
pub trait RingTransport: Send + Sync + fmt::Debug {
    /// Live nodes in ring order, oldest first
    async fn topology(&self) -> Vec<NodeId>;

    /// Hand `message` to the delivery handler of `to`
    async fn send(&self, to: NodeId, message: RoutineMessage) -> Result<(), SendError>;

    /// Deliver `message` to every live node except `from` and wait until each
    /// has handled it. Nodes that leave meanwhile are skipped. Returns the
    /// number of nodes that handled the message.
    async fn broadcast(&self, from: NodeId, message: RoutineMessage) -> usize;
}

/// Node authoritative for completing circulations: the oldest live node
pub fn coordinator(topology: &[NodeId]) -> Option<NodeId> {
    topology.first().copied()
}
