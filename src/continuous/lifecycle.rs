//! Lifecycle of one registration attempt
//!
//! ```text
//! Created -> InTransit -> Completing -> Acked -> (RolledBack) -> Consumed
//! ```

use serde::{Deserialize, Serialize};
use crate::error::LifecycleError;
use crate::types::RoutineId;

/// State of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutineLifecycle {
    /// Token built, not yet handed to the ring
    Created,
    /// Token circulating; hops may still add errors
    InTransit,
    /// Circulation finished, acknowledgment being built
    Completing,
    /// Acknowledgment exists
    Acked,
    /// Compensating stop issued after an aggregate failure
    RolledBack,
    /// Caller resolved
    Consumed,
}

impl RoutineLifecycle {
    pub fn can_transition_to(self, next: RoutineLifecycle) -> bool {
        use RoutineLifecycle::*;
        matches!(
            (self, next),
            (Created, InTransit)
                | (InTransit, Completing)
                | (Completing, Acked)
                | (Acked, RolledBack)
                | (Acked, Consumed)
                | (RolledBack, Consumed)
        )
    }

    /// The start token may only be mutated in these states
    pub fn is_mutable(self) -> bool {
        matches!(self, RoutineLifecycle::Created | RoutineLifecycle::InTransit)
    }
}

/// Validated state machine with its transition history
#[derive(Debug, Clone)]
pub struct LifecycleTracker {
    routine_id: RoutineId,
    history: Vec<RoutineLifecycle>,
}

impl LifecycleTracker {
    pub fn new(routine_id: RoutineId) -> Self {
        Self {
            routine_id,
            history: vec![RoutineLifecycle::Created],
        }
    }

    pub fn state(&self) -> RoutineLifecycle {
        self.history.last().copied().unwrap_or(RoutineLifecycle::Created)
    }

    pub fn history(&self) -> &[RoutineLifecycle] {
        &self.history
    }

    /// Move to `next`, leaving the state untouched if the edge does not exist
    pub fn advance(&mut self, next: RoutineLifecycle) -> Result<(), LifecycleError> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(LifecycleError {
                routine_id: self.routine_id,
                from,
                to: next,
            });
        }
        self.history.push(next);
        Ok(())
    }

    /// Apply a run of transitions, stopping at the first invalid one
    pub fn advance_through(&mut self, states: &[RoutineLifecycle]) -> Result<(), LifecycleError> {
        states.iter().try_for_each(|state| self.advance(*state))
    }
}
