//! Core data model.
//!
//! A flow is one sequential scheduler instance. Tasks are identified by an
//! explicit token assigned when the work is created, and each task targets
//! one of two execution contexts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity token of a unit of work. Clones of a [`crate::task::Work`] share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub Uuid);

impl FlowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Which execution engine runs a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecContext {
    /// The flow's dedicated background run loop.
    #[default]
    Background,
    /// The host-provided serialized main dispatcher.
    Main,
}

impl std::fmt::Display for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecContext::Background => "background",
            ExecContext::Main => "main",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Flow state
// ---------------------------------------------------------------------------

/// Lifecycle state of a flow. Pausing is tracked separately and does not
/// appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Background loop has not signalled readiness yet.
    NotStarted,
    /// Loop ready, nothing in flight.
    Idle,
    /// Exactly one task has been dispatched and has not completed.
    Running,
    /// Shut down. Terminal.
    Cancelled,
}

impl FlowState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: FlowState) -> bool {
        use FlowState::*;
        matches!(
            (self, to),
            (NotStarted, Idle)
                | (NotStarted, Cancelled)
                | (Idle, Running)
                | (Idle, Cancelled)
                | (Running, Idle)
                | (Running, Cancelled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Cancelled)
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowState::NotStarted => "not_started",
            FlowState::Idle => "idle",
            FlowState::Running => "running",
            FlowState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
