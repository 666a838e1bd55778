//! Structured events emitted by a flow on every state transition and queue
//! operation.
//!
//! Consumers read the log with [`crate::engine::Flow::events_since`] to
//! build audit trails or assert on ordering in tests. Events are the
//! flow's voice; listener callbacks are the task's.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ExecContext, FlowId, FlowState, TaskId};

/// A structured event emitted by a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Monotonic sequence number, starting at 1. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    pub flow_id: FlowId,
    /// What happened.
    pub kind: EventKind,
}

/// Which queue operation placed a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Tail,
    Front,
    Behind,
    FrontOf,
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Placement::Tail => "append",
            Placement::Front => "front",
            Placement::Behind => "behind",
            Placement::FrontOf => "front_of",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    LoopReady,
    TaskQueued {
        id: TaskId,
        placement: Placement,
        context: ExecContext,
        delay_ms: u64,
        position: usize,
    },
    TaskDispatched {
        id: TaskId,
        context: ExecContext,
        delay_ms: u64,
    },
    TaskVetoed {
        id: TaskId,
    },
    TaskFailed {
        id: TaskId,
        error: String,
    },
    TaskCompleted {
        id: TaskId,
        duration_ms: u64,
    },
    TaskCancelled {
        id: TaskId,
    },
    Paused,
    Resumed,
    StateTransition {
        from: FlowState,
        to: FlowState,
    },
    Shutdown {
        dropped: usize,
    },
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Bounded in-memory event log. The oldest events are dropped once
/// `capacity` is reached; sequence numbers keep increasing regardless.
#[derive(Debug)]
pub struct EventLog {
    flow_id: FlowId,
    next_seq: u64,
    capacity: usize,
    events: VecDeque<FlowEvent>,
}

impl EventLog {
    pub fn new(flow_id: FlowId, capacity: usize) -> Self {
        Self {
            flow_id,
            next_seq: 1,
            capacity,
            events: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append an event and return its sequence number.
    pub fn record(&mut self, kind: EventKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.capacity == 0 {
            return seq;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(FlowEvent {
            seq,
            timestamp: Utc::now(),
            flow_id: self.flow_id,
            kind,
        });
        seq
    }

    /// Events with a sequence number greater than `since_seq`.
    pub fn since(&self, since_seq: u64) -> Vec<FlowEvent> {
        self.events
            .iter()
            .filter(|e| e.seq > since_seq)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
