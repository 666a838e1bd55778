//! Flow and task span helpers.
//!
//! Every flow gets a long-lived span; each task execution gets a child span
//! carrying the task identity and target context.

use tracing::Span;

use crate::model::{ExecContext, FlowId, TaskId};

/// Start the span that parents all activity of one flow.
pub fn start_flow_span(name: &str, flow_id: &FlowId) -> Span {
    tracing::info_span!(
        "flow",
        "flow.name" = name,
        "flow.id" = %flow_id,
        "flow.state" = tracing::field::Empty,
    )
}

/// Start a span for one task execution, parented to the flow span.
///
/// The `task.outcome` field is declared empty and filled via
/// [`record_task_outcome`].
pub fn start_task_span(flow_span: &Span, task_id: &TaskId, context: ExecContext) -> Span {
    tracing::info_span!(
        parent: flow_span,
        "task.execute",
        "task.id" = %task_id,
        "task.context" = %context,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the flow span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("flow.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}

/// Record how a task ended: `ok`, `failed`, or `vetoed`.
pub fn record_task_outcome(span: &Span, outcome: &str) {
    span.record("task.outcome", outcome);
}
