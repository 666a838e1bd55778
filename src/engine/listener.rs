//! Lifecycle callbacks around each task's execution.

use crate::engine::flow::Flow;
use crate::task::{TaskFault, Work};

/// Receives start/end/error callbacks for every task a flow executes.
///
/// Callbacks run on the task's execution context, outside the flow's state
/// lock, so they may call back into the flow. A panicking callback is logged
/// and does not stall the flow; a panic in `on_start` counts as a veto.
pub trait FlowListener<T>: Send + Sync {
    /// Called before the task body runs. Returning `false` skips the body;
    /// [`FlowListener::on_end`] still fires and the flow still advances.
    fn on_start(&self, _flow: &Flow<T>, _work: &Work<T>) -> bool {
        true
    }

    /// Called after every task, whether it ran, failed, or was vetoed.
    fn on_end(&self, _flow: &Flow<T>, _work: &Work<T>) {}

    /// Called when the task body returned an error or panicked.
    fn on_error(&self, _flow: &Flow<T>, _work: &Work<T>, _fault: &TaskFault) {}
}
