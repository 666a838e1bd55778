//! Metric instrument factories for taskflow-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider the instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskflow-rs")
}

/// Counter: tasks handed to an execution context.
/// Labels: `context` ("background" | "main").
pub fn tasks_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("taskflow.tasks.dispatched")
        .with_description("Number of tasks dispatched to an execution context")
        .build()
}

/// Counter: tasks that finished executing.
/// Labels: `outcome` ("ok" | "failed" | "vetoed"), `context`.
pub fn tasks_finished() -> Counter<u64> {
    meter()
        .u64_counter("taskflow.tasks.finished")
        .with_description("Number of tasks that finished executing")
        .build()
}

/// Counter: queue mutations.
/// Labels: `operation` ("append" | "front" | "behind" | "front_of" | "cancel").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskflow.queue.operations")
        .with_description("Number of work queue operations")
        .build()
}

/// Histogram: wall-clock task duration, listener callbacks included.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskflow.task.duration_ms")
        .with_description("Task execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
