//! Task execution wrapper.
//!
//! Wraps a queued handle into a [`Job`] for its execution context. The job
//! injects the payload, consults the listener, runs the body with faults
//! isolated, and reports completion back to the flow.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Weak;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{debug, error, warn};

use crate::engine::flow::{Flow, Shared};
use crate::engine::looper::Job;
use crate::event::EventKind;
use crate::task::{TaskHandle, Work, panic_message};
use crate::telemetry::flow::{record_task_outcome, start_task_span};
use crate::telemetry::metrics;

/// Build the job dispatched for `handle`. The job holds only a weak
/// relation to its flow; if the flow is gone by the time it runs, it does
/// nothing.
pub(crate) fn wrap<T>(flow: Weak<Shared<T>>, handle: TaskHandle<T>) -> Job
where
    T: Clone + Send + Sync + 'static,
{
    Box::new(move || {
        let Some(shared) = flow.upgrade() else {
            return;
        };
        Flow::from_shared(shared).execute(&handle);
    })
}

impl<T: Clone + Send + Sync + 'static> Flow<T> {
    fn execute(&self, handle: &TaskHandle<T>) {
        let work = &handle.work;
        let span = start_task_span(self.span(), &work.id(), handle.context);
        let _entered = span.enter();
        let started = Instant::now();

        let payload = if work.wants_payload() {
            self.data()
        } else {
            None
        };

        let listener = self.listener();
        let proceed = listener.as_ref().is_none_or(|listener| {
            guard_hook(work, "on_start", false, || listener.on_start(self, work))
        });

        let outcome = if !proceed {
            debug!(task = %work, "task vetoed by listener");
            self.record_event(EventKind::TaskVetoed { id: work.id() });
            "vetoed"
        } else {
            match work.execute(payload) {
                Ok(()) => "ok",
                Err(fault) => {
                    warn!(task = %work, "task faulted: {fault}");
                    self.record_event(EventKind::TaskFailed {
                        id: work.id(),
                        error: fault.to_string(),
                    });
                    if let Some(listener) = &listener {
                        guard_hook(work, "on_error", (), || {
                            listener.on_error(self, work, &fault)
                        });
                    }
                    "failed"
                }
            }
        };

        if let Some(listener) = &listener {
            guard_hook(work, "on_end", (), || listener.on_end(self, work));
        }

        let elapsed = started.elapsed();
        record_task_outcome(&span, outcome);
        metrics::tasks_finished().add(
            1,
            &[
                KeyValue::new("outcome", outcome),
                KeyValue::new("context", handle.context.to_string()),
            ],
        );
        metrics::task_duration_ms().record(elapsed.as_secs_f64() * 1000.0, &[]);

        self.on_complete(work.id(), elapsed);
    }
}

/// Run a listener hook, substituting `fallback` if it panics. A panicking
/// `on_start` therefore vetoes the task. Completion is reported either way.
fn guard_hook<T, R>(work: &Work<T>, hook: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(panic) => {
            error!(task = %work, hook, "listener panicked: {}", panic_message(&*panic));
            fallback
        }
    }
}
