//! Units of work and the handles that queue them.
//!
//! A [`Work`] is the client's callable plus an identity token. A
//! [`TaskHandle`] pairs a work with the context it should run on and the
//! delay before it may start. Handles are compared by the work's identity
//! only; context and delay can change without affecting it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::model::{ExecContext, TaskId};

/// A boxed error that can be sent across threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fault raised by a task body. Reported to listeners, never propagated.
#[derive(Debug, Error)]
pub enum TaskFault {
    #[error("task failed: {0}")]
    Failed(BoxError),

    #[error("task panicked: {0}")]
    Panicked(String),
}

type PlainFn = dyn Fn() -> Result<(), BoxError> + Send + Sync;
type EventFn<T> = dyn Fn(Option<T>) -> Result<(), BoxError> + Send + Sync;

enum Body<T> {
    Plain(Box<PlainFn>),
    /// Wants the flow's current payload injected before it runs.
    Event(Box<EventFn<T>>),
}

/// A unit of work. Cheap to clone; every clone is the same task.
pub struct Work<T> {
    id: TaskId,
    label: Option<Arc<str>>,
    body: Arc<Body<T>>,
}

impl<T> Work<T> {
    /// Wrap an infallible closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::from_body(Body::Plain(Box::new(move || {
            f();
            Ok(())
        })))
    }

    /// Wrap a closure whose errors are reported to the flow's listener.
    pub fn try_new<F, E>(f: F) -> Self
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_body(Body::Plain(Box::new(move || f().map_err(Into::into))))
    }

    /// Wrap a closure that receives the flow's payload at the moment it runs.
    pub fn event<F>(f: F) -> Self
    where
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        Self::from_body(Body::Event(Box::new(move |payload| {
            f(payload);
            Ok(())
        })))
    }

    /// Fallible variant of [`Work::event`].
    pub fn try_event<F, E>(f: F) -> Self
    where
        F: Fn(Option<T>) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_body(Body::Event(Box::new(move |payload| {
            f(payload).map_err(Into::into)
        })))
    }

    fn from_body(body: Body<T>) -> Self {
        Self {
            id: TaskId::new(),
            label: None,
            body: Arc::new(body),
        }
    }

    /// Attach a label used in logs and listener output. Clones made after
    /// this call carry the label too.
    pub fn named(mut self, label: impl Into<String>) -> Self {
        let label: String = label.into();
        self.label = Some(Arc::from(label));
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Whether this work wants the flow's payload injected before running.
    pub fn wants_payload(&self) -> bool {
        matches!(*self.body, Body::Event(_))
    }

    /// Run the body, converting errors and panics into a [`TaskFault`].
    pub(crate) fn execute(&self, payload: Option<T>) -> Result<(), TaskFault> {
        let outcome = catch_unwind(AssertUnwindSafe(|| match &*self.body {
            Body::Plain(f) => f(),
            Body::Event(f) => f(payload),
        }));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TaskFault::Failed(e)),
            Err(panic) => Err(TaskFault::Panicked(panic_message(&*panic))),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<T> Clone for Work<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            label: self.label.clone(),
            body: Arc::clone(&self.body),
        }
    }
}

impl<T> PartialEq for Work<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Work<T> {}

impl<T> std::fmt::Debug for Work<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("wants_payload", &self.wants_payload())
            .finish()
    }
}

impl<T> std::fmt::Display for Work<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{label}"),
            None => write!(f, "{}", self.id),
        }
    }
}

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// A queued unit: work, target context, and start delay.
pub struct TaskHandle<T> {
    pub work: Work<T>,
    pub context: ExecContext,
    pub delay: Duration,
}

impl<T> TaskHandle<T> {
    pub fn new(work: Work<T>, context: ExecContext, delay: Duration) -> Self {
        Self {
            work,
            context,
            delay,
        }
    }

    pub fn id(&self) -> TaskId {
        self.work.id()
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            work: self.work.clone(),
            context: self.context,
            delay: self.delay,
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("work", &self.work)
            .field("context", &self.context)
            .field("delay", &self.delay)
            .finish()
    }
}
