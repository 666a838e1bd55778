//! Flow controller: owns the work queue, drives dispatch and advance, and
//! bridges to the background loop and the main dispatcher.
//!
//! All queue mutations and state transitions happen under one lock per
//! flow. At most one task is in flight at any time; its completion removes
//! it from the queue and, unless the flow is paused or cancelled, dispatches
//! the next head.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{Span, debug, info, warn};

use crate::config::Config;
use crate::engine::execution;
use crate::engine::listener::FlowListener;
use crate::engine::looper::{Dispatcher, LoopLauncher, Looper};
use crate::error::{Error, Result};
use crate::event::{EventKind, EventLog, FlowEvent, Placement, millis};
use crate::model::{ExecContext, FlowId, FlowState, TaskId};
use crate::queue::WorkQueue;
use crate::task::{TaskHandle, Work};
use crate::telemetry::flow::{record_state_transition, start_flow_span};
use crate::telemetry::metrics;

/// Handle to a sequential task flow. Cloning yields another handle to the
/// same flow.
pub struct Flow<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

pub(crate) struct Shared<T> {
    id: FlowId,
    name: String,
    span: Span,
    inner: Mutex<Inner<T>>,
    payload: RwLock<Option<T>>,
    listener: RwLock<Option<Arc<dyn FlowListener<T>>>>,
    background: Looper,
    main: Arc<dyn Dispatcher>,
    /// Stand-in main loop spawned when the host supplied none.
    owned_main: Option<Arc<Looper>>,
    launcher: Mutex<Option<LoopLauncher>>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Everything guarded by the flow lock.
pub(crate) struct Inner<T> {
    queue: WorkQueue<T>,
    state: FlowState,
    /// `begin` arrived before the background loop was ready.
    pending_begin: bool,
    paused: bool,
    in_flight: Option<TaskId>,
    events: EventLog,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let _ = self.background.quit();
        if let Some(main) = &self.owned_main {
            let _ = main.quit();
        }
    }
}

fn lock<G>(m: &Mutex<G>) -> MutexGuard<'_, G> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`Flow`].
pub struct FlowBuilder<T> {
    name: String,
    autostart: bool,
    event_capacity: usize,
    main: Option<Arc<dyn Dispatcher>>,
    payload: Option<T>,
    listener: Option<Arc<dyn FlowListener<T>>>,
}

impl<T> Default for FlowBuilder<T> {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl<T> FlowBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.flow_name.clone(),
            autostart: config.autostart,
            event_capacity: config.event_capacity,
            main: None,
            payload: None,
            listener: None,
        }
    }

    /// Name of the flow; loop threads are named `<name>-bg` and `<name>-main`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// When false, the background loop is not launched until
    /// [`Flow::start`] is called.
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Host dispatcher for tasks targeting [`ExecContext::Main`].
    pub fn main_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.main = Some(dispatcher);
        self
    }

    pub fn payload(mut self, payload: T) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn listener(mut self, listener: impl FlowListener<T> + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }
}

impl<T: Clone + Send + Sync + 'static> FlowBuilder<T> {
    pub fn build(self) -> Result<Flow<T>> {
        let id = FlowId::new();
        let (background, launcher) = Looper::new(format!("{}-bg", self.name));

        let (main, owned_main) = match self.main {
            Some(dispatcher) => (dispatcher, None),
            None => {
                let looper = Arc::new(Looper::spawn(format!("{}-main", self.name))?);
                (Arc::clone(&looper) as Arc<dyn Dispatcher>, Some(looper))
            }
        };

        let flow = Flow {
            shared: Arc::new(Shared {
                id,
                span: start_flow_span(&self.name, &id),
                name: self.name,
                inner: Mutex::new(Inner {
                    queue: WorkQueue::new(),
                    state: FlowState::NotStarted,
                    pending_begin: false,
                    paused: false,
                    in_flight: None,
                    events: EventLog::new(id, self.event_capacity),
                }),
                payload: RwLock::new(self.payload),
                listener: RwLock::new(self.listener),
                background,
                main,
                owned_main,
                launcher: Mutex::new(Some(launcher)),
                loop_thread: Mutex::new(None),
            }),
        };

        debug!(flow = %id, name = %flow.shared.name, "flow created");

        if self.autostart {
            flow.start()?;
        }
        Ok(flow)
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Flow<T> {
    pub fn builder() -> FlowBuilder<T> {
        FlowBuilder::new()
    }

    /// Build an autostarted flow with default settings.
    pub fn new() -> Result<Self> {
        FlowBuilder::new().build()
    }

    pub(crate) fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared<T>> {
        Arc::downgrade(&self.shared)
    }

    /// Launch the background loop. Errors if it was already launched.
    pub fn start(&self) -> Result<()> {
        let launcher = lock(&self.shared.launcher)
            .take()
            .ok_or(Error::AlreadyStarted)?;
        let weak = self.downgrade();
        let handle = launcher.launch(move || {
            if let Some(shared) = weak.upgrade() {
                Flow::from_shared(shared).on_loop_ready();
            }
        })?;
        *lock(&self.shared.loop_thread) = Some(handle);
        Ok(())
    }

    /// Runs on the background thread before it processes any job.
    fn on_loop_ready(&self) {
        let mut inner = self.lock();
        if inner.state != FlowState::NotStarted {
            return;
        }
        self.transition(&mut inner, FlowState::Idle);
        inner.events.record(EventKind::LoopReady);
        info!(flow = %self.shared.id, "background loop ready");

        if std::mem::take(&mut inner.pending_begin) {
            debug!(flow = %self.shared.id, "running deferred begin");
            self.advance(&mut inner);
        }
    }

    // -----------------------------------------------------------------------
    // Enqueue at tail
    // -----------------------------------------------------------------------

    pub fn next(&self, work: &Work<T>) -> &Self {
        self.append(work, ExecContext::Background, Duration::ZERO)
    }

    pub fn next_delayed(&self, work: &Work<T>, delay: Duration) -> &Self {
        self.append(work, ExecContext::Background, delay)
    }

    pub fn next_in_main(&self, work: &Work<T>) -> &Self {
        self.append(work, ExecContext::Main, Duration::ZERO)
    }

    pub fn next_in_main_delayed(&self, work: &Work<T>, delay: Duration) -> &Self {
        self.append(work, ExecContext::Main, delay)
    }

    // -----------------------------------------------------------------------
    // Insert at head
    // -----------------------------------------------------------------------

    /// Put `work` at the head of the queue. If it is already queued it is
    /// moved there and takes the new context and delay.
    pub fn front(&self, work: &Work<T>) -> &Self {
        self.insert_front(work, ExecContext::Background, Duration::ZERO)
    }

    pub fn front_delayed(&self, work: &Work<T>, delay: Duration) -> &Self {
        self.insert_front(work, ExecContext::Background, delay)
    }

    pub fn front_in_main(&self, work: &Work<T>) -> &Self {
        self.insert_front(work, ExecContext::Main, Duration::ZERO)
    }

    pub fn front_in_main_delayed(&self, work: &Work<T>, delay: Duration) -> &Self {
        self.insert_front(work, ExecContext::Main, delay)
    }

    // -----------------------------------------------------------------------
    // Insert after a target
    // -----------------------------------------------------------------------

    /// Run `work` immediately after `target`. Ignored if `target` is not queued.
    pub fn behind(&self, work: &Work<T>, target: &Work<T>) -> &Self {
        self.insert_after(work, ExecContext::Background, Duration::ZERO, target)
    }

    pub fn behind_delayed(&self, work: &Work<T>, delay: Duration, target: &Work<T>) -> &Self {
        self.insert_after(work, ExecContext::Background, delay, target)
    }

    pub fn behind_in_main(&self, work: &Work<T>, target: &Work<T>) -> &Self {
        self.insert_after(work, ExecContext::Main, Duration::ZERO, target)
    }

    pub fn behind_in_main_delayed(
        &self,
        work: &Work<T>,
        delay: Duration,
        target: &Work<T>,
    ) -> &Self {
        self.insert_after(work, ExecContext::Main, delay, target)
    }

    // -----------------------------------------------------------------------
    // Insert before a target
    // -----------------------------------------------------------------------

    /// Run `work` immediately before `target`. Ignored if `target` is not
    /// queued or sits at the head.
    pub fn front_of(&self, work: &Work<T>, target: &Work<T>) -> &Self {
        self.insert_before(work, ExecContext::Background, Duration::ZERO, target)
    }

    pub fn front_of_delayed(&self, work: &Work<T>, delay: Duration, target: &Work<T>) -> &Self {
        self.insert_before(work, ExecContext::Background, delay, target)
    }

    pub fn front_of_in_main(&self, work: &Work<T>, target: &Work<T>) -> &Self {
        self.insert_before(work, ExecContext::Main, Duration::ZERO, target)
    }

    pub fn front_of_in_main_delayed(
        &self,
        work: &Work<T>,
        delay: Duration,
        target: &Work<T>,
    ) -> &Self {
        self.insert_before(work, ExecContext::Main, delay, target)
    }

    // -----------------------------------------------------------------------
    // Queue plumbing
    // -----------------------------------------------------------------------

    fn append(&self, work: &Work<T>, context: ExecContext, delay: Duration) -> &Self {
        self.mutate_queue(work, context, delay, Placement::Tail, |queue, handle| {
            queue.append(handle)
        })
    }

    fn insert_front(&self, work: &Work<T>, context: ExecContext, delay: Duration) -> &Self {
        self.mutate_queue(work, context, delay, Placement::Front, |queue, handle| {
            queue.insert_front(handle);
            true
        })
    }

    fn insert_after(
        &self,
        work: &Work<T>,
        context: ExecContext,
        delay: Duration,
        target: &Work<T>,
    ) -> &Self {
        let target = target.id();
        self.mutate_queue(work, context, delay, Placement::Behind, |queue, handle| {
            queue.insert_after(target, handle)
        })
    }

    fn insert_before(
        &self,
        work: &Work<T>,
        context: ExecContext,
        delay: Duration,
        target: &Work<T>,
    ) -> &Self {
        let target = target.id();
        self.mutate_queue(work, context, delay, Placement::FrontOf, |queue, handle| {
            queue.insert_before(target, handle)
        })
    }

    fn mutate_queue<F>(
        &self,
        work: &Work<T>,
        context: ExecContext,
        delay: Duration,
        placement: Placement,
        op: F,
    ) -> &Self
    where
        F: FnOnce(&mut WorkQueue<T>, TaskHandle<T>) -> bool,
    {
        let id = work.id();
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            debug!(flow = %self.shared.id, task = %work, "flow cancelled, ignoring {placement}");
            return self;
        }

        let handle = TaskHandle::new(work.clone(), context, delay);
        if !op(&mut inner.queue, handle) {
            debug!(flow = %self.shared.id, task = %work, "{placement} had no effect");
            return self;
        }

        let position = inner.queue.index_of(id).unwrap_or_default();
        inner.events.record(EventKind::TaskQueued {
            id,
            placement,
            context,
            delay_ms: millis(delay),
            position,
        });
        metrics::queue_operations().add(
            1,
            &[opentelemetry::KeyValue::new("operation", placement.to_string())],
        );
        debug!(
            flow = %self.shared.id,
            task = %work,
            %context,
            position,
            "task queued via {placement}"
        );
        self
    }

    // -----------------------------------------------------------------------
    // Flow control
    // -----------------------------------------------------------------------

    /// Start (or restart after a pause) the chain. No-op while a task is in
    /// flight or after shutdown. Buffered until the background loop is ready.
    pub fn begin(&self) -> &Self {
        let mut inner = self.lock();
        if std::mem::take(&mut inner.paused) {
            inner.events.record(EventKind::Resumed);
        }
        match inner.state {
            FlowState::Cancelled | FlowState::Running => {}
            FlowState::NotStarted => {
                if !inner.queue.is_empty() {
                    inner.pending_begin = true;
                    debug!(flow = %self.shared.id, "background loop not ready, deferring begin");
                }
            }
            FlowState::Idle => {
                self.advance(&mut inner);
            }
        }
        self
    }

    /// Stop chaining after the in-flight task completes. The in-flight task
    /// itself always runs to completion.
    pub fn pause(&self) -> &Self {
        let mut inner = self.lock();
        if !inner.paused && !inner.state.is_terminal() {
            inner.paused = true;
            inner.events.record(EventKind::Paused);
            debug!(flow = %self.shared.id, "flow paused");
        }
        self
    }

    /// Lift a pause without dispatching anything. A later [`Flow::begin`]
    /// (or an in-flight completion) continues the chain.
    pub fn resume(&self) -> &Self {
        let mut inner = self.lock();
        if std::mem::take(&mut inner.paused) {
            inner.events.record(EventKind::Resumed);
            debug!(flow = %self.shared.id, "flow resumed");
        }
        self
    }

    /// Remove a queued task that has not started. Returns false if it was
    /// not queued or is the task currently in flight.
    pub fn cancel(&self, work: &Work<T>) -> bool {
        let id = work.id();
        let mut inner = self.lock();
        if inner.in_flight == Some(id) {
            debug!(flow = %self.shared.id, task = %work, "task in flight, cancel ignored");
            return false;
        }
        if inner.queue.remove(id).is_none() {
            return false;
        }
        inner.events.record(EventKind::TaskCancelled { id });
        metrics::queue_operations()
            .add(1, &[opentelemetry::KeyValue::new("operation", "cancel")]);
        debug!(flow = %self.shared.id, task = %work, "task cancelled");
        true
    }

    /// Clear the queue, cancel the flow, and stop the background loop.
    /// Terminal; errors while stopping loops are logged, not returned.
    pub fn shutdown(&self) {
        let launcher = lock(&self.shared.launcher).take();
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            let dropped = inner.queue.len();
            inner.queue.clear();
            inner.pending_begin = false;
            inner.in_flight = None;
            self.transition(&mut inner, FlowState::Cancelled);
            inner.events.record(EventKind::Shutdown { dropped });
        }
        // An unlaunched loop is closed by dropping its launcher instead.
        if launcher.is_none() {
            let background = &self.shared.background;
            if let Err(e) = background.quit() {
                warn!(
                    flow = %self.shared.id,
                    looper = background.name(),
                    "failed to stop loop: {e}"
                );
            }
        }
        if let Some(main) = &self.shared.owned_main {
            if let Err(e) = main.quit() {
                warn!(
                    flow = %self.shared.id,
                    looper = main.name(),
                    "failed to stop loop: {e}"
                );
            }
        }
        info!(flow = %self.shared.id, "flow shut down");
    }

    /// Wait for the background loop thread to exit. Only returns once the
    /// loop has been stopped, normally via [`Flow::shutdown`].
    pub fn join(&self) -> Result<()> {
        let Some(handle) = lock(&self.shared.loop_thread).take() else {
            return Ok(());
        };
        if handle.thread().id() == std::thread::current().id() {
            *lock(&self.shared.loop_thread) = Some(handle);
            return Err(Error::Other(
                "cannot join the background loop from its own thread".to_string(),
            ));
        }
        handle
            .join()
            .map_err(|_| Error::Other("background loop thread panicked".to_string()))
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Send the head task to its execution context. The head stays queued
    /// until completion. Returns whether a dispatch occurred.
    fn advance(&self, inner: &mut Inner<T>) -> bool {
        if inner.state != FlowState::Idle {
            return false;
        }
        let Some(handle) = inner.queue.peek_head().cloned() else {
            return false;
        };

        let id = handle.id();
        let context = handle.context;
        let delay = handle.delay;
        let job = execution::wrap(self.downgrade(), handle);
        let dispatcher: &dyn Dispatcher = match context {
            ExecContext::Background => &self.shared.background,
            ExecContext::Main => self.shared.main.as_ref(),
        };

        if let Err(e) = dispatcher.post_delayed(job, delay) {
            warn!(flow = %self.shared.id, task = %id, %context, "failed to dispatch task: {e}");
            return false;
        }

        inner.in_flight = Some(id);
        self.transition(inner, FlowState::Running);
        inner.events.record(EventKind::TaskDispatched {
            id,
            context,
            delay_ms: millis(delay),
        });
        metrics::tasks_dispatched()
            .add(1, &[opentelemetry::KeyValue::new("context", context.to_string())]);
        debug!(flow = %self.shared.id, task = %id, %context, ?delay, "task dispatched");
        true
    }

    /// Completion of the in-flight task: remove it, go idle, and chain to
    /// the next head unless paused or cancelled.
    pub(crate) fn on_complete(&self, id: TaskId, elapsed: Duration) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.queue.remove(id);
        if inner.in_flight == Some(id) {
            inner.in_flight = None;
            self.transition(&mut inner, FlowState::Idle);
        }
        inner.events.record(EventKind::TaskCompleted {
            id,
            duration_ms: millis(elapsed),
        });

        if !inner.paused {
            self.advance(&mut inner);
        }
    }

    pub(crate) fn record_event(&self, kind: EventKind) {
        self.lock().events.record(kind);
    }

    fn transition(&self, inner: &mut Inner<T>, to: FlowState) {
        let from = inner.state;
        debug_assert!(from.can_transition_to(to), "invalid transition {from} -> {to}");
        inner.state = to;
        inner.events.record(EventKind::StateTransition { from, to });
        record_state_transition(&self.shared.span, &from.to_string(), &to.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        lock(&self.shared.inner)
    }

    // -----------------------------------------------------------------------
    // Payload and listener
    // -----------------------------------------------------------------------

    /// Set the value injected into event tasks dispatched from now on.
    pub fn set_data(&self, value: T) -> &Self {
        *self
            .shared
            .payload
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(value);
        self
    }

    pub fn data(&self) -> Option<T> {
        self.shared
            .payload
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_listener(&self, listener: impl FlowListener<T> + 'static) -> &Self {
        *self
            .shared
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
        self
    }

    pub fn clear_listener(&self) -> &Self {
        *self
            .shared
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self
    }

    pub fn listener(&self) -> Option<Arc<dyn FlowListener<T>>> {
        self.shared
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn id(&self) -> FlowId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn span(&self) -> &Span {
        &self.shared.span
    }

    pub fn state(&self) -> FlowState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.lock().state == FlowState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().state.is_terminal()
    }

    /// Number of queued tasks, including the one in flight.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn index_of(&self, work: &Work<T>) -> Option<usize> {
        self.lock().queue.index_of(work.id())
    }

    /// Queued task identities in execution order.
    pub fn queued(&self) -> Vec<TaskId> {
        self.lock().queue.ids()
    }

    /// Recorded events with a sequence number greater than `since_seq`.
    pub fn events_since(&self, since_seq: u64) -> Vec<FlowEvent> {
        self.lock().events.since(since_seq)
    }
}
