//! Integration tests for the flow controller: ordering, reordering, pause,
//! cancellation, startup buffering, and shutdown.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use common::{Gate, Trace, gated, traced, wait_until};
use taskflow_rs::engine::{Dispatcher, Flow, Looper};
use taskflow_rs::error::Error;
use taskflow_rs::event::EventKind;
use taskflow_rs::model::FlowState;
use taskflow_rs::task::Work;

fn test_flow(name: &str) -> Flow<()> {
    Flow::builder()
        .name(name)
        .build()
        .expect("failed to build flow")
}

fn dispatch_count(flow: &Flow<()>) -> usize {
    flow.events_since(0)
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskDispatched { .. }))
        .count()
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[test]
fn next_runs_tasks_in_insertion_order() {
    let flow = test_flow("fifo");
    let trace = Trace::new();
    let (a, b, c) = (
        traced(&trace, "A"),
        traced(&trace, "B"),
        traced(&trace, "C"),
    );

    flow.next(&a).next(&b).next(&c).begin();

    assert_eq!(trace.expect_n(3), vec!["A", "B", "C"]);
    wait_until(|| flow.is_empty() && !flow.is_running());
    assert_eq!(flow.state(), FlowState::Idle);
}

#[test]
fn at_most_one_task_in_flight_across_contexts() {
    let flow = test_flow("one-at-a-time");
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Trace::new();

    for i in 0..8 {
        let (active, peak, done) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&done));
        let work: Work<()> = Work::new(move || {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            active.fetch_sub(1, Ordering::SeqCst);
            done.push(i.to_string());
        });
        if i % 2 == 0 {
            flow.next(&work);
        } else {
            flow.next_in_main(&work);
        }
    }
    flow.begin();

    let order = done.expect_n(8);
    assert_eq!(order, (0..8).map(|i| i.to_string()).collect::<Vec<_>>());
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn front_while_running_runs_before_remaining_tasks() {
    let flow = test_flow("front-scenario");
    let trace = Trace::new();
    let gate = Gate::new();
    let a = traced(&trace, "A");
    let b = gated(&trace, &gate, "B");
    let c = traced(&trace, "C");
    let d = traced(&trace, "D");

    flow.next(&a).next(&b).next(&c).begin();
    assert_eq!(trace.expect_n(2), vec!["A", "B:start"]);

    flow.front(&d);
    assert_eq!(flow.queued(), vec![d.id(), b.id(), c.id()]);
    gate.open();

    assert_eq!(trace.expect_n(3), vec!["B", "D", "C"]);
}

#[test]
fn behind_and_front_of_reorder_pending_tasks() {
    let flow = test_flow("reorder");
    let trace = Trace::new();
    let (a, b, c, w, x) = (
        traced(&trace, "A"),
        traced(&trace, "B"),
        traced(&trace, "C"),
        traced(&trace, "W"),
        traced(&trace, "X"),
    );

    flow.next(&a).next(&b).next(&c);
    flow.behind(&w, &a);
    flow.front_of(&x, &c);
    assert_eq!(
        flow.queued(),
        vec![a.id(), w.id(), b.id(), x.id(), c.id()]
    );

    flow.begin();
    assert_eq!(trace.expect_n(5), vec!["A", "W", "B", "X", "C"]);
}

#[test]
fn reorder_relative_to_missing_or_head_target_is_ignored() {
    let flow = test_flow("reorder-noop");
    let trace = Trace::new();
    let (a, b, w, missing) = (
        traced(&trace, "A"),
        traced(&trace, "B"),
        traced(&trace, "W"),
        traced(&trace, "missing"),
    );

    flow.next(&a).next(&b);
    flow.behind(&w, &missing);
    flow.front_of(&w, &a);
    flow.front_of(&w, &missing);

    assert_eq!(flow.queued(), vec![a.id(), b.id()]);
    assert_eq!(flow.index_of(&w), None);
}

#[test]
fn front_of_delayed_in_main_updates_existing_task() {
    let flow = test_flow("reorder-update");
    let trace = Trace::new();
    let (a, b, c) = (
        traced(&trace, "A"),
        traced(&trace, "B"),
        traced(&trace, "C"),
    );

    flow.next(&a).next(&b).next(&c);
    flow.front_of_in_main_delayed(&c, Duration::from_millis(20), &b);

    assert_eq!(flow.queued(), vec![a.id(), c.id(), b.id()]);
    let queued = flow
        .events_since(0)
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::TaskQueued { id, context, delay_ms, position, .. } if id == c.id() => {
                Some((context, delay_ms, position))
            }
            _ => None,
        })
        .last()
        .expect("front_of recorded");
    assert_eq!(queued, (taskflow_rs::model::ExecContext::Main, 20, 1));
}

// ---------------------------------------------------------------------------
// Begin and startup buffering
// ---------------------------------------------------------------------------

#[test]
fn begin_before_loop_ready_fires_exactly_once() {
    let flow: Flow<()> = Flow::builder()
        .name("deferred")
        .autostart(false)
        .build()
        .unwrap();
    let trace = Trace::new();
    let a = traced(&trace, "A");

    flow.next(&a).begin().begin();
    assert_eq!(flow.state(), FlowState::NotStarted);
    trace.expect_quiet();

    flow.start().unwrap();
    assert_eq!(trace.expect(), "A");
    trace.expect_quiet();
    assert_eq!(dispatch_count(&flow), 1);
    assert!(matches!(flow.start(), Err(Error::AlreadyStarted)));
}

#[test]
fn begin_while_running_does_not_dispatch_again() {
    let flow = test_flow("double-begin");
    let trace = Trace::new();
    let gate = Gate::new();
    let a = gated(&trace, &gate, "A");

    flow.next(&a).begin();
    assert_eq!(trace.expect(), "A:start");
    flow.begin().begin();
    assert_eq!(dispatch_count(&flow), 1);

    gate.open();
    assert_eq!(trace.expect(), "A");
    trace.expect_quiet();
}

#[test]
fn begin_on_empty_flow_is_noop() {
    let flow = test_flow("empty");
    wait_until(|| flow.state() == FlowState::Idle);
    flow.begin();
    assert_eq!(flow.state(), FlowState::Idle);
    assert_eq!(dispatch_count(&flow), 0);
}

#[test]
fn tasks_enqueued_after_drain_need_another_begin() {
    let flow = test_flow("no-autostart");
    let trace = Trace::new();
    let (a, b) = (traced(&trace, "A"), traced(&trace, "B"));

    flow.next(&a).begin();
    assert_eq!(trace.expect(), "A");
    wait_until(|| !flow.is_running());

    flow.next(&b);
    trace.expect_quiet();
    flow.begin();
    assert_eq!(trace.expect(), "B");
}

#[test]
fn delayed_task_waits_before_starting() {
    let flow = test_flow("delayed");
    let trace = Trace::new();
    let a = traced(&trace, "A");
    let start = Instant::now();

    flow.next_delayed(&a, Duration::from_millis(150)).begin();

    assert_eq!(trace.expect(), "A");
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[test]
fn unbounded_delay_is_accepted_and_never_fires() {
    let flow = test_flow("unbounded-delay");
    let trace = Trace::new();
    let a = traced(&trace, "A");

    flow.next_delayed(&a, Duration::MAX).begin();

    assert_eq!(flow.state(), FlowState::Running);
    let dispatched = flow.events_since(0).into_iter().find_map(|e| match e.kind {
        EventKind::TaskDispatched { id, delay_ms, .. } => Some((id, delay_ms)),
        _ => None,
    });
    assert_eq!(dispatched, Some((a.id(), u64::MAX)));
    trace.expect_quiet();

    flow.shutdown();
    flow.join().unwrap();
    assert!(flow.is_cancelled());
}

// ---------------------------------------------------------------------------
// Pause / resume
// ---------------------------------------------------------------------------

#[test]
fn pause_lets_in_flight_task_finish_but_stops_chain() {
    let flow = test_flow("pause");
    let trace = Trace::new();
    let gate = Gate::new();
    let a = gated(&trace, &gate, "A");
    let b = traced(&trace, "B");

    flow.next(&a).next(&b).begin();
    assert_eq!(trace.expect(), "A:start");

    flow.pause();
    gate.open();
    assert_eq!(trace.expect(), "A");
    wait_until(|| !flow.is_running());
    trace.expect_quiet();
    assert_eq!(flow.queued(), vec![b.id()]);
    assert!(flow.is_paused());

    flow.begin();
    assert!(!flow.is_paused());
    assert_eq!(trace.expect(), "B");
}

#[test]
fn resume_does_not_dispatch_by_itself() {
    let flow = test_flow("resume");
    let trace = Trace::new();
    let gate = Gate::new();
    let a = gated(&trace, &gate, "A");
    let b = traced(&trace, "B");

    flow.next(&a).next(&b).begin();
    assert_eq!(trace.expect(), "A:start");
    flow.pause();
    gate.open();
    assert_eq!(trace.expect(), "A");
    wait_until(|| !flow.is_running());

    flow.resume();
    assert!(!flow.is_paused());
    trace.expect_quiet();

    flow.begin();
    assert_eq!(trace.expect(), "B");
}

#[test]
fn resume_before_completion_continues_chain() {
    let flow = test_flow("resume-mid-flight");
    let trace = Trace::new();
    let gate = Gate::new();
    let a = gated(&trace, &gate, "A");
    let b = traced(&trace, "B");

    flow.next(&a).next(&b).begin();
    assert_eq!(trace.expect(), "A:start");
    flow.pause().resume();
    gate.open();

    assert_eq!(trace.expect_n(2), vec!["A", "B"]);
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[test]
fn cancel_removes_queued_task_but_not_in_flight_one() {
    let flow = test_flow("cancel");
    let trace = Trace::new();
    let gate = Gate::new();
    let a = gated(&trace, &gate, "A");
    let b = traced(&trace, "B");
    let c = traced(&trace, "C");

    flow.next(&a).next(&b).next(&c).begin();
    assert_eq!(trace.expect(), "A:start");

    assert!(!flow.cancel(&a));
    assert!(flow.cancel(&b));
    assert!(!flow.cancel(&b));
    gate.open();

    assert_eq!(trace.expect_n(2), vec!["A", "C"]);
    trace.expect_quiet();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[test]
fn shutdown_clears_queue_and_is_terminal() {
    let flow = test_flow("shutdown");
    let trace = Trace::new();
    let gate = Gate::new();
    let a = gated(&trace, &gate, "A");
    let b = traced(&trace, "B");
    let c = traced(&trace, "C");

    flow.next(&a).next(&b).begin();
    assert_eq!(trace.expect(), "A:start");

    flow.shutdown();
    assert!(flow.is_cancelled());
    assert!(flow.is_empty());

    gate.open();
    assert_eq!(trace.expect(), "A");
    flow.join().unwrap();

    flow.next(&c).begin();
    assert!(flow.is_empty());
    trace.expect_quiet();
    assert!(
        flow.events_since(0)
            .iter()
            .any(|e| matches!(e.kind, EventKind::Shutdown { dropped: 2 }))
    );
}

#[test]
fn shutdown_before_start_never_runs_anything() {
    let flow: Flow<()> = Flow::builder()
        .name("shutdown-early")
        .autostart(false)
        .build()
        .unwrap();
    let trace = Trace::new();
    let a = traced(&trace, "A");

    flow.next(&a).begin();
    flow.shutdown();
    flow.shutdown();

    assert!(matches!(flow.start(), Err(Error::AlreadyStarted)));
    assert_eq!(flow.state(), FlowState::Cancelled);
    trace.expect_quiet();
}

// ---------------------------------------------------------------------------
// Execution contexts
// ---------------------------------------------------------------------------

/// Host dispatcher stand-in that counts what it is asked to run.
struct CountingDispatcher {
    looper: Looper,
    posted: AtomicUsize,
}

impl Dispatcher for CountingDispatcher {
    fn post_delayed(
        &self,
        job: taskflow_rs::engine::Job,
        delay: Duration,
    ) -> taskflow_rs::error::Result<()> {
        self.posted.fetch_add(1, Ordering::SeqCst);
        self.looper.post_delayed(job, delay)
    }
}

fn thread_reporter(trace: &Arc<Trace>) -> Work<()> {
    let trace = Arc::clone(trace);
    Work::new(move || {
        let name = std::thread::current().name().unwrap_or("").to_string();
        trace.push(name);
    })
}

#[test]
fn tasks_run_on_their_target_context() {
    let host = Arc::new(CountingDispatcher {
        looper: Looper::spawn("host-main").unwrap(),
        posted: AtomicUsize::new(0),
    });
    let flow: Flow<()> = Flow::builder()
        .name("contexts")
        .main_dispatcher(Arc::clone(&host) as Arc<dyn Dispatcher>)
        .build()
        .unwrap();
    let trace = Trace::new();

    flow.next(&thread_reporter(&trace))
        .next_in_main(&thread_reporter(&trace))
        .next(&thread_reporter(&trace))
        .begin();

    assert_eq!(
        trace.expect_n(3),
        vec!["contexts-bg", "host-main", "contexts-bg"]
    );
    assert_eq!(host.posted.load(Ordering::SeqCst), 1);
}

#[test]
fn default_main_context_is_a_dedicated_loop() {
    let flow = test_flow("standin");
    let trace = Trace::new();

    flow.next_in_main(&thread_reporter(&trace)).begin();
    assert_eq!(trace.expect(), "standin-main");
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[test]
fn events_have_monotonic_sequence_numbers() {
    let flow = test_flow("events");
    let trace = Trace::new();
    let (a, b) = (traced(&trace, "A"), traced(&trace, "B"));

    flow.next(&a).next(&b).begin();
    trace.expect_n(2);
    wait_until(|| !flow.is_running() && flow.is_empty());

    let events = flow.events_since(0);
    for window in events.windows(2) {
        assert!(window[1].seq > window[0].seq);
    }
    assert!(events.iter().all(|e| e.flow_id == flow.id()));
    assert_eq!(dispatch_count(&flow), 2);

    let last = events.last().unwrap().seq;
    assert!(flow.events_since(last).is_empty());
}

#[test]
fn event_log_is_bounded() {
    let flow: Flow<()> = Flow::builder()
        .name("bounded")
        .event_capacity(3)
        .build()
        .unwrap();
    for _ in 0..10 {
        flow.next(&Work::new(|| {}));
    }
    wait_until(|| flow.events_since(0).len() == 3);
    let events = flow.events_since(0);
    assert!(events[0].seq > 1);
}
