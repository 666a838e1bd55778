//! Shared helpers for flow integration tests.

#![allow(dead_code)]

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use taskflow_rs::task::Work;

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(200);

/// Collects the names tasks report as they run.
pub struct Trace {
    tx: Sender<String>,
    rx: Mutex<Receiver<String>>,
}

impl Trace {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
        })
    }

    pub fn push(&self, name: impl Into<String>) {
        let _ = self.tx.send(name.into());
    }

    /// Next reported name, failing the test if nothing arrives in time.
    pub fn expect(&self) -> String {
        self.rx
            .lock()
            .unwrap()
            .recv_timeout(WAIT)
            .expect("timed out waiting for a task")
    }

    pub fn expect_n(&self, n: usize) -> Vec<String> {
        (0..n).map(|_| self.expect()).collect()
    }

    /// Assert that nothing else is reported for a short while.
    pub fn expect_quiet(&self) {
        match self.rx.lock().unwrap().recv_timeout(QUIET) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(name) => panic!("unexpected task ran: {name}"),
            Err(RecvTimeoutError::Disconnected) => panic!("trace disconnected"),
        }
    }
}

/// A task that reports its name when it runs.
pub fn traced<T>(trace: &Arc<Trace>, name: &str) -> Work<T> {
    let trace = Arc::clone(trace);
    let label = name.to_string();
    Work::new(move || trace.push(label.clone())).named(name)
}

/// One-shot latch a task can block on until the test opens it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let guard = self.open.lock().unwrap();
        let (_guard, timeout) = self
            .cv
            .wait_timeout_while(guard, WAIT, |open| !*open)
            .unwrap();
        assert!(!timeout.timed_out(), "gate never opened");
    }
}

/// A task that reports `<name>:start`, blocks on `gate`, then reports `<name>`.
pub fn gated<T>(trace: &Arc<Trace>, gate: &Arc<Gate>, name: &str) -> Work<T> {
    let trace = Arc::clone(trace);
    let gate = Arc::clone(gate);
    let label = name.to_string();
    Work::new(move || {
        trace.push(format!("{label}:start"));
        gate.wait();
        trace.push(label.clone());
    })
    .named(name)
}

/// Poll `cond` until it holds or the wait budget runs out.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}
