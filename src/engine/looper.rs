//! Dedicated single-threaded run loop.
//!
//! A [`Looper`] owns one OS thread driving a current-thread tokio runtime.
//! Jobs posted to it run one at a time, on that thread, in deadline order;
//! jobs with equal deadlines run in submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Longest the loop sleeps before re-checking its heap.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Delays are clamped to this horizon (30 years) so deadlines stay
/// representable as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A unit the run loop executes.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A serialized execution context that accepts delayed jobs.
///
/// Implementations must not run the job on the caller's thread: flows post
/// while holding their state lock.
pub trait Dispatcher: Send + Sync {
    /// Schedule `job` to run after at least `delay`, preserving submission
    /// order for equal delays.
    fn post_delayed(&self, job: Job, delay: Duration) -> Result<()>;

    fn post(&self, job: Job) -> Result<()> {
        self.post_delayed(job, Duration::ZERO)
    }
}

enum Command {
    Post { job: Job, due: Instant },
    Quit,
}

/// Handle to a run loop. Cheap to share behind an `Arc`.
pub struct Looper {
    name: String,
    tx: mpsc::UnboundedSender<Command>,
}

/// The not-yet-running half of a [`Looper`]. Jobs posted before launch are
/// buffered and run once the loop starts.
pub struct LoopLauncher {
    name: String,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Looper {
    /// Create a loop without starting its thread.
    pub fn new(name: impl Into<String>) -> (Self, LoopLauncher) {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.clone(),
                tx,
            },
            LoopLauncher { name, rx },
        )
    }

    /// Create and start a loop with no startup hook. The thread is detached;
    /// it exits after [`Looper::quit`] or once every handle is dropped.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let (looper, launcher) = Self::new(name);
        launcher.launch(|| {})?;
        Ok(looper)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to stop. Pending jobs are discarded; a job that is
    /// already running finishes first.
    pub fn quit(&self) -> Result<()> {
        self.tx
            .send(Command::Quit)
            .map_err(|_| Error::LoopClosed(self.name.clone()))
    }

    /// Whether the loop has stopped accepting work.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Dispatcher for Looper {
    fn post_delayed(&self, job: Job, delay: Duration) -> Result<()> {
        let due = Instant::now() + delay.min(FAR_FUTURE);
        self.tx
            .send(Command::Post { job, due })
            .map_err(|_| Error::LoopClosed(self.name.clone()))
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LoopLauncher {
    /// Spawn the loop thread. `on_ready` runs on that thread before any
    /// posted job.
    pub fn launch<F>(self, on_ready: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let LoopLauncher { name, rx } = self;
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(looper = %name, "failed to build run loop runtime: {e}");
                        return;
                    }
                };
                runtime.block_on(run_loop(&name, rx, on_ready));
            })?;
        Ok(handle)
    }
}

struct Scheduled {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

async fn run_loop<F>(name: &str, mut rx: mpsc::UnboundedReceiver<Command>, on_ready: F)
where
    F: FnOnce(),
{
    on_ready();
    debug!(looper = name, "run loop ready");

    let mut pending: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        let now = Instant::now();
        while pending.peek().is_some_and(|s| s.due <= now) {
            let Some(scheduled) = pending.pop() else {
                break;
            };
            if catch_unwind(AssertUnwindSafe(scheduled.job)).is_err() {
                error!(looper = name, "job panicked on run loop");
            }
        }

        let horizon = now + IDLE_WAKE;
        let wake = pending.peek().map_or(horizon, |s| s.due.min(horizon));
        let deadline = tokio::time::Instant::from_std(wake);

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Post { job, due }) => {
                    pending.push(Scheduled { due, seq, job });
                    seq += 1;
                }
                Some(Command::Quit) | None => break,
            },
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }

    debug!(looper = name, discarded = pending.len(), "run loop stopped");
}
