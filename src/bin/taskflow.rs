//! taskflow CLI: run a demonstration flow and inspect its event trail.

use std::time::Duration;

use clap::{Parser, Subcommand};
use taskflow_rs::config::Config;
use taskflow_rs::engine::{Flow, FlowBuilder, FlowListener};
use taskflow_rs::task::{TaskFault, Work};
use taskflow_rs::telemetry::{TelemetryConfig, init_telemetry};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "taskflow", about = "Sequential task flows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a demonstration flow to completion
    Run {
        /// Number of tasks to enqueue
        #[arg(long, default_value_t = 5)]
        tasks: usize,
        /// Delay before each task may start, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        /// Route every K-th task to the main context (0 = never)
        #[arg(long, default_value_t = 2)]
        main_every: usize,
        /// Index of a task that should fail
        #[arg(long)]
        fail_at: Option<usize>,
        /// Print the flow's event log as JSON when done
        #[arg(long)]
        events: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

/// Forwards task completions to the CLI so it knows when the flow drained.
struct ProgressListener {
    done: mpsc::UnboundedSender<String>,
}

impl FlowListener<String> for ProgressListener {
    fn on_start(&self, _flow: &Flow<String>, work: &Work<String>) -> bool {
        info!(task = %work, "task starting");
        true
    }

    fn on_end(&self, _flow: &Flow<String>, work: &Work<String>) {
        let _ = self.done.send(work.to_string());
    }

    fn on_error(&self, _flow: &Flow<String>, work: &Work<String>, fault: &TaskFault) {
        error!(task = %work, "task failed: {fault}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _telemetry = init_telemetry(TelemetryConfig::from_config(&config, "taskflow"))?;

    match cli.command {
        Command::Run {
            tasks,
            delay_ms,
            main_every,
            fail_at,
            events,
            timeout_secs,
        } => {
            cmd_run(
                &config,
                tasks,
                Duration::from_millis(delay_ms),
                main_every,
                fail_at,
                events,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    }
}

async fn cmd_run(
    config: &Config,
    tasks: usize,
    delay: Duration,
    main_every: usize,
    fail_at: Option<usize>,
    events: bool,
    timeout: Duration,
) -> anyhow::Result<()> {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let flow: Flow<String> = FlowBuilder::from_config(config)
        .payload("demo".to_string())
        .listener(ProgressListener { done: done_tx })
        .build()?;

    for index in 0..tasks {
        let label = format!("task-{index}");
        let work = if fail_at == Some(index) {
            let name = label.clone();
            Work::try_new(move || Err(format!("{name} failed on purpose"))).named(label)
        } else {
            let name = label.clone();
            Work::event(move |payload: Option<String>| {
                let thread = std::thread::current();
                info!(
                    task = %name,
                    thread = thread.name().unwrap_or("?"),
                    payload = payload.as_deref().unwrap_or(""),
                    "task running"
                );
            })
            .named(label)
        };

        if main_every > 0 && (index + 1) % main_every == 0 {
            flow.next_in_main_delayed(&work, delay);
        } else {
            flow.next_delayed(&work, delay);
        }
    }

    info!(flow = %flow.id(), tasks, "beginning flow");
    flow.begin();

    let wait = async {
        let mut finished = 0;
        while finished < tasks {
            match done_rx.recv().await {
                Some(_) => finished += 1,
                None => break,
            }
        }
        finished
    };
    let finished = tokio::time::timeout(timeout, wait).await.unwrap_or_else(|_| {
        error!("timed out waiting for the flow to drain");
        0
    });
    info!(finished, "flow drained");

    if events {
        let log = flow.events_since(0);
        println!("{}", serde_json::to_string_pretty(&log)?);
    }

    flow.shutdown();
    tokio::task::spawn_blocking(move || flow.join()).await??;
    Ok(())
}
