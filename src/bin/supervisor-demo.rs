//! A small CLI exercising the library end to end: register a couple of
//! harness entry points, spawn them under supervision, and run until the
//! map empties. Structured the way the teacher's `main.rs` dispatches over
//! a `clap::Subcommand`, including the self-re-exec-as-child pattern it
//! uses for its hidden `_supervise` subcommand — here the re-exec'd child
//! is detected and dispatched before `Cli::parse()` even runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Map;

use proc_supervisor::harness::{HarnessConfig, HarnessRegistry};
use proc_supervisor::logging::{self, LoggingQueue};
use proc_supervisor::platform::Sig;
use proc_supervisor::supervisor::{ChildTarget, RunMode, Supervisor, SupervisorConfig};

#[derive(Debug, Parser)]
#[command(name = "supervisor-demo")]
#[command(about = "Demonstrates the proc-supervisor library", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Spawn a steady worker and a worker that exits after 200ms, watch the
    /// supervisor restart the latter for a few cycles, then shut the whole
    /// tree down.
    Demo {
        /// How many straggler-retry rounds `kill_children` gets during
        /// final shutdown before it concedes.
        #[arg(long, default_value = "3")]
        stop_after: u32,
    },
}

fn harness_registry() -> Arc<HarnessRegistry> {
    let mut registry = HarnessRegistry::new();
    registry.register(
        "steady-worker",
        HarnessConfig {
            signal_handling: true,
        },
        Arc::new(steady_worker),
    );
    registry.register(
        "flaky-worker",
        HarnessConfig {
            signal_handling: true,
        },
        Arc::new(flaky_worker),
    );
    Arc::new(registry)
}

fn steady_worker() {
    tracing::info!("steady-worker running");
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

fn flaky_worker() {
    tracing::info!("flaky-worker running, will exit after 200ms");
    std::thread::sleep(Duration::from_millis(200));
    std::process::exit(7);
}

fn main() -> Result<()> {
    let registry = harness_registry();

    // A re-exec'd child process carries PROC_SUPERVISOR_HARNESS in its
    // environment; dispatch_if_child never returns in that case.
    if registry.dispatch_if_child() {
        unreachable!("dispatch_if_child exits the process directly");
    }

    let (queue, receiver) = LoggingQueue::channel();
    logging::setup_logging(&queue).context("installing tracing subscriber")?;
    // Nothing in this demo reads the forwarded records; a host that wants
    // to observe them (tests, a status endpoint) would read `receiver`
    // instead of draining it like this.
    std::thread::spawn(move || {
        for _record in receiver {}
    });

    let cli = Cli::parse();
    match cli.command {
        Command::Demo { stop_after } => run_demo(registry, stop_after),
    }
}

fn run_demo(registry: Arc<HarnessRegistry>, stop_after: u32) -> Result<()> {
    let mut supervisor = Supervisor::new(
        SupervisorConfig {
            name: "supervisor-demo".to_string(),
            wait_for_kill: Duration::from_secs(2),
            restart_enabled: true,
        },
        registry,
    );

    supervisor.add_process(
        ChildTarget::Entry {
            name: "steady-worker",
            signal_handling: true,
        },
        Vec::new(),
        Map::new(),
        None,
    )?;
    supervisor.add_process(
        ChildTarget::Entry {
            name: "flaky-worker",
            signal_handling: true,
        },
        Vec::new(),
        Map::new(),
        None,
    )?;

    // An event-driven run loop just needs to yield the poll interval back
    // to whatever scheduler is hosting it; this demo has none, so it
    // sleeps a shorter slice instead of blocking the full 10s tick.
    supervisor.run(RunMode::EventDriven(&mut |interval| {
        std::thread::sleep(interval.min(Duration::from_millis(200)));
    }));

    supervisor.send_signal_to_processes(Sig::Term);
    supervisor.kill_children(None, stop_after);
    Ok(())
}
