//! vershiftd — the vershift daemon.
//!
//! Single binary that assembles the orchestrator:
//! - Status store (redb)
//! - Upgrade state machine with injected platform backends
//! - Poll-driven runner
//!
//! plus small store-editing subcommands for operating it without an API
//! surface: `apply`, `status`, `pause`, `resume`, `remove`.
//!
//! # Usage
//!
//! ```text
//! vershiftd run --data-dir /var/lib/vershift
//! vershiftd apply --file shop.json
//! vershiftd status default/shop
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use vershift_health::HttpProber;
use vershift_machine::{Runner, RunnerConfig, UpgradeMachine};
use vershift_platform::{InMemoryTasks, InMemoryWorkloads, ProbeOutcome, ScriptedProbe, TaskLauncher, TaskState};
use vershift_state::{AppStatus, ManagedApp, StatusStore};

#[derive(Parser)]
#[command(name = "vershiftd", about = "vershift upgrade orchestrator daemon")]
struct Cli {
    /// Data directory for persistent state.
    #[arg(long, global = true, default_value = "/var/lib/vershift")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator loop.
    Run {
        /// Sweep interval in seconds.
        #[arg(long, default_value = "2")]
        poll_interval: u64,

        /// Maximum concurrent reconciles per sweep.
        #[arg(long, default_value = "8")]
        workers: u64,

        /// Simulation mode: probes always pass and migration tasks
        /// complete on their own. Without it, health probes hit the
        /// applications' real addresses; workloads and tasks still use
        /// the in-process backends.
        #[arg(long)]
        simulate: bool,
    },

    /// Register or update a managed application from a JSON file.
    Apply {
        /// Path to the application spec (JSON).
        #[arg(long)]
        file: PathBuf,
    },

    /// Print an application's status (or all, if no id is given).
    Status {
        /// Application id, `namespace/name`.
        app_id: Option<String>,
    },

    /// Freeze an application's upgrade in place.
    Pause { app_id: String },

    /// Resume a paused application.
    Resume { app_id: String },

    /// Mark an application for cleanup and removal.
    Remove { app_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vershift=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.data_dir)?;
    let store = StatusStore::open(&cli.data_dir.join("vershift.redb"))?;

    match cli.command {
        Command::Run {
            poll_interval,
            workers,
            simulate,
        } => run_daemon(store, poll_interval, workers, simulate).await,
        Command::Apply { file } => apply(&store, &file),
        Command::Status { app_id } => print_status(&store, app_id.as_deref()),
        Command::Pause { app_id } => set_paused(&store, &app_id, true),
        Command::Resume { app_id } => set_paused(&store, &app_id, false),
        Command::Remove { app_id } => remove(&store, &app_id),
    }
}

async fn run_daemon(
    store: StatusStore,
    poll_interval: u64,
    workers: u64,
    simulate: bool,
) -> anyhow::Result<()> {
    info!(simulate, "vershift daemon starting");

    let workloads = Arc::new(InMemoryWorkloads::new());
    let tasks = Arc::new(InMemoryTasks::new());

    let runner_config = RunnerConfig {
        poll_interval: Duration::from_secs(poll_interval.max(1)),
        workers: workers.max(1) as usize,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Simulation mode completes migration tasks by itself.
    let driver_handle = simulate.then(|| {
        let tasks = tasks.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(drive_simulated_tasks(tasks, shutdown))
    });

    let runner_handle = if simulate {
        let prober = Arc::new(ScriptedProbe::always(ProbeOutcome::Pass));
        let machine = UpgradeMachine::new(store.clone(), workloads, tasks, prober);
        let runner = Runner::new(machine, store, runner_config);
        tokio::spawn(async move { runner.run(shutdown_rx).await })
    } else {
        let prober = Arc::new(HttpProber::new());
        let machine = UpgradeMachine::new(store.clone(), workloads, tasks, prober);
        let runner = Runner::new(machine, store, runner_config);
        tokio::spawn(async move { runner.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = runner_handle.await;
    if let Some(handle) = driver_handle {
        let _ = handle.await;
    }

    info!("vershift daemon stopped");
    Ok(())
}

/// Completes every pending migration task after a short delay.
async fn drive_simulated_tasks(tasks: Arc<InMemoryTasks>, mut shutdown: watch::Receiver<bool>) {
    loop {
        for task_id in tasks.task_ids() {
            if let Ok(Some(TaskState::Pending)) = tasks.task_status(&task_id).await {
                info!(%task_id, "simulated migration completed");
                tasks.complete(&task_id);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

// ── Store-editing subcommands ─────────────────────────────────────

fn apply(store: &StatusStore, file: &PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)?;
    let app: ManagedApp = serde_json::from_str(&raw)?;
    app.strategy
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid strategy in {}: {e}", file.display()))?;

    let app_id = app.table_key();
    store.put_app(&app)?;
    if store.read_status(&app_id)?.is_none() {
        // First sight of this application: nothing is promoted yet.
        store.write_status(&app_id, &AppStatus::new(""), 0)?;
    }
    println!("applied {app_id}");
    Ok(())
}

fn print_status(store: &StatusStore, app_id: Option<&str>) -> anyhow::Result<()> {
    let apps = match app_id {
        Some(id) => store
            .get_app(id)?
            .map(|app| vec![app])
            .ok_or_else(|| anyhow::anyhow!("unknown application: {id}"))?,
        None => store.list_apps()?,
    };

    for app in apps {
        let id = app.table_key();
        match store.read_status(&id)? {
            Some((status, revision)) => {
                println!(
                    "{id}: phase={:?} current={} target={} revision={revision}",
                    status.phase,
                    if status.current_version.is_empty() {
                        "<none>"
                    } else {
                        &status.current_version
                    },
                    app.target_version,
                );
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            None => println!("{id}: no status recorded"),
        }
    }
    Ok(())
}

fn set_paused(store: &StatusStore, app_id: &str, paused: bool) -> anyhow::Result<()> {
    let mut app = store
        .get_app(app_id)?
        .ok_or_else(|| anyhow::anyhow!("unknown application: {app_id}"))?;
    app.paused = paused;
    store.put_app(&app)?;
    println!("{app_id}: paused={paused}");
    Ok(())
}

fn remove(store: &StatusStore, app_id: &str) -> anyhow::Result<()> {
    let mut app = store
        .get_app(app_id)?
        .ok_or_else(|| anyhow::anyhow!("unknown application: {app_id}"))?;
    app.deletion_requested = true;
    store.put_app(&app)?;
    println!("{app_id}: marked for removal, the runner cleans it up");
    Ok(())
}
