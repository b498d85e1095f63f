//! Poll-driven runner.
//!
//! The runner sweeps the store on a fixed interval and reconciles every
//! application that is due. Within a sweep, reconciles run concurrently up
//! to a worker limit and every spawned task is joined before the sweep
//! ends, so an application is never reconciled by two tasks at once.
//!
//! "Requeue after D" from the machine becomes a due-time entry; sweeps
//! skip applications whose due time has not arrived. `Done` clears the
//! entry, leaving the application to the ordinary sweep cadence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use vershift_platform::{ProbeClient, TaskLauncher, WorkloadManager};
use vershift_state::StatusStore;

use crate::machine::{Reconcile, UpgradeMachine};

/// Tuning knobs for the runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Interval between sweeps.
    pub poll_interval: Duration,
    /// Maximum concurrent reconciles within a sweep.
    pub workers: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            workers: 8,
        }
    }
}

/// Sweeps the store and drives the machine.
pub struct Runner<W, T, P>
where
    W: WorkloadManager + 'static,
    T: TaskLauncher + 'static,
    P: ProbeClient + 'static,
{
    machine: Arc<UpgradeMachine<W, T, P>>,
    store: StatusStore,
    pool: Arc<Semaphore>,
    next_due: Arc<Mutex<HashMap<String, Instant>>>,
    config: RunnerConfig,
}

impl<W, T, P> Runner<W, T, P>
where
    W: WorkloadManager + 'static,
    T: TaskLauncher + 'static,
    P: ProbeClient + 'static,
{
    pub fn new(machine: UpgradeMachine<W, T, P>, store: StatusStore, config: RunnerConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            machine: Arc::new(machine),
            store,
            pool: Arc::new(Semaphore::new(workers)),
            next_due: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Sweep until the shutdown signal flips to `true` (or its sender is
    /// dropped). The in-flight sweep finishes before this returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval = ?self.config.poll_interval,
            workers = self.config.workers,
            "runner started"
        );
        loop {
            self.sweep().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("runner stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Reconcile every due application once, joining all spawned work.
    pub async fn sweep(&self) {
        let apps = match self.store.list_apps() {
            Ok(apps) => apps,
            Err(e) => {
                error!(error = %e, "listing applications failed, skipping sweep");
                return;
            }
        };

        let mut tasks = JoinSet::new();
        for app in apps {
            let app_id = app.table_key();
            if !self.due(&app_id) {
                continue;
            }
            let Ok(permit) = self.pool.clone().acquire_owned().await else {
                return; // semaphore closed, shutting down
            };
            let machine = self.machine.clone();
            let next_due = self.next_due.clone();
            tasks.spawn(async move {
                let _permit = permit;
                match machine.reconcile(&app_id).await {
                    Ok(Reconcile::Done) => {
                        next_due.lock().unwrap().remove(&app_id);
                    }
                    Ok(Reconcile::RequeueAfter(delay)) => {
                        debug!(%app_id, ?delay, "requeued");
                        next_due
                            .lock()
                            .unwrap()
                            .insert(app_id, Instant::now() + delay);
                    }
                    Err(e) => {
                        // Transient by the error contract; the next sweep
                        // picks the application up again.
                        error!(%app_id, error = %e, "reconcile failed");
                        next_due.lock().unwrap().remove(&app_id);
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "reconcile task panicked");
            }
        }
    }

    fn due(&self, app_id: &str) -> bool {
        let mut next_due = self.next_due.lock().unwrap();
        match next_due.get(app_id) {
            Some(at) if Instant::now() < *at => false,
            Some(_) => {
                next_due.remove(app_id);
                true
            }
            None => true,
        }
    }
}
