//! The upgrade state machine.
//!
//! Phases: Healthy → (Migrating) → Deploying → HealthChecking → (Canary) →
//! Promoting → Healthy, with Failed/RollingBack as the abort path. Only
//! this module writes `phase`, `current_version`, or `canary_weight`; leaf
//! components report outcomes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use vershift_canary::{CanaryController, CanaryOutcome};
use vershift_health::{GateOutcome, HealthGate, gate_key};
use vershift_migrate::{MigrationOutcome, MigrationRunner};
use vershift_platform::{ProbeClient, TaskLauncher, WorkloadManager};
use vershift_rollback::RollbackManager;
use vershift_state::{AppStatus, ManagedApp, StatusStore, UpgradePhase, epoch_secs};

use crate::error::MachineResult;

/// What a reconcile invocation wants from the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// Nothing further until external state changes; the next sweep will
    /// look again.
    Done,
    /// Re-invoke for this application after the given duration.
    RequeueAfter(Duration),
}

/// Tuning knobs for the state machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Re-poll interval while a migration task is running.
    pub migration_poll: Duration,
    /// Re-poll interval while waiting for ready replicas.
    pub deploy_poll: Duration,
    /// Requeue delay after a status write conflict.
    pub conflict_retry: Duration,
    /// Gate re-poll fallback when the strategy has no health spec period.
    pub gate_poll: Duration,
    /// Base delay for capped exponential backoff (rollback, cleanup).
    pub backoff_base: Duration,
    /// Backoff cap.
    pub backoff_cap: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            migration_poll: Duration::from_secs(10),
            deploy_poll: Duration::from_secs(5),
            conflict_retry: Duration::from_secs(1),
            gate_poll: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

/// The state machine. One instance serves all applications; invocations
/// for the same application must be serialized by the caller (the runner
/// does this).
pub struct UpgradeMachine<W, T, P>
where
    W: WorkloadManager,
    T: TaskLauncher,
    P: ProbeClient,
{
    store: StatusStore,
    workload: Arc<W>,
    gate: HealthGate<P>,
    migrations: MigrationRunner<T>,
    canary: CanaryController<W, P>,
    rollback: RollbackManager<W, T>,
    config: MachineConfig,
}

impl<W, T, P> UpgradeMachine<W, T, P>
where
    W: WorkloadManager,
    T: TaskLauncher,
    P: ProbeClient,
{
    pub fn new(store: StatusStore, workload: Arc<W>, launcher: Arc<T>, prober: Arc<P>) -> Self {
        Self::with_config(store, workload, launcher, prober, MachineConfig::default())
    }

    pub fn with_config(
        store: StatusStore,
        workload: Arc<W>,
        launcher: Arc<T>,
        prober: Arc<P>,
        config: MachineConfig,
    ) -> Self {
        let gate = HealthGate::new(store.clone(), prober.clone());
        let canary_gate = HealthGate::new(store.clone(), prober);
        Self {
            store,
            workload: workload.clone(),
            gate,
            migrations: MigrationRunner::new(launcher.clone()),
            canary: CanaryController::new(workload.clone(), canary_gate),
            rollback: RollbackManager::new(workload, launcher),
            config,
        }
    }

    /// Drive one application by at most one step.
    pub async fn reconcile(&self, app_id: &str) -> MachineResult<Reconcile> {
        let Some(app) = self.store.get_app(app_id)? else {
            debug!(%app_id, "application gone, nothing to reconcile");
            return Ok(Reconcile::Done);
        };
        let (mut status, revision) = match self.store.read_status(app_id)? {
            Some(pair) => pair,
            None => (AppStatus::new(""), 0),
        };

        if app.deletion_requested {
            return self.cleanup(&app, &mut status, revision).await;
        }

        // Soft-cancel: hold the phase, keep all state.
        if app.paused {
            debug!(%app_id, phase = ?status.phase, "paused, holding phase");
            return Ok(Reconcile::Done);
        }

        if let Err(e) = app.strategy.validate() {
            // Permanent until the spec is edited; write the condition once
            // instead of requeueing the same invalid input forever.
            let already_flagged = status
                .condition("ConfigValid")
                .is_some_and(|c| !c.status);
            if already_flagged {
                return Ok(Reconcile::Done);
            }
            warn!(%app_id, error = %e, "upgrade strategy rejected");
            status.set_condition(
                "ConfigValid",
                false,
                "InvalidCanarySchedule",
                &e.to_string(),
                epoch_secs(),
            );
            return self.commit(app_id, &mut status, revision, Reconcile::Done);
        }
        if let Some(c) = status.condition("ConfigValid")
            && !c.status
        {
            // The spec edit cleared the configuration error.
            status.set_condition(
                "ConfigValid",
                true,
                "Validated",
                "strategy accepted",
                epoch_secs(),
            );
            return self.commit(
                app_id,
                &mut status,
                revision,
                Reconcile::RequeueAfter(Duration::ZERO),
            );
        }

        match status.phase {
            UpgradePhase::Healthy => self.on_healthy(&app, &mut status, revision).await,
            UpgradePhase::Migrating => self.on_migrating(&app, &mut status, revision).await,
            UpgradePhase::Deploying => self.on_deploying(&app, &mut status, revision).await,
            UpgradePhase::HealthChecking => {
                self.on_health_checking(&app, &mut status, revision).await
            }
            UpgradePhase::Canary => self.on_canary(&app, &mut status, revision).await,
            UpgradePhase::Promoting => self.on_promoting(&app, &mut status, revision).await,
            UpgradePhase::Failed => self.on_failed(&app, &mut status, revision).await,
            UpgradePhase::RollingBack => self.on_rolling_back(&app, &mut status, revision).await,
        }
    }

    // ── Phase handlers ─────────────────────────────────────────────

    async fn on_healthy(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();
        if app.target_version == status.current_version {
            return Ok(Reconcile::Done);
        }

        // Fresh cycle: clear any leftover confirmation windows.
        self.gate.reset_app(&app_id)?;
        status.upgrading_to = Some(app.target_version.clone());
        status.retries = 0;
        status.canary_weight = 0;
        status.canary_step = 0;
        status.canary_applied_at = 0;

        if app.strategy.migration().is_some() {
            status.phase = UpgradePhase::Migrating;
            status.set_condition(
                "Progressing",
                true,
                "MigrationPending",
                &format!("migrating data for {}", app.target_version),
                epoch_secs(),
            );
        } else {
            status.phase = UpgradePhase::Deploying;
            status.set_condition(
                "Progressing",
                true,
                "DeployPending",
                &format!("deploying {}", app.target_version),
                epoch_secs(),
            );
        }
        info!(
            %app_id,
            from = %status.current_version,
            to = %app.target_version,
            phase = ?status.phase,
            "upgrade cycle started"
        );
        self.commit(
            &app_id,
            status,
            revision,
            Reconcile::RequeueAfter(Duration::ZERO),
        )
    }

    async fn on_migrating(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();
        let Some(migration) = app.strategy.migration() else {
            // Strategy changed mid-flight; nothing left to migrate.
            status.phase = UpgradePhase::Deploying;
            return self.commit(
                &app_id,
                status,
                revision,
                Reconcile::RequeueAfter(Duration::ZERO),
            );
        };
        let target = self.attempt_version(app, status);

        match self.migrations.ensure(&app_id, migration, &target).await? {
            MigrationOutcome::Started => {
                status.set_condition(
                    "Progressing",
                    true,
                    "MigrationRunning",
                    &format!("migration task running for {target}"),
                    epoch_secs(),
                );
                self.commit(
                    &app_id,
                    status,
                    revision,
                    Reconcile::RequeueAfter(self.config.migration_poll),
                )
            }
            MigrationOutcome::Running => {
                Ok(Reconcile::RequeueAfter(self.config.migration_poll))
            }
            MigrationOutcome::Succeeded => {
                status.phase = UpgradePhase::Deploying;
                status.set_condition(
                    "Progressing",
                    true,
                    "MigrationSucceeded",
                    &format!("migration for {target} completed"),
                    epoch_secs(),
                );
                info!(%app_id, %target, "migration succeeded");
                self.commit(
                    &app_id,
                    status,
                    revision,
                    Reconcile::RequeueAfter(Duration::ZERO),
                )
            }
            MigrationOutcome::Failed(message) => {
                self.declare_failed(app, status, revision, "MigrationFailed", &message)
            }
        }
    }

    async fn on_deploying(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();
        let target = self.attempt_version(app, status);

        // Idempotent by the workload manager's contract.
        self.workload.apply_version(&app.workload, &target).await?;

        let ready = self.workload.ready_replicas(&app.workload).await?;
        if ready == 0 {
            debug!(%app_id, %target, "no ready replicas yet");
            return Ok(Reconcile::RequeueAfter(self.config.deploy_poll));
        }

        status.phase = UpgradePhase::HealthChecking;
        status.set_condition(
            "Progressing",
            true,
            "Deployed",
            &format!("{target} applied, {ready} replica(s) ready"),
            epoch_secs(),
        );
        // The gate anchors initial_delay_secs at its first evaluation;
        // waiting here as well would double the delay.
        self.commit(
            &app_id,
            status,
            revision,
            Reconcile::RequeueAfter(Duration::ZERO),
        )
    }

    async fn on_health_checking(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();
        let Some(health) = app.strategy.health() else {
            // Nothing to confirm.
            return self.proceed_past_health(app, status, revision);
        };

        let key = gate_key(&app_id, "healthcheck", 0);
        match self.gate.evaluate(&key, health, &app.address).await? {
            GateOutcome::Passing => self.proceed_past_health(app, status, revision),
            GateOutcome::Failing => self.declare_failed(
                app,
                status,
                revision,
                "HealthGateFailed",
                "new version failed its health gate",
            ),
            GateOutcome::Pending => Ok(Reconcile::RequeueAfter(Duration::from_secs(
                health.period_secs.max(1),
            ))),
        }
    }

    /// Health gate passed (or absent): enter Canary if the strategy shifts
    /// traffic in steps, otherwise go straight to Promoting.
    fn proceed_past_health(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();
        if app.strategy.canary_steps().is_some() {
            status.phase = UpgradePhase::Canary;
            status.set_condition(
                "Progressing",
                true,
                "CanaryStarted",
                "health gate passed, starting traffic shift",
                epoch_secs(),
            );
        } else {
            status.phase = UpgradePhase::Promoting;
        }
        self.commit(
            &app_id,
            status,
            revision,
            Reconcile::RequeueAfter(Duration::ZERO),
        )
    }

    async fn on_canary(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();
        let health = app.strategy.health();
        let gate_poll = health
            .map(|h| Duration::from_secs(h.period_secs.max(1)))
            .unwrap_or(self.config.gate_poll);

        match self.canary.advance(app, status, health).await? {
            CanaryOutcome::StepApplied { weight } => {
                status.set_condition(
                    "Progressing",
                    true,
                    "CanaryStep",
                    &format!("shifted {weight}% of traffic"),
                    epoch_secs(),
                );
                self.commit(&app_id, status, revision, Reconcile::RequeueAfter(gate_poll))
            }
            CanaryOutcome::AwaitingGate => Ok(Reconcile::RequeueAfter(gate_poll)),
            CanaryOutcome::AwaitingPause { remaining_secs } => Ok(Reconcile::RequeueAfter(
                Duration::from_secs(remaining_secs.max(1)),
            )),
            CanaryOutcome::Advanced { .. } => self.commit(
                &app_id,
                status,
                revision,
                Reconcile::RequeueAfter(Duration::ZERO),
            ),
            CanaryOutcome::Complete => {
                status.phase = UpgradePhase::Promoting;
                self.commit(
                    &app_id,
                    status,
                    revision,
                    Reconcile::RequeueAfter(Duration::ZERO),
                )
            }
            CanaryOutcome::Failed(reason) => {
                self.declare_failed(app, status, revision, "CanaryStepFailed", &reason)
            }
        }
    }

    async fn on_promoting(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();
        let target = self.attempt_version(app, status);

        if app.strategy.migration().is_some() {
            self.migrations.cleanup(&app_id, &target).await?;
        }
        // The new version is the only version now; clear the split.
        self.workload.set_traffic_weight(&app.workload, 0).await?;
        self.gate.reset_app(&app_id)?;

        status.current_version = target.clone();
        status.canary_weight = 0;
        status.canary_step = 0;
        status.canary_applied_at = 0;
        status.upgrading_to = None;
        status.rollback_pending = false;
        status.retries = 0;
        status.phase = UpgradePhase::Healthy;
        status.set_condition(
            "Ready",
            true,
            "Promoted",
            &format!("{target} promoted"),
            epoch_secs(),
        );
        info!(%app_id, version = %target, "version promoted");
        self.commit(&app_id, status, revision, Reconcile::Done)
    }

    async fn on_failed(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();

        if status.rollback_pending {
            status.phase = UpgradePhase::RollingBack;
            status.retries = 0;
            return self.commit(
                &app_id,
                status,
                revision,
                Reconcile::RequeueAfter(Duration::ZERO),
            );
        }

        // A changed target clears the terminal state and lets a fresh
        // cycle start (or rest, if the target now matches current).
        let failed_target = status.upgrading_to.as_deref().unwrap_or("");
        if app.target_version != failed_target {
            info!(%app_id, target = %app.target_version, "new target after failure, resetting");
            status.phase = UpgradePhase::Healthy;
            status.upgrading_to = None;
            return self.commit(
                &app_id,
                status,
                revision,
                Reconcile::RequeueAfter(Duration::ZERO),
            );
        }

        Ok(Reconcile::Done)
    }

    async fn on_rolling_back(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();

        match self.rollback.rollback(app, status).await {
            Ok(()) => {
                let message = format!("restored {}", status.current_version);
                status.rollback_pending = false;
                status.phase = UpgradePhase::Failed;
                status.retries = 0;
                status.set_condition("RolledBack", true, "RollbackComplete", &message, epoch_secs());
                self.gate.reset_app(&app_id)?;
                self.commit(&app_id, status, revision, Reconcile::Done)
            }
            Err(e) => {
                // Retried indefinitely with capped backoff; manual
                // intervention is implied if the cap is hit repeatedly.
                status.retries += 1;
                let delay = backoff(
                    self.config.backoff_base,
                    self.config.backoff_cap,
                    status.retries,
                );
                let message = format!("rollback attempt {} failed: {e}", status.retries);
                warn!(%app_id, error = %e, attempt = status.retries, "rollback failed, backing off");
                status.set_condition("RolledBack", false, "RollbackRetrying", &message, epoch_secs());
                self.commit(&app_id, status, revision, Reconcile::RequeueAfter(delay))
            }
        }
    }

    // ── Pre-delete cleanup ─────────────────────────────────────────

    /// Tear down in-flight artifacts, then let the record disappear.
    async fn cleanup(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();

        match self.teardown_attempt(app, status).await {
            Ok(()) => {
                self.store.delete_gates_for_app(&app_id)?;
                self.store.delete_status(&app_id)?;
                self.store.delete_app(&app_id)?;
                info!(%app_id, "application cleaned up and removed");
                Ok(Reconcile::Done)
            }
            Err(e) => {
                status.retries += 1;
                let delay = backoff(
                    self.config.backoff_base,
                    self.config.backoff_cap,
                    status.retries,
                );
                warn!(%app_id, error = %e, attempt = status.retries, "pre-delete cleanup failed, retrying");
                self.commit(&app_id, status, revision, Reconcile::RequeueAfter(delay))
            }
        }
    }

    async fn teardown_attempt(&self, app: &ManagedApp, status: &AppStatus) -> MachineResult<()> {
        let app_id = app.table_key();
        if let Some(version) = status.upgrading_to.clone() {
            self.migrations.cleanup(&app_id, &version).await?;
        }
        if status.canary_weight > 0 {
            self.workload.set_traffic_weight(&app.workload, 0).await?;
        }
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// The version the current cycle is moving to. Falls back to the spec
    /// target for status written by older cycles.
    fn attempt_version(&self, app: &ManagedApp, status: &AppStatus) -> String {
        status
            .upgrading_to
            .clone()
            .unwrap_or_else(|| app.target_version.clone())
    }

    /// Declare the cycle failed; rollback follows if the strategy wants it.
    fn declare_failed(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        revision: u64,
        reason: &str,
        message: &str,
    ) -> MachineResult<Reconcile> {
        let app_id = app.table_key();
        status.phase = UpgradePhase::Failed;
        status.rollback_pending = app.strategy.rollback_enabled();
        status.retries = 0;
        status.set_condition("Failed", true, reason, message, epoch_secs());
        warn!(%app_id, reason, rollback = status.rollback_pending, "upgrade failed");

        let then = if status.rollback_pending {
            Reconcile::RequeueAfter(Duration::ZERO)
        } else {
            Reconcile::Done
        };
        self.commit(&app_id, status, revision, then)
    }

    /// Write the status under its revision token. A conflict means another
    /// writer landed first: drop this invocation's view and come back soon.
    fn commit(
        &self,
        app_id: &str,
        status: &mut AppStatus,
        revision: u64,
        then: Reconcile,
    ) -> MachineResult<Reconcile> {
        status.updated_at = epoch_secs();
        match self.store.write_status(app_id, status, revision) {
            Ok(_) => Ok(then),
            Err(e) if e.is_conflict() => {
                debug!(%app_id, "status write conflicted, re-reading next pass");
                Ok(Reconcile::RequeueAfter(self.config.conflict_retry))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Capped exponential backoff: base, 2·base, 4·base, … up to cap.
fn backoff(base: Duration, cap: Duration, retries: u32) -> Duration {
    let shift = retries.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}
