//! vershift-rollback — undoing a failed upgrade attempt.
//!
//! Rollback restores the workload to the last promoted version and tears
//! down everything the failed attempt created: the migration task and the
//! canary traffic split. It never touches `current_version` — the failed
//! attempt never promoted, so there is nothing to rewrite there.
//!
//! A failed restore call is an error for the caller to retry with capped
//! backoff, not a silent success.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use vershift_migrate::{MigrateError, MigrationRunner};
use vershift_platform::{PlatformError, TaskLauncher, WorkloadManager};
use vershift_state::{AppStatus, ManagedApp};

/// Result type alias for rollback operations.
pub type RollbackResult<T> = Result<T, RollbackError>;

/// Errors that can occur during rollback.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("restoring workload version: {0}")]
    Restore(PlatformError),

    #[error("clearing traffic split: {0}")]
    TrafficClear(PlatformError),

    #[error(transparent)]
    Migration(#[from] MigrateError),
}

/// Restores the last known-good version and clears in-progress rollout
/// artifacts.
pub struct RollbackManager<W: WorkloadManager, T: TaskLauncher> {
    workload: Arc<W>,
    migrations: MigrationRunner<T>,
}

impl<W: WorkloadManager, T: TaskLauncher> RollbackManager<W, T> {
    pub fn new(workload: Arc<W>, launcher: Arc<T>) -> Self {
        Self {
            workload,
            migrations: MigrationRunner::new(launcher),
        }
    }

    /// Undo the in-flight attempt recorded in `status`.
    ///
    /// On success the traffic split is cleared, the attempt's migration
    /// task is gone, and `canary_weight`/`canary_step` are zeroed. On error
    /// the caller stays in its rollback phase and retries later.
    pub async fn rollback(&self, app: &ManagedApp, status: &mut AppStatus) -> RollbackResult<()> {
        let app_id = app.table_key();

        // Restore first: routing traffic back to a version that is not
        // running would make the outage worse.
        if status.current_version.is_empty() {
            // Nothing was ever promoted; there is no version to restore.
            warn!(%app_id, "rollback with no promoted version, tearing down artifacts only");
        } else {
            self.workload
                .apply_version(&app.workload, &status.current_version)
                .await
                .map_err(RollbackError::Restore)?;
        }

        self.workload
            .set_traffic_weight(&app.workload, 0)
            .await
            .map_err(RollbackError::TrafficClear)?;

        if let Some(version) = status.upgrading_to.clone() {
            self.migrations.cleanup(&app_id, &version).await?;
        }

        status.canary_weight = 0;
        status.canary_step = 0;
        status.canary_applied_at = 0;

        info!(
            %app_id,
            restored = %status.current_version,
            "rollback completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vershift_migrate::task_id;
    use vershift_platform::{InMemoryTasks, InMemoryWorkloads};
    use vershift_state::{RollingSpec, UpgradeStrategy};

    fn app() -> ManagedApp {
        ManagedApp {
            namespace: "default".to_string(),
            name: "shop".to_string(),
            workload: "default-shop".to_string(),
            address: "10.0.0.5:8080".to_string(),
            target_version: "v2".to_string(),
            paused: false,
            deletion_requested: false,
            strategy: UpgradeStrategy::Rolling(RollingSpec {
                health: None,
                rollback_on_failure: true,
            }),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn failed_attempt_status() -> AppStatus {
        let mut status = AppStatus::new("v1");
        status.canary_weight = 50;
        status.canary_step = 1;
        status.canary_applied_at = 900;
        status.upgrading_to = Some("v2".to_string());
        status
    }

    #[tokio::test]
    async fn restores_version_and_clears_artifacts() {
        let workloads = Arc::new(InMemoryWorkloads::new());
        let tasks = Arc::new(InMemoryTasks::new());
        tasks
            .create_task(&task_id("default/shop", "v2"), "img", &[])
            .await
            .unwrap();

        let manager = RollbackManager::new(workloads.clone(), tasks.clone());
        let mut status = failed_attempt_status();

        manager.rollback(&app(), &mut status).await.unwrap();

        assert_eq!(workloads.version_of("default-shop"), Some("v1".to_string()));
        assert_eq!(workloads.weight_of("default-shop"), Some(0));
        assert!(tasks.task_ids().is_empty());
        assert_eq!(status.canary_weight, 0);
        assert_eq!(status.canary_step, 0);
        // The promoted version is untouched.
        assert_eq!(status.current_version, "v1");
    }

    #[tokio::test]
    async fn restore_failure_leaves_artifacts_for_retry() {
        let workloads = Arc::new(InMemoryWorkloads::new());
        let tasks = Arc::new(InMemoryTasks::new());
        workloads.set_fail_apply(true);

        let manager = RollbackManager::new(workloads.clone(), tasks);
        let mut status = failed_attempt_status();

        let err = manager.rollback(&app(), &mut status).await.unwrap_err();
        assert!(matches!(err, RollbackError::Restore(_)));
        // Weight untouched: the attempt is still live until restore works.
        assert_eq!(status.canary_weight, 50);
    }

    #[tokio::test]
    async fn no_promoted_version_only_tears_down() {
        let workloads = Arc::new(InMemoryWorkloads::new());
        let tasks = Arc::new(InMemoryTasks::new());
        let manager = RollbackManager::new(workloads.clone(), tasks);

        let mut status = failed_attempt_status();
        status.current_version = String::new();

        manager.rollback(&app(), &mut status).await.unwrap();
        // No apply_version call was made.
        assert!(workloads.apply_log().is_empty());
        assert_eq!(workloads.weight_of("default-shop"), Some(0));
        assert_eq!(status.canary_weight, 0);
    }
}
