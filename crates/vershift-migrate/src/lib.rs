//! vershift-migrate — the migration task runner.
//!
//! A migration is a one-shot task that must run to completion exactly once
//! per (application, version) pair before the new version is exposed. The
//! task id is derived deterministically from that pair, so repeated `ensure`
//! calls across process restarts converge on the same task instead of
//! launching duplicates.
//!
//! The runner never mutates persisted phase; it reports an outcome and the
//! state machine decides what to do with it.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use vershift_platform::{PlatformError, TaskCreated, TaskLauncher, TaskState};
use vershift_state::MigrationTaskSpec;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Errors that can occur while driving a migration task.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("task launcher error: {0}")]
    Launcher(#[from] PlatformError),
}

/// Outcome of one `ensure` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No task existed; one was created this call.
    Started,
    /// The task exists and has not completed; re-poll later.
    Running,
    /// The task completed successfully.
    Succeeded,
    /// The task failed; the message comes from the task's own report.
    Failed(String),
}

/// Deterministic task id for an (application, version) pair.
///
/// The app name keeps ids readable; the hash suffix keeps them unique and
/// free of characters the launcher might reject.
pub fn task_id(app_id: &str, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(app_id.as_bytes());
    hasher.update(b"|");
    hasher.update(version.as_bytes());
    let digest = hasher.finalize();
    let short = app_id.rsplit('/').next().unwrap_or(app_id);
    format!("migrate-{short}-{}", &hex::encode(digest)[..8])
}

/// Drives one-shot migration tasks through a [`TaskLauncher`].
pub struct MigrationRunner<T: TaskLauncher> {
    launcher: Arc<T>,
}

impl<T: TaskLauncher> MigrationRunner<T> {
    pub fn new(launcher: Arc<T>) -> Self {
        Self { launcher }
    }

    /// Ensure the migration task for `(app_id, version)` exists and report
    /// its state.
    ///
    /// Creation is idempotent: observing an already-existing task is
    /// success-of-call, and the existing task's state is what counts.
    pub async fn ensure(
        &self,
        app_id: &str,
        spec: &MigrationTaskSpec,
        version: &str,
    ) -> MigrateResult<MigrationOutcome> {
        let id = task_id(app_id, version);

        match self.launcher.task_status(&id).await? {
            None => {
                let created = self
                    .launcher
                    .create_task(&id, &spec.image, &spec.command)
                    .await?;
                match created {
                    TaskCreated::Created => {
                        info!(%app_id, %version, task = %id, "migration task launched");
                        Ok(MigrationOutcome::Started)
                    }
                    // Raced with another creation of the same task.
                    TaskCreated::AlreadyExists => Ok(MigrationOutcome::Running),
                }
            }
            Some(TaskState::Pending) => {
                debug!(%app_id, task = %id, "migration task still running");
                Ok(MigrationOutcome::Running)
            }
            Some(TaskState::Succeeded) => Ok(MigrationOutcome::Succeeded),
            Some(TaskState::Failed { message }) => Ok(MigrationOutcome::Failed(message)),
        }
    }

    /// Delete the migration task for `(app_id, version)`, tolerating absence.
    pub async fn cleanup(&self, app_id: &str, version: &str) -> MigrateResult<()> {
        let id = task_id(app_id, version);
        self.launcher.delete_task(&id).await?;
        debug!(%app_id, %version, task = %id, "migration task cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vershift_platform::InMemoryTasks;

    fn migration_spec() -> MigrationTaskSpec {
        MigrationTaskSpec {
            image: "registry/shop-migrate:v2".to_string(),
            command: vec!["./migrate".to_string(), "--up".to_string()],
        }
    }

    #[test]
    fn task_id_is_deterministic() {
        let a = task_id("default/shop", "v2");
        let b = task_id("default/shop", "v2");
        assert_eq!(a, b);
        assert!(a.starts_with("migrate-shop-"));
    }

    #[test]
    fn task_id_varies_by_app_and_version() {
        let base = task_id("default/shop", "v2");
        assert_ne!(base, task_id("default/shop", "v3"));
        assert_ne!(base, task_id("prod/shop", "v2"));
    }

    #[tokio::test]
    async fn first_ensure_creates_and_starts() {
        let tasks = Arc::new(InMemoryTasks::new());
        let runner = MigrationRunner::new(tasks.clone());

        let outcome = runner
            .ensure("default/shop", &migration_spec(), "v2")
            .await
            .unwrap();
        assert_eq!(outcome, MigrationOutcome::Started);
        assert_eq!(tasks.created(), 1);
    }

    #[tokio::test]
    async fn repeated_ensure_does_not_duplicate() {
        let tasks = Arc::new(InMemoryTasks::new());
        let runner = MigrationRunner::new(tasks.clone());
        let spec = migration_spec();

        runner.ensure("default/shop", &spec, "v2").await.unwrap();
        let outcome = runner.ensure("default/shop", &spec, "v2").await.unwrap();
        let outcome_again = runner.ensure("default/shop", &spec, "v2").await.unwrap();

        assert_eq!(outcome, MigrationOutcome::Running);
        assert_eq!(outcome_again, MigrationOutcome::Running);
        assert_eq!(tasks.created(), 1);
    }

    #[tokio::test]
    async fn ensure_reports_success() {
        let tasks = Arc::new(InMemoryTasks::new());
        let runner = MigrationRunner::new(tasks.clone());
        let spec = migration_spec();

        runner.ensure("default/shop", &spec, "v2").await.unwrap();
        tasks.complete(&task_id("default/shop", "v2"));

        let outcome = runner.ensure("default/shop", &spec, "v2").await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Succeeded);
    }

    #[tokio::test]
    async fn ensure_reports_failure_with_message() {
        let tasks = Arc::new(InMemoryTasks::new());
        let runner = MigrationRunner::new(tasks.clone());
        let spec = migration_spec();

        runner.ensure("default/shop", &spec, "v2").await.unwrap();
        tasks.fail(&task_id("default/shop", "v2"), "schema lock timeout");

        let outcome = runner.ensure("default/shop", &spec, "v2").await.unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Failed("schema lock timeout".to_string())
        );
    }

    #[tokio::test]
    async fn cleanup_deletes_and_tolerates_absence() {
        let tasks = Arc::new(InMemoryTasks::new());
        let runner = MigrationRunner::new(tasks.clone());

        runner
            .ensure("default/shop", &migration_spec(), "v2")
            .await
            .unwrap();
        runner.cleanup("default/shop", "v2").await.unwrap();
        assert!(tasks.task_ids().is_empty());

        // Absent task: still fine.
        runner.cleanup("default/shop", "v2").await.unwrap();
    }

    #[tokio::test]
    async fn versions_get_separate_tasks() {
        let tasks = Arc::new(InMemoryTasks::new());
        let runner = MigrationRunner::new(tasks.clone());
        let spec = migration_spec();

        runner.ensure("default/shop", &spec, "v2").await.unwrap();
        runner.ensure("default/shop", &spec, "v3").await.unwrap();
        assert_eq!(tasks.created(), 2);
    }
}
