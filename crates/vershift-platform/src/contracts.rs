//! The three collaborator contracts consumed by the orchestrator core.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::PlatformResult;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint answered 2xx within the timeout.
    Pass,
    /// Non-2xx, connection error, or timeout.
    Fail,
}

/// Outcome of a task-creation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCreated {
    /// The task did not exist and was created.
    Created,
    /// A task with this id already exists. Not an error: creation is
    /// idempotent per (application, version) pair.
    AlreadyExists,
}

/// Completion state of a one-shot task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Still running (or queued).
    Pending,
    /// Ran to completion successfully.
    Succeeded,
    /// Terminated without success.
    Failed { message: String },
}

/// Lifecycle manager for the deployable workload being upgraded.
#[async_trait]
pub trait WorkloadManager: Send + Sync {
    /// Roll the workload to the given version. Idempotent: re-applying the
    /// version already running is a no-op.
    async fn apply_version(&self, workload: &str, version: &str) -> PlatformResult<()>;

    /// Route `percent` (0–100) of traffic to the version being rolled out.
    /// Zero clears the split.
    async fn set_traffic_weight(&self, workload: &str, percent: u32) -> PlatformResult<()>;

    /// Number of replicas of the most recently applied version that are
    /// ready to serve.
    async fn ready_replicas(&self, workload: &str) -> PlatformResult<u32>;
}

/// Launcher for one-shot tasks (pre-deployment migrations).
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    /// Create a task. Creating an id that already exists reports
    /// [`TaskCreated::AlreadyExists`], not an error.
    async fn create_task(
        &self,
        task_id: &str,
        image: &str,
        command: &[String],
    ) -> PlatformResult<TaskCreated>;

    /// Completion state of a task, or `None` if no such task exists.
    async fn task_status(&self, task_id: &str) -> PlatformResult<Option<TaskState>>;

    /// Delete a task. Deleting an absent task is a no-op.
    async fn delete_task(&self, task_id: &str) -> PlatformResult<()>;
}

/// Transport for a single health probe.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    /// Probe `url`, reporting pass/fail within `timeout`.
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}
