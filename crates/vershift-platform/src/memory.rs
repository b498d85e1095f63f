//! In-process platform backends.
//!
//! Every mutation is recorded, so tests can assert not only final state but
//! how many externally-visible side effects a reconcile pass produced. The
//! daemon's simulation mode runs against the same backends.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::contracts::{
    ProbeClient, ProbeOutcome, TaskCreated, TaskLauncher, TaskState, WorkloadManager,
};
use crate::error::{PlatformError, PlatformResult};

// ── Workloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct WorkloadRecord {
    version: String,
    weight: u32,
    ready: u32,
}

/// In-memory workload manager.
///
/// Applying a version makes `ready_on_apply` replicas ready immediately;
/// tests can override readiness per workload or inject call failures.
#[derive(Default)]
pub struct InMemoryWorkloads {
    records: Mutex<HashMap<String, WorkloadRecord>>,
    apply_log: Mutex<Vec<(String, String)>>,
    weight_log: Mutex<Vec<(String, u32)>>,
    fail_apply: AtomicBool,
    fail_weight: AtomicBool,
    ready_on_apply: AtomicU32,
}

impl InMemoryWorkloads {
    pub fn new() -> Self {
        let workloads = Self::default();
        workloads.ready_on_apply.store(1, Ordering::Relaxed);
        workloads
    }

    /// The version most recently applied to a workload.
    pub fn version_of(&self, workload: &str) -> Option<String> {
        let records = self.records.lock().unwrap();
        records.get(workload).map(|r| r.version.clone())
    }

    /// The traffic weight most recently set for a workload.
    pub fn weight_of(&self, workload: &str) -> Option<u32> {
        let records = self.records.lock().unwrap();
        records.get(workload).map(|r| r.weight)
    }

    /// Every `apply_version` call, in order.
    pub fn apply_log(&self) -> Vec<(String, String)> {
        self.apply_log.lock().unwrap().clone()
    }

    /// Every `set_traffic_weight` call, in order.
    pub fn weight_log(&self) -> Vec<(String, u32)> {
        self.weight_log.lock().unwrap().clone()
    }

    /// Force the ready-replica count for a workload.
    pub fn set_ready(&self, workload: &str, ready: u32) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(workload) {
            record.ready = ready;
        }
    }

    /// Ready replicas reported right after an `apply_version` (default 1;
    /// 0 simulates a slow rollout).
    pub fn set_ready_on_apply(&self, ready: u32) {
        self.ready_on_apply.store(ready, Ordering::Relaxed);
    }

    /// Make subsequent `apply_version` calls fail as unavailable.
    pub fn set_fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent `set_traffic_weight` calls fail as unavailable.
    pub fn set_fail_weight(&self, fail: bool) {
        self.fail_weight.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl WorkloadManager for InMemoryWorkloads {
    async fn apply_version(&self, workload: &str, version: &str) -> PlatformResult<()> {
        if self.fail_apply.load(Ordering::Relaxed) {
            return Err(PlatformError::Unavailable("apply_version refused".into()));
        }
        self.apply_log
            .lock()
            .unwrap()
            .push((workload.to_string(), version.to_string()));
        let ready = self.ready_on_apply.load(Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();
        let record = records.entry(workload.to_string()).or_insert(WorkloadRecord {
            version: String::new(),
            weight: 0,
            ready: 0,
        });
        record.version = version.to_string();
        record.ready = ready;
        debug!(%workload, %version, "version applied");
        Ok(())
    }

    async fn set_traffic_weight(&self, workload: &str, percent: u32) -> PlatformResult<()> {
        if self.fail_weight.load(Ordering::Relaxed) {
            return Err(PlatformError::Unavailable("set_traffic_weight refused".into()));
        }
        if percent > 100 {
            return Err(PlatformError::InvalidRequest(format!(
                "traffic weight {percent} exceeds 100"
            )));
        }
        self.weight_log
            .lock()
            .unwrap()
            .push((workload.to_string(), percent));
        let mut records = self.records.lock().unwrap();
        let record = records.entry(workload.to_string()).or_insert(WorkloadRecord {
            version: String::new(),
            weight: 0,
            ready: 0,
        });
        record.weight = percent;
        debug!(%workload, percent, "traffic weight set");
        Ok(())
    }

    async fn ready_replicas(&self, workload: &str) -> PlatformResult<u32> {
        let records = self.records.lock().unwrap();
        Ok(records.get(workload).map(|r| r.ready).unwrap_or(0))
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct TaskRecord {
    image: String,
    command: Vec<String>,
    state: TaskState,
}

/// In-memory one-shot task launcher.
///
/// Created tasks stay `Pending` until a test (or the simulation driver)
/// completes or fails them.
#[derive(Default)]
pub struct InMemoryTasks {
    records: Mutex<HashMap<String, TaskRecord>>,
    create_calls: AtomicU32,
    created: AtomicU32,
}

impl InMemoryTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a task as succeeded.
    pub fn complete(&self, task_id: &str) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(task_id) {
            record.state = TaskState::Succeeded;
        }
    }

    /// Mark a task as failed with a message.
    pub fn fail(&self, task_id: &str, message: &str) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(task_id) {
            record.state = TaskState::Failed {
                message: message.to_string(),
            };
        }
    }

    /// Ids of all known tasks.
    pub fn task_ids(&self) -> Vec<String> {
        let records = self.records.lock().unwrap();
        records.keys().cloned().collect()
    }

    /// Total `create_task` calls (including ones that found an existing task).
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::Relaxed)
    }

    /// Number of tasks actually created.
    pub fn created(&self) -> u32 {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TaskLauncher for InMemoryTasks {
    async fn create_task(
        &self,
        task_id: &str,
        image: &str,
        command: &[String],
    ) -> PlatformResult<TaskCreated> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();
        if records.contains_key(task_id) {
            return Ok(TaskCreated::AlreadyExists);
        }
        records.insert(
            task_id.to_string(),
            TaskRecord {
                image: image.to_string(),
                command: command.to_vec(),
                state: TaskState::Pending,
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(%task_id, %image, "task created");
        Ok(TaskCreated::Created)
    }

    async fn task_status(&self, task_id: &str) -> PlatformResult<Option<TaskState>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(task_id).map(|r| r.state.clone()))
    }

    async fn delete_task(&self, task_id: &str) -> PlatformResult<()> {
        let mut records = self.records.lock().unwrap();
        if records.remove(task_id).is_some() {
            debug!(%task_id, "task deleted");
        }
        Ok(())
    }
}

// ── Probes ────────────────────────────────────────────────────────

/// Probe client that replays a scripted sequence of outcomes, then repeats
/// a default outcome once the script is exhausted.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeOutcome>>,
    default: ProbeOutcome,
    probes: AtomicU32,
}

impl ScriptedProbe {
    /// A probe that always reports the given outcome.
    pub fn always(outcome: ProbeOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: outcome,
            probes: AtomicU32::new(0),
        }
    }

    /// Queue an outcome to be returned before the default kicks in.
    pub fn push(&self, outcome: ProbeOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Number of probes performed.
    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProbeClient for ScriptedProbe {
    async fn probe(&self, _url: &str, _timeout: Duration) -> ProbeOutcome {
        self.probes.fetch_add(1, Ordering::Relaxed);
        let mut script = self.script.lock().unwrap();
        script.pop_front().unwrap_or(self.default)
    }
}
