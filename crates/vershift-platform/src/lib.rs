//! vershift-platform — narrow contracts to the hosting platform.
//!
//! The orchestrator never talks to the platform directly; it goes through
//! three small traits, injected at construction:
//!
//! - [`WorkloadManager`] — apply a version, set a traffic-split weight,
//!   report ready replicas.
//! - [`TaskLauncher`] — create/poll/delete one-shot tasks (migrations).
//! - [`ProbeClient`] — perform a single health probe.
//!
//! The [`memory`] module provides in-process implementations with call
//! counters and scriptable outcomes, used by unit tests, the scenario
//! suite, and the daemon's simulation mode.

pub mod contracts;
pub mod error;
pub mod memory;

pub use contracts::{
    ProbeClient, ProbeOutcome, TaskCreated, TaskLauncher, TaskState, WorkloadManager,
};
pub use error::{PlatformError, PlatformResult};
pub use memory::{InMemoryTasks, InMemoryWorkloads, ScriptedProbe};
