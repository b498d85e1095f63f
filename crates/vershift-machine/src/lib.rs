//! vershift-machine — the upgrade state machine.
//!
//! One machine instance serves every managed application; each `reconcile`
//! invocation handles exactly one application and is the only writer of
//! that application's status subtree. Leaf components (migration runner,
//! health gate, canary controller, rollback manager) report outcomes; only
//! the machine turns outcomes into phase transitions.
//!
//! # Re-entrancy
//!
//! Every invocation reads persisted phase/version/weight, performs at most
//! one externally-visible side effect for that phase, and either writes a
//! new status (revision-checked) or requests a bounded future re-invocation.
//! Waiting is always "requeue after D", never a blocking sleep, so the
//! number of in-flight upgrades is not bounded by OS threads.
//!
//! # Components
//!
//! - **`machine`** — phase transition logic and condition management
//! - **`runner`** — poll-driven sweep over all applications with a bounded
//!   worker pool, serialized per application

pub mod error;
pub mod machine;
pub mod runner;

pub use error::{MachineError, MachineResult};
pub use machine::{MachineConfig, Reconcile, UpgradeMachine};
pub use runner::{Runner, RunnerConfig};
