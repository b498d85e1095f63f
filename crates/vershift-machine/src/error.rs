//! Upgrade state machine error types.

use thiserror::Error;

use vershift_canary::CanaryError;
use vershift_health::GateError;
use vershift_migrate::MigrateError;
use vershift_platform::PlatformError;
use vershift_state::StateError;

/// Result type alias for state machine operations.
pub type MachineResult<T> = Result<T, MachineError>;

/// Errors that escape a reconcile invocation.
///
/// These are transient by construction: configuration problems become
/// conditions, execution failures become the `Failed` phase, and status
/// write conflicts become short requeues — none of them surface here.
/// The runner logs an escaped error and retries the application later.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("status store error: {0}")]
    State(#[from] StateError),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("health gate error: {0}")]
    Gate(#[from] GateError),

    #[error("migration runner error: {0}")]
    Migrate(#[from] MigrateError),

    #[error("canary controller error: {0}")]
    Canary(#[from] CanaryError),
}
