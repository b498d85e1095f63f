//! Canary controller — drives one application through its traffic-shift
//! schedule.
//!
//! The controller mutates only the in-memory status handed to it; the
//! state machine persists the result and owns the phase. Position in the
//! schedule is the explicit `canary_step` index, so repeated weights in a
//! valid non-decreasing sequence stay unambiguous.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use vershift_health::{GateError, GateOutcome, HealthGate, gate_key};
use vershift_platform::{PlatformError, ProbeClient, WorkloadManager};
use vershift_state::{AppStatus, HealthCheckSpec, ManagedApp, epoch_secs};

use crate::schedule::normalize;

/// Result type alias for canary operations.
pub type CanaryResult<T> = Result<T, CanaryError>;

/// Errors that can occur while advancing a canary.
#[derive(Debug, Error)]
pub enum CanaryError {
    #[error("workload manager error: {0}")]
    Workload(#[from] PlatformError),

    #[error(transparent)]
    Gate(#[from] GateError),
}

/// Outcome of one `advance` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanaryOutcome {
    /// This call applied the current step's weight to the traffic split.
    StepApplied { weight: u32 },
    /// The current step's health gate has not decided yet.
    AwaitingGate,
    /// Gate passed; the step's pause window is still running.
    AwaitingPause { remaining_secs: u64 },
    /// Gate passed and pause elapsed; moved to the next step. The next
    /// invocation applies its weight.
    Advanced { step: u32 },
    /// The final (weight-100) step passed its gate.
    Complete,
    /// A step's health gate failed; remaining steps are abandoned. The
    /// weight is left where it failed until rollback resets it.
    Failed(String),
}

/// Drives the weighted traffic-shift schedule, calling the health gate
/// between steps.
pub struct CanaryController<W: WorkloadManager, P: ProbeClient> {
    workload: Arc<W>,
    gate: HealthGate<P>,
}

impl<W: WorkloadManager, P: ProbeClient> CanaryController<W, P> {
    pub fn new(workload: Arc<W>, gate: HealthGate<P>) -> Self {
        Self { workload, gate }
    }

    /// Advance the canary by at most one externally-visible side effect.
    pub async fn advance(
        &self,
        app: &ManagedApp,
        status: &mut AppStatus,
        health: Option<&HealthCheckSpec>,
    ) -> CanaryResult<CanaryOutcome> {
        let app_id = app.table_key();
        let steps = normalize(app.strategy.canary_steps().unwrap_or(&[]));

        let index = status.canary_step as usize;
        let Some(step) = steps.get(index).copied() else {
            // Index past the schedule: a shrunken spec mid-flight. Treat
            // the schedule as finished rather than panic.
            warn!(%app_id, index, len = steps.len(), "canary index past schedule");
            return Ok(CanaryOutcome::Complete);
        };
        let last = index == steps.len() - 1;

        // Apply the step's weight first; gating starts on the next call.
        if status.canary_weight != step.weight {
            self.workload
                .set_traffic_weight(&app.workload, step.weight)
                .await?;
            status.canary_weight = step.weight;
            status.canary_applied_at = epoch_secs();
            info!(%app_id, step = index, weight = step.weight, "canary weight applied");
            return Ok(CanaryOutcome::StepApplied {
                weight: step.weight,
            });
        }

        // Gate the step. No health spec means nothing to confirm.
        let gate_verdict = match health {
            Some(spec) => {
                self.gate
                    .evaluate(&gate_key(&app_id, "canary", index as u32), spec, &app.address)
                    .await?
            }
            None => GateOutcome::Passing,
        };

        match gate_verdict {
            GateOutcome::Failing => {
                // A failure mid-pause counts the same as one after it.
                let reason = format!(
                    "canary step {index} (weight {}) failed its health gate",
                    step.weight
                );
                warn!(%app_id, step = index, "canary aborted");
                Ok(CanaryOutcome::Failed(reason))
            }
            GateOutcome::Pending => Ok(CanaryOutcome::AwaitingGate),
            GateOutcome::Passing if last => {
                info!(%app_id, "canary schedule complete");
                Ok(CanaryOutcome::Complete)
            }
            GateOutcome::Passing => {
                let now = epoch_secs();
                let pause_until = status.canary_applied_at + step.pause_secs;
                if now < pause_until {
                    return Ok(CanaryOutcome::AwaitingPause {
                        remaining_secs: pause_until - now,
                    });
                }
                status.canary_step += 1;
                // Anchor the next step's pause at the moment we advanced,
                // covering repeated weights where no application happens.
                status.canary_applied_at = now;
                debug!(%app_id, step = status.canary_step, "canary advanced");
                Ok(CanaryOutcome::Advanced {
                    step: status.canary_step,
                })
            }
        }
    }
}
