//! Domain types for the vershift status store.
//!
//! These types represent the persisted state of managed applications and
//! their upgrade cycles. All types are serializable to/from JSON for storage
//! in redb tables. The `status` subtree is owned exclusively by the upgrade
//! state machine; no other writer touches phase, current version, or canary
//! weight.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a managed application (`{namespace}/{name}`).
pub type AppId = String;

// ── Managed application ───────────────────────────────────────────

/// Specification for an application whose upgrades this orchestrator drives.
///
/// Created and updated by an external actor. A new upgrade cycle begins only
/// when `target_version` differs from `status.current_version` and `paused`
/// is false.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedApp {
    pub namespace: String,
    pub name: String,
    /// Workload id handed to the workload manager for version/traffic calls.
    pub workload: String,
    /// Serving address (`host:port`) probed by the health gate.
    pub address: String,
    /// Version the external actor wants running.
    pub target_version: String,
    /// Soft-cancel: freezes the state machine in its current phase.
    pub paused: bool,
    /// Pre-delete cleanup gate: once set, every invocation tears down
    /// in-flight artifacts until the record can be removed.
    pub deletion_requested: bool,
    /// How upgrades of this application are carried out.
    pub strategy: UpgradeStrategy,
    /// Unix timestamp (seconds) when this spec was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when this spec was last updated.
    pub updated_at: u64,
}

impl ManagedApp {
    /// Build the composite key for the apps table.
    pub fn table_key(&self) -> AppId {
        format!("{}/{}", self.namespace, self.name)
    }
}

// ── Upgrade strategy ──────────────────────────────────────────────

/// How to move an application from one version to the next.
///
/// A closed set of variants, each carrying its own configuration payload.
/// The state machine switches on the variant explicitly; transition logic
/// differs structurally per kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpgradeStrategy {
    /// Apply the new version, health-gate it, promote.
    Rolling(RollingSpec),
    /// Run a one-shot migration task to completion before the new version
    /// is exposed, then proceed as `Rolling`.
    RollingWithMigration(RollingWithMigrationSpec),
    /// Shift traffic through an ordered schedule of weighted steps, gating
    /// each step on health.
    Canary(CanarySpec),
    /// Full cutover: the new version replaces the old outright and is
    /// promoted once its health gate passes; no staged traffic shift.
    BlueGreen(BlueGreenSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollingSpec {
    pub health: Option<HealthCheckSpec>,
    pub rollback_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollingWithMigrationSpec {
    pub migration: MigrationTaskSpec,
    pub health: Option<HealthCheckSpec>,
    pub rollback_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanarySpec {
    /// Ordered traffic-shift schedule. Weights must be non-decreasing and
    /// the final step must carry weight 100. An empty schedule is an
    /// implicit single step of weight 100 with no pause.
    pub steps: Vec<CanaryStep>,
    pub migration: Option<MigrationTaskSpec>,
    pub health: Option<HealthCheckSpec>,
    pub rollback_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlueGreenSpec {
    pub health: Option<HealthCheckSpec>,
    pub rollback_on_failure: bool,
}

/// One step of a canary traffic-shift schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanaryStep {
    /// Percentage of traffic routed to the new version (1–100).
    pub weight: u32,
    /// Seconds to hold this weight after its health gate passes.
    pub pause_secs: u64,
}

/// Image/command for the pre-deployment one-shot migration task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationTaskSpec {
    pub image: String,
    pub command: Vec<String>,
}

/// Health gate parameters for probing a running version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSpec {
    /// HTTP path to probe (e.g., "/healthz").
    pub endpoint: String,
    /// Seconds to wait before the first probe.
    pub initial_delay_secs: u64,
    /// Seconds between probes.
    pub period_secs: u64,
    /// Timeout per probe, in seconds.
    pub timeout_secs: u64,
    /// Consecutive passing probes required before the gate passes.
    pub success_threshold: u32,
    /// Consecutive failing probes required before the gate fails.
    pub failure_threshold: u32,
}

/// Violations of the canary step-sequence invariant.
///
/// Detected before any step executes, never partially.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    #[error("canary step {index} weight {weight} outside 1..=100")]
    WeightOutOfRange { index: usize, weight: u32 },

    #[error("canary step {index} weight {weight} decreases from {prev}")]
    DecreasingWeights {
        index: usize,
        prev: u32,
        weight: u32,
    },

    #[error("final canary step weight is {weight}, must be 100")]
    FinalWeightNot100 { weight: u32 },
}

impl UpgradeStrategy {
    /// The migration task to run before deploying, if any.
    pub fn migration(&self) -> Option<&MigrationTaskSpec> {
        match self {
            UpgradeStrategy::Rolling(_) | UpgradeStrategy::BlueGreen(_) => None,
            UpgradeStrategy::RollingWithMigration(s) => Some(&s.migration),
            UpgradeStrategy::Canary(s) => s.migration.as_ref(),
        }
    }

    /// The health gate configuration, if any.
    pub fn health(&self) -> Option<&HealthCheckSpec> {
        match self {
            UpgradeStrategy::Rolling(s) => s.health.as_ref(),
            UpgradeStrategy::RollingWithMigration(s) => s.health.as_ref(),
            UpgradeStrategy::Canary(s) => s.health.as_ref(),
            UpgradeStrategy::BlueGreen(s) => s.health.as_ref(),
        }
    }

    /// The canary schedule, if this strategy shifts traffic in steps.
    pub fn canary_steps(&self) -> Option<&[CanaryStep]> {
        match self {
            UpgradeStrategy::Canary(s) => Some(&s.steps),
            _ => None,
        }
    }

    /// Whether a failed upgrade attempt should be rolled back.
    pub fn rollback_enabled(&self) -> bool {
        match self {
            UpgradeStrategy::Rolling(s) => s.rollback_on_failure,
            UpgradeStrategy::RollingWithMigration(s) => s.rollback_on_failure,
            UpgradeStrategy::Canary(s) => s.rollback_on_failure,
            UpgradeStrategy::BlueGreen(s) => s.rollback_on_failure,
        }
    }

    /// Check the canary step-sequence invariant: weights non-decreasing,
    /// final weight exactly 100. Non-canary strategies always validate.
    pub fn validate(&self) -> Result<(), StrategyError> {
        let Some(steps) = self.canary_steps() else {
            return Ok(());
        };
        let mut prev = 0u32;
        for (index, step) in steps.iter().enumerate() {
            if step.weight == 0 || step.weight > 100 {
                return Err(StrategyError::WeightOutOfRange {
                    index,
                    weight: step.weight,
                });
            }
            if step.weight < prev {
                return Err(StrategyError::DecreasingWeights {
                    index,
                    prev,
                    weight: step.weight,
                });
            }
            prev = step.weight;
        }
        if let Some(last) = steps.last()
            && last.weight != 100
        {
            return Err(StrategyError::FinalWeightNot100 {
                weight: last.weight,
            });
        }
        Ok(())
    }
}

// ── Upgrade status ────────────────────────────────────────────────

/// The orchestrator's discrete stage for one managed application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePhase {
    /// No upgrade in flight; `current_version` is fully promoted.
    Healthy,
    /// Waiting on the pre-deployment migration task.
    Migrating,
    /// New version applied to the workload; waiting for ready replicas.
    Deploying,
    /// Confirming the new version against the health gate.
    HealthChecking,
    /// Driving the weighted traffic-shift schedule.
    Canary,
    /// Marking the new version as current and clearing rollout artifacts.
    Promoting,
    /// Upgrade cycle aborted. Terminal until a new target version appears.
    Failed,
    /// Restoring the last promoted version after a failure.
    RollingBack,
}

impl UpgradePhase {
    /// Whether the machine rests in this phase with no cycle in flight.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpgradePhase::Healthy | UpgradePhase::Failed)
    }
}

/// Observed upgrade state for one managed application.
///
/// All cross-invocation state of the state machine lives here; no invocation
/// assumes a previous invocation's in-memory state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppStatus {
    pub phase: UpgradePhase,
    /// Last version fully promoted. Rollback never changes this.
    pub current_version: String,
    /// Traffic percentage currently routed to the new version (0–100).
    pub canary_weight: u32,
    /// Index into the canary schedule. Explicit so repeated weights in a
    /// valid non-decreasing sequence stay unambiguous.
    pub canary_step: u32,
    /// Unix timestamp when the current step's weight was applied; pause
    /// windows are measured from here instead of blocking a worker.
    pub canary_applied_at: u64,
    /// Version the in-flight (or failed) cycle is moving to.
    pub upgrading_to: Option<String>,
    /// Set when a failure was declared and the strategy wants rollback;
    /// cleared once rollback completes.
    pub rollback_pending: bool,
    /// Consecutive transient-failure count for the current phase, drives
    /// capped exponential backoff.
    pub retries: u32,
    /// Ordered observations; the latest condition whose type matches the
    /// current phase is authoritative.
    pub conditions: Vec<Condition>,
    /// Unix timestamp of last status change.
    pub updated_at: u64,
}

impl AppStatus {
    /// Fresh status for an application whose promoted version is `current`.
    pub fn new(current_version: &str) -> Self {
        Self {
            phase: UpgradePhase::Healthy,
            current_version: current_version.to_string(),
            canary_weight: 0,
            canary_step: 0,
            canary_applied_at: 0,
            upgrading_to: None,
            rollback_pending: false,
            retries: 0,
            conditions: Vec::new(),
            updated_at: 0,
        }
    }

    /// Insert or replace the condition of the given type, keeping order of
    /// first appearance.
    pub fn set_condition(
        &mut self,
        ctype: &str,
        status: bool,
        reason: &str,
        message: &str,
        now: u64,
    ) {
        let condition = Condition {
            ctype: ctype.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: now,
        };
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.ctype == ctype) {
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// The condition of the given type, if recorded.
    pub fn condition(&self, ctype: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.ctype == ctype)
    }
}

/// One observation about an application's upgrade state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Condition type (e.g., "Ready", "ConfigValid", "RolledBack").
    pub ctype: String,
    /// Truth value of the condition.
    pub status: bool,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
    /// Unix timestamp when this condition was last set.
    pub timestamp: u64,
}

// ── Health-gate bookkeeping ───────────────────────────────────────

/// Persisted consecutive-count state for one health-gate confirmation
/// window, keyed by `{app_id}:{phase}:{step}`.
///
/// Surviving restarts matters: a restart may conservatively reset an
/// almost-complete window, but it must never lose a genuine failure signal
/// or assume passes it did not observe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GateRecord {
    /// Consecutive passing probes.
    pub passes: u32,
    /// Consecutive failing probes.
    pub fails: u32,
    /// Unix timestamp when this window opened (initial delay anchor).
    pub started_at: u64,
    /// Unix timestamp of the most recent probe.
    pub last_probe_at: u64,
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canary(steps: Vec<CanaryStep>) -> UpgradeStrategy {
        UpgradeStrategy::Canary(CanarySpec {
            steps,
            migration: None,
            health: None,
            rollback_on_failure: true,
        })
    }

    fn step(weight: u32, pause_secs: u64) -> CanaryStep {
        CanaryStep { weight, pause_secs }
    }

    #[test]
    fn valid_canary_sequence() {
        let strategy = canary(vec![step(10, 60), step(50, 60), step(100, 0)]);
        assert!(strategy.validate().is_ok());
    }

    #[test]
    fn repeated_weights_are_valid() {
        let strategy = canary(vec![step(50, 10), step(50, 10), step(100, 0)]);
        assert!(strategy.validate().is_ok());
    }

    #[test]
    fn empty_canary_sequence_is_valid() {
        // Empty schedule means an implicit full cutover.
        assert!(canary(vec![]).validate().is_ok());
    }

    #[test]
    fn decreasing_weights_rejected() {
        let strategy = canary(vec![step(50, 0), step(10, 0), step(100, 0)]);
        assert_eq!(
            strategy.validate(),
            Err(StrategyError::DecreasingWeights {
                index: 1,
                prev: 50,
                weight: 10
            })
        );
    }

    #[test]
    fn final_weight_must_be_100() {
        let strategy = canary(vec![step(10, 0), step(50, 0)]);
        assert_eq!(
            strategy.validate(),
            Err(StrategyError::FinalWeightNot100 { weight: 50 })
        );
    }

    #[test]
    fn zero_and_overweight_steps_rejected() {
        assert!(matches!(
            canary(vec![step(0, 0), step(100, 0)]).validate(),
            Err(StrategyError::WeightOutOfRange { index: 0, .. })
        ));
        assert!(matches!(
            canary(vec![step(101, 0)]).validate(),
            Err(StrategyError::WeightOutOfRange { index: 0, .. })
        ));
    }

    #[test]
    fn non_canary_strategies_always_validate() {
        let rolling = UpgradeStrategy::Rolling(RollingSpec {
            health: None,
            rollback_on_failure: false,
        });
        assert!(rolling.validate().is_ok());
        assert!(rolling.canary_steps().is_none());
        assert!(rolling.migration().is_none());
    }

    #[test]
    fn strategy_accessors() {
        let migration = MigrationTaskSpec {
            image: "registry/migrate:v2".to_string(),
            command: vec!["./migrate".to_string()],
        };
        let strategy = UpgradeStrategy::RollingWithMigration(RollingWithMigrationSpec {
            migration: migration.clone(),
            health: None,
            rollback_on_failure: true,
        });
        assert_eq!(strategy.migration(), Some(&migration));
        assert!(strategy.rollback_enabled());
    }

    #[test]
    fn strategy_serializes_roundtrip() {
        let strategy = canary(vec![step(10, 60), step(100, 0)]);
        let json = serde_json::to_string(&strategy).unwrap();
        assert!(json.contains("\"type\":\"canary\""));
        let back: UpgradeStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, strategy);
    }

    #[test]
    fn set_condition_upserts_by_type() {
        let mut status = AppStatus::new("v1");
        status.set_condition("Ready", true, "Promoted", "running v1", 1000);
        status.set_condition("ConfigValid", true, "Validated", "ok", 1000);
        status.set_condition("Ready", false, "Upgrading", "moving to v2", 2000);

        assert_eq!(status.conditions.len(), 2);
        let ready = status.condition("Ready").unwrap();
        assert!(!ready.status);
        assert_eq!(ready.reason, "Upgrading");
        assert_eq!(ready.timestamp, 2000);
        // Order of first appearance is kept.
        assert_eq!(status.conditions[0].ctype, "Ready");
    }

    #[test]
    fn phase_terminality() {
        assert!(UpgradePhase::Healthy.is_terminal());
        assert!(UpgradePhase::Failed.is_terminal());
        assert!(!UpgradePhase::Canary.is_terminal());
        assert!(!UpgradePhase::RollingBack.is_terminal());
    }
}
