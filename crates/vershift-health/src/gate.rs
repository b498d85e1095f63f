//! Confirmation-window logic over persisted probe bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use vershift_platform::{ProbeClient, ProbeOutcome};
use vershift_state::{GateRecord, HealthCheckSpec, StateError, StatusStore, epoch_secs};

/// Result type alias for gate operations.
pub type GateResult<T> = Result<T, GateError>;

/// Errors that can occur while evaluating a gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("gate bookkeeping error: {0}")]
    State(#[from] StateError),
}

/// Verdict of one gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// `success_threshold` consecutive passes observed.
    Passing,
    /// `failure_threshold` consecutive fails observed.
    Failing,
    /// Window not yet decided; the caller reschedules.
    Pending,
}

/// Key for one confirmation window: application + phase + step.
pub fn gate_key(app_id: &str, phase: &str, step: u32) -> String {
    format!("{app_id}:{phase}:{step}")
}

/// The health gate.
///
/// Stateless between calls except for the persisted [`GateRecord`]; a
/// restarted process resumes the same window from the store.
pub struct HealthGate<P: ProbeClient> {
    store: StatusStore,
    prober: Arc<P>,
}

impl<P: ProbeClient> HealthGate<P> {
    pub fn new(store: StatusStore, prober: Arc<P>) -> Self {
        Self { store, prober }
    }

    /// Evaluate the window identified by `key` against `address`.
    ///
    /// Honors `initial_delay_secs` before the first probe and
    /// `period_secs` between probes; at most one probe per call. Once a
    /// verdict is reached it latches until [`reset`](Self::reset).
    pub async fn evaluate(
        &self,
        key: &str,
        spec: &HealthCheckSpec,
        address: &str,
    ) -> GateResult<GateOutcome> {
        let now = epoch_secs();
        let mut record = match self.store.get_gate(key)? {
            Some(record) => record,
            None => {
                // First sight of this window: anchor the initial delay.
                let record = GateRecord {
                    passes: 0,
                    fails: 0,
                    started_at: now,
                    last_probe_at: 0,
                };
                self.store.put_gate(key, &record)?;
                record
            }
        };

        // A reached verdict stands until the window is reset.
        if let Some(verdict) = verdict(&record, spec) {
            return Ok(verdict);
        }

        if now < record.started_at + spec.initial_delay_secs {
            return Ok(GateOutcome::Pending);
        }
        if record.last_probe_at != 0 && now < record.last_probe_at + spec.period_secs {
            return Ok(GateOutcome::Pending);
        }

        let url = format!("http://{address}{}", spec.endpoint);
        let outcome = self
            .prober
            .probe(&url, Duration::from_secs(spec.timeout_secs))
            .await;

        match outcome {
            ProbeOutcome::Pass => {
                record.passes += 1;
                record.fails = 0;
            }
            ProbeOutcome::Fail => {
                record.fails += 1;
                record.passes = 0;
            }
        }
        record.last_probe_at = now;
        self.store.put_gate(key, &record)?;

        debug!(
            %key,
            passes = record.passes,
            fails = record.fails,
            ?outcome,
            "gate probe recorded"
        );

        match verdict(&record, spec) {
            Some(GateOutcome::Failing) => {
                warn!(%key, fails = record.fails, "health gate failed");
                Ok(GateOutcome::Failing)
            }
            Some(v) => Ok(v),
            None => Ok(GateOutcome::Pending),
        }
    }

    /// Clear one confirmation window.
    pub fn reset(&self, key: &str) -> GateResult<()> {
        self.store.delete_gate(key)?;
        Ok(())
    }

    /// Clear every confirmation window for an application.
    pub fn reset_app(&self, app_id: &str) -> GateResult<()> {
        let deleted = self.store.delete_gates_for_app(app_id)?;
        debug!(%app_id, deleted, "gate windows cleared");
        Ok(())
    }
}

/// The verdict implied by the current counts, if any.
fn verdict(record: &GateRecord, spec: &HealthCheckSpec) -> Option<GateOutcome> {
    if record.fails >= spec.failure_threshold {
        Some(GateOutcome::Failing)
    } else if record.passes >= spec.success_threshold {
        Some(GateOutcome::Passing)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vershift_platform::ScriptedProbe;

    fn spec(success: u32, failure: u32) -> HealthCheckSpec {
        HealthCheckSpec {
            endpoint: "/healthz".to_string(),
            initial_delay_secs: 0,
            period_secs: 0,
            timeout_secs: 1,
            success_threshold: success,
            failure_threshold: failure,
        }
    }

    fn gate(probe: Arc<ScriptedProbe>) -> (HealthGate<ScriptedProbe>, StatusStore) {
        let store = StatusStore::open_in_memory().unwrap();
        (HealthGate::new(store.clone(), probe), store)
    }

    #[tokio::test]
    async fn passes_after_success_threshold() {
        let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Pass));
        let (gate, _) = gate(probe.clone());
        let spec = spec(3, 3);

        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Pending);
        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Pending);
        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Passing);
        assert_eq!(probe.probes(), 3);
    }

    #[tokio::test]
    async fn fails_after_failure_threshold() {
        let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Fail));
        let (gate, _) = gate(probe);
        let spec = spec(1, 2);

        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Pending);
        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Failing);
    }

    #[tokio::test]
    async fn mixed_probes_reset_consecutive_counts() {
        let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Pass));
        probe.push(ProbeOutcome::Pass);
        probe.push(ProbeOutcome::Fail); // breaks the pass streak
        let (gate, _) = gate(probe);
        let spec = spec(2, 3);

        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Pending);
        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Pending);
        // Streak restarted: two more passes needed.
        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Pending);
        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Passing);
    }

    #[tokio::test]
    async fn verdict_latches_without_reprobing() {
        let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Fail));
        let (gate, _) = gate(probe.clone());
        let spec = spec(1, 1);

        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Failing);
        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Failing);
        assert_eq!(probe.probes(), 1);
    }

    #[tokio::test]
    async fn initial_delay_defers_first_probe() {
        let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Pass));
        let (gate, _) = gate(probe.clone());
        let mut spec = spec(1, 1);
        spec.initial_delay_secs = 3600;

        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Pending);
        assert_eq!(probe.probes(), 0);
    }

    #[tokio::test]
    async fn period_spaces_probes() {
        let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Pass));
        let (gate, _) = gate(probe.clone());
        let mut spec = spec(5, 5);
        spec.period_secs = 3600;

        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Pending);
        // Second call lands inside the period: no probe.
        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Pending);
        assert_eq!(probe.probes(), 1);
    }

    #[tokio::test]
    async fn window_survives_gate_recreation() {
        let store = StatusStore::open_in_memory().unwrap();
        let spec = spec(3, 3);

        {
            let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Pass));
            let gate = HealthGate::new(store.clone(), probe);
            gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap();
            gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap();
        }

        // A "restarted" gate resumes the same window from the store.
        let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Pass));
        let gate = HealthGate::new(store, probe);
        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Passing);
    }

    #[tokio::test]
    async fn reset_clears_window() {
        let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Fail));
        let (gate, store) = gate(probe);
        let spec = spec(1, 1);

        assert_eq!(gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap(), GateOutcome::Failing);
        gate.reset("a:hc:0").unwrap();
        assert!(store.get_gate("a:hc:0").unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_app_clears_all_windows() {
        let probe = Arc::new(ScriptedProbe::always(ProbeOutcome::Pass));
        let (gate, store) = gate(probe);
        let spec = spec(5, 5);

        gate.evaluate("a:hc:0", &spec, "x:80").await.unwrap();
        gate.evaluate("a:canary:0", &spec, "x:80").await.unwrap();
        gate.evaluate("a:canary:1", &spec, "x:80").await.unwrap();

        gate.reset_app("a").unwrap();
        assert!(store.get_gate("a:hc:0").unwrap().is_none());
        assert!(store.get_gate("a:canary:1").unwrap().is_none());
    }
}
