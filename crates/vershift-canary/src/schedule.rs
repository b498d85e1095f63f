//! Canary schedule normalization.

use vershift_state::CanaryStep;

/// Normalize a canary schedule for execution.
///
/// An empty schedule means "full cutover": a single implicit step of
/// weight 100 with no pause. Well-formedness (non-decreasing weights,
/// final weight 100) is checked by `UpgradeStrategy::validate` before any
/// step executes.
pub fn normalize(steps: &[CanaryStep]) -> Vec<CanaryStep> {
    if steps.is_empty() {
        vec![CanaryStep {
            weight: 100,
            pause_secs: 0,
        }]
    } else {
        steps.to_vec()
    }
}
