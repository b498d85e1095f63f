//! vershift-canary — weighted canary traffic shifting.
//!
//! The controller walks an ordered schedule of (weight, pause) steps,
//! applying each weight to the traffic split, gating it on health, and
//! waiting out the pause — one externally-visible side effect per
//! invocation, with every wait expressed as "come back later" instead of a
//! blocking sleep.
//!
//! # Components
//!
//! - **`schedule`** — step-sequence normalization and position helpers
//! - **`controller`** — the per-invocation `advance` algorithm

pub mod controller;
pub mod schedule;

pub use controller::{CanaryController, CanaryError, CanaryOutcome, CanaryResult};
pub use schedule::normalize;
