//! vershift-health — the health gate for upgrade confirmation.
//!
//! A version under rollout is not trusted after a single good probe: the
//! gate requires `success_threshold` consecutive passes before reporting
//! `Passing`, and `failure_threshold` consecutive fails before reporting
//! `Failing`; anything in between is `Pending` and the caller reschedules.
//!
//! # Restart safety
//!
//! Consecutive counts are persisted in the status store, keyed by
//! application + phase + step. A process restart may conservatively restart
//! an almost-complete window, but it never invents passes it did not
//! observe, and an accumulated failure signal is not silently dropped.
//!
//! Probing itself goes through the [`ProbeClient`] contract; the [`probe`]
//! module provides the HTTP implementation.
//!
//! [`ProbeClient`]: vershift_platform::ProbeClient

pub mod gate;
pub mod probe;

pub use gate::{GateError, GateOutcome, GateResult, HealthGate, gate_key};
pub use probe::HttpProber;
