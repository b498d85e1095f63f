//! vershift-state — embedded status store for the upgrade orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for managed applications, their upgrade status, and health-gate
//! probe bookkeeping.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{namespace}/{name}`, `{app_id}:{phase}:{step}`) enable
//! prefix scans for related records.
//!
//! Status writes carry a revision token: a write based on a stale read is
//! rejected with [`StateError::Conflict`], forcing the writer to re-read
//! rather than silently overwrite a concurrent edit.
//!
//! The `StatusStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StatusStore;
pub use types::*;
