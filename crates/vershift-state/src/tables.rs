//! redb table definitions for the vershift status store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{namespace}/{name}` or `{app_id}:{suffix}`.

use redb::TableDefinition;

/// Managed application specs keyed by `{namespace}/{name}`.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Upgrade status records (status + revision) keyed by app id.
pub const STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("status");

/// Health-gate probe bookkeeping keyed by `{app_id}:{phase}:{step}`.
pub const GATES: TableDefinition<&str, &[u8]> = TableDefinition::new("gates");
