//! StatusStore — redb-backed persistence for the upgrade orchestrator.
//!
//! Provides typed CRUD over managed applications, revision-checked writes
//! over their upgrade status, and health-gate probe bookkeeping. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Status plus its revision token, as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusRecord {
    revision: u64,
    status: AppStatus,
}

/// Thread-safe status store backed by redb.
#[derive(Clone)]
pub struct StatusStore {
    db: Arc<Database>,
}

impl StatusStore {
    /// Open (or create) a persistent status store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "status store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory status store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory status store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(STATUS).map_err(map_err!(Table))?;
        txn.open_table(GATES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Managed applications ───────────────────────────────────────

    /// Insert or update a managed application spec.
    pub fn put_app(&self, app: &ManagedApp) -> StateResult<()> {
        let key = app.table_key();
        let value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "app stored");
        Ok(())
    }

    /// Get an application by its `{namespace}/{name}` key.
    pub fn get_app(&self, app_id: &str) -> StateResult<Option<ManagedApp>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        match table.get(app_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let app: ManagedApp =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    /// List all managed applications.
    pub fn list_apps(&self) -> StateResult<Vec<ManagedApp>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let app: ManagedApp =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(app);
        }
        Ok(results)
    }

    /// Delete an application by key. Returns true if it existed.
    pub fn delete_app(&self, app_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            existed = table.remove(app_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app_id, existed, "app deleted");
        Ok(existed)
    }

    // ── Upgrade status (revision-checked) ──────────────────────────

    /// Read an application's status together with its revision token.
    pub fn read_status(&self, app_id: &str) -> StateResult<Option<(AppStatus, u64)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUS).map_err(map_err!(Table))?;
        match table.get(app_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: StatusRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some((record.status, record.revision)))
            }
            None => Ok(None),
        }
    }

    /// Write an application's status, guarded by the revision token from the
    /// preceding read (0 when no status exists yet).
    ///
    /// Returns the new revision, or [`StateError::Conflict`] if the stored
    /// revision no longer matches — the caller must re-read and retry rather
    /// than overwrite a concurrent edit.
    pub fn write_status(
        &self,
        app_id: &str,
        status: &AppStatus,
        expected_revision: u64,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_revision;
        {
            let mut table = txn.open_table(STATUS).map_err(map_err!(Table))?;
            let actual = match table.get(app_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    let record: StatusRecord =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    record.revision
                }
                None => 0,
            };
            if actual != expected_revision {
                return Err(StateError::Conflict {
                    app: app_id.to_string(),
                    expected: expected_revision,
                    actual,
                });
            }
            new_revision = actual + 1;
            let record = StatusRecord {
                revision: new_revision,
                status: status.clone(),
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(app_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app_id, revision = new_revision, phase = ?status.phase, "status written");
        Ok(new_revision)
    }

    /// Delete an application's status. Returns true if it existed.
    pub fn delete_status(&self, app_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(STATUS).map_err(map_err!(Table))?;
            existed = table.remove(app_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Health-gate bookkeeping ────────────────────────────────────

    /// Get the gate record for a confirmation window key.
    pub fn get_gate(&self, gate_key: &str) -> StateResult<Option<GateRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GATES).map_err(map_err!(Table))?;
        match table.get(gate_key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: GateRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Insert or update a gate record.
    pub fn put_gate(&self, gate_key: &str, record: &GateRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GATES).map_err(map_err!(Table))?;
            table
                .insert(gate_key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Delete a single gate record. Returns true if it existed.
    pub fn delete_gate(&self, gate_key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(GATES).map_err(map_err!(Table))?;
            existed = table.remove(gate_key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Delete all gate records for an application. Returns number deleted.
    pub fn delete_gates_for_app(&self, app_id: &str) -> StateResult<u32> {
        let prefix = format!("{app_id}:");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(GATES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(GATES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_app(namespace: &str, name: &str) -> ManagedApp {
        ManagedApp {
            namespace: namespace.to_string(),
            name: name.to_string(),
            workload: format!("{namespace}-{name}"),
            address: "10.0.0.5:8080".to_string(),
            target_version: "v2".to_string(),
            paused: false,
            deletion_requested: false,
            strategy: UpgradeStrategy::Rolling(RollingSpec {
                health: Some(HealthCheckSpec {
                    endpoint: "/healthz".to_string(),
                    initial_delay_secs: 5,
                    period_secs: 10,
                    timeout_secs: 2,
                    success_threshold: 3,
                    failure_threshold: 3,
                }),
                rollback_on_failure: true,
            }),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    // ── App CRUD ───────────────────────────────────────────────────

    #[test]
    fn app_put_and_get() {
        let store = StatusStore::open_in_memory().unwrap();
        let app = test_app("default", "shop");

        store.put_app(&app).unwrap();
        let retrieved = store.get_app("default/shop").unwrap();

        assert_eq!(retrieved, Some(app));
    }

    #[test]
    fn app_get_nonexistent_returns_none() {
        let store = StatusStore::open_in_memory().unwrap();
        assert!(store.get_app("nope/nothing").unwrap().is_none());
    }

    #[test]
    fn app_list_all() {
        let store = StatusStore::open_in_memory().unwrap();
        store.put_app(&test_app("ns1", "a")).unwrap();
        store.put_app(&test_app("ns1", "b")).unwrap();
        store.put_app(&test_app("ns2", "c")).unwrap();

        assert_eq!(store.list_apps().unwrap().len(), 3);
    }

    #[test]
    fn app_update_in_place() {
        let store = StatusStore::open_in_memory().unwrap();
        let mut app = test_app("default", "shop");
        store.put_app(&app).unwrap();

        app.target_version = "v3".to_string();
        app.updated_at = 2000;
        store.put_app(&app).unwrap();

        let retrieved = store.get_app("default/shop").unwrap().unwrap();
        assert_eq!(retrieved.target_version, "v3");
        assert_eq!(retrieved.updated_at, 2000);
    }

    #[test]
    fn app_delete() {
        let store = StatusStore::open_in_memory().unwrap();
        store.put_app(&test_app("default", "shop")).unwrap();

        assert!(store.delete_app("default/shop").unwrap());
        assert!(!store.delete_app("default/shop").unwrap());
        assert!(store.get_app("default/shop").unwrap().is_none());
    }

    // ── Status writes & revision token ─────────────────────────────

    #[test]
    fn status_first_write_uses_revision_zero() {
        let store = StatusStore::open_in_memory().unwrap();
        let status = AppStatus::new("v1");

        let rev = store.write_status("default/shop", &status, 0).unwrap();
        assert_eq!(rev, 1);

        let (read, rev) = store.read_status("default/shop").unwrap().unwrap();
        assert_eq!(read, status);
        assert_eq!(rev, 1);
    }

    #[test]
    fn status_write_bumps_revision() {
        let store = StatusStore::open_in_memory().unwrap();
        let mut status = AppStatus::new("v1");
        let rev = store.write_status("default/shop", &status, 0).unwrap();

        status.phase = UpgradePhase::Migrating;
        let rev = store.write_status("default/shop", &status, rev).unwrap();
        assert_eq!(rev, 2);
    }

    #[test]
    fn status_stale_write_conflicts() {
        let store = StatusStore::open_in_memory().unwrap();
        let mut status = AppStatus::new("v1");
        let rev = store.write_status("default/shop", &status, 0).unwrap();

        // A concurrent writer lands first.
        status.phase = UpgradePhase::Migrating;
        store.write_status("default/shop", &status, rev).unwrap();

        // Our write, based on the stale revision, is rejected.
        status.phase = UpgradePhase::Deploying;
        let err = store
            .write_status("default/shop", &status, rev)
            .unwrap_err();
        assert!(err.is_conflict());

        // The concurrent write survives.
        let (read, _) = store.read_status("default/shop").unwrap().unwrap();
        assert_eq!(read.phase, UpgradePhase::Migrating);
    }

    #[test]
    fn status_create_with_nonzero_revision_conflicts() {
        let store = StatusStore::open_in_memory().unwrap();
        let status = AppStatus::new("v1");
        let err = store.write_status("default/shop", &status, 7).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn status_delete() {
        let store = StatusStore::open_in_memory().unwrap();
        store
            .write_status("default/shop", &AppStatus::new("v1"), 0)
            .unwrap();

        assert!(store.delete_status("default/shop").unwrap());
        assert!(store.read_status("default/shop").unwrap().is_none());
    }

    // ── Gate records ───────────────────────────────────────────────

    #[test]
    fn gate_put_get_delete() {
        let store = StatusStore::open_in_memory().unwrap();
        let record = GateRecord {
            passes: 2,
            fails: 0,
            started_at: 1000,
            last_probe_at: 1020,
        };

        store.put_gate("default/shop:canary:1", &record).unwrap();
        assert_eq!(
            store.get_gate("default/shop:canary:1").unwrap(),
            Some(record)
        );

        assert!(store.delete_gate("default/shop:canary:1").unwrap());
        assert!(store.get_gate("default/shop:canary:1").unwrap().is_none());
    }

    #[test]
    fn gate_delete_all_for_app() {
        let store = StatusStore::open_in_memory().unwrap();
        let record = GateRecord::default();
        store.put_gate("default/shop:healthcheck:0", &record).unwrap();
        store.put_gate("default/shop:canary:0", &record).unwrap();
        store.put_gate("default/shop:canary:1", &record).unwrap();
        store.put_gate("default/other:canary:0", &record).unwrap();

        let deleted = store.delete_gates_for_app("default/shop").unwrap();
        assert_eq!(deleted, 3);
        // Other app untouched.
        assert!(store.get_gate("default/other:canary:0").unwrap().is_some());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StatusStore::open(&db_path).unwrap();
            store.put_app(&test_app("prod", "shop")).unwrap();
            let mut status = AppStatus::new("v1");
            status.phase = UpgradePhase::Canary;
            status.canary_weight = 50;
            store.write_status("prod/shop", &status, 0).unwrap();
        }

        // Reopen the same database file.
        let store = StatusStore::open(&db_path).unwrap();
        assert!(store.get_app("prod/shop").unwrap().is_some());
        let (status, rev) = store.read_status("prod/shop").unwrap().unwrap();
        assert_eq!(status.phase, UpgradePhase::Canary);
        assert_eq!(status.canary_weight, 50);
        assert_eq!(rev, 1);
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StatusStore::open_in_memory().unwrap();

        assert!(store.list_apps().unwrap().is_empty());
        assert!(store.read_status("any").unwrap().is_none());
        assert!(store.get_gate("any:phase:0").unwrap().is_none());
        assert!(!store.delete_app("nope").unwrap());
        assert!(!store.delete_status("nope").unwrap());
        assert_eq!(store.delete_gates_for_app("nope").unwrap(), 0);
    }
}
