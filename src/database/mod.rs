//! SQLite-backed audit store.
//!
//! The store keeps one record per data identity plus the bookkeeping
//! the scheduler needs: which `(identity, stage)` pairs have finished
//! and which `(identity, plugin)` pairs have been processed. The audit
//! coordinator is the single writer; atomicity is per call.

mod schema;

use crate::data::{Data, Identity};
use crate::error::{Error, Result};
use crate::plugin::Stage;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Outcome of an [`AuditStore::add`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The identity was not present; a new record was inserted.
    Inserted,
    /// An existing record was merged with the incoming one.
    Merged,
}

/// Key→record store for audit data with per-stage and per-plugin
/// progress bits.
pub struct AuditStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl AuditStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Create an in-memory store.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::database("audit store is closed"))?;
        f(conn).map_err(Into::into)
    }

    /// Insert a data item, or merge it into the existing record with
    /// the same identity. Link edges gain their reverse direction on
    /// already-stored endpoints.
    pub fn add(&self, item: &Data) -> Result<AddOutcome> {
        let identity = item.identity().clone();
        let existing = self.get(&identity)?;

        let (outcome, record) = match existing {
            Some(mut stored) => {
                stored.merge(item);
                (AddOutcome::Merged, stored)
            }
            None => (AddOutcome::Inserted, item.clone()),
        };

        let payload = serde_json::to_string(&record)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO data (identity, kind, subtype, payload)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(identity) DO UPDATE SET payload = excluded.payload",
                params![
                    identity.as_str(),
                    record.kind().label(),
                    record.subtype().label(),
                    payload,
                ],
            )?;
            Ok(())
        })?;

        // Keep the link graph consistent on both endpoints.
        for linked in record.links() {
            if let Some(mut other) = self.get(linked)? {
                if !other.links().contains(&identity) {
                    other.add_link(identity.clone());
                    let payload = serde_json::to_string(&other)?;
                    self.with_conn(|conn| {
                        conn.execute(
                            "UPDATE data SET payload = ?2 WHERE identity = ?1",
                            params![linked.as_str(), payload],
                        )?;
                        Ok(())
                    })?;
                }
            }
        }

        Ok(outcome)
    }

    /// Fetch a data item by identity.
    pub fn get(&self, identity: &Identity) -> Result<Option<Data>> {
        let payload: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT payload FROM data WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()
        })?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Whether an identity is present.
    pub fn has(&self, identity: &Identity) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM data WHERE identity = ?1",
                params![identity.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM data", [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Identities not yet marked finished at the given stage.
    pub fn get_pending(&self, stage: Stage) -> Result<Vec<Identity>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT identity FROM data
                 WHERE identity NOT IN
                     (SELECT identity FROM stage_history WHERE stage = ?1)
                 ORDER BY created_at, identity",
            )?;
            let identities = stmt
                .query_map(params![stage.index()], |row| {
                    row.get::<_, String>(0).map(Identity::from_hex)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(identities)
        })
    }

    /// Mark an identity finished at the given stage and every earlier
    /// one. Stage marks only ever advance.
    pub fn mark_stage_finished(&self, identity: &Identity, stage: Stage) -> Result<()> {
        self.with_conn(|conn| {
            for done in Stage::ALL.iter().filter(|s| **s <= stage) {
                conn.execute(
                    "INSERT OR IGNORE INTO stage_history (identity, stage) VALUES (?1, ?2)",
                    params![identity.as_str(), done.index()],
                )?;
            }
            Ok(())
        })
    }

    /// Whether the identity has finished the given stage.
    pub fn has_stage_finished(&self, identity: &Identity, stage: Stage) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM stage_history WHERE identity = ?1 AND stage = ?2",
                params![identity.as_str(), stage.index()],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
    }

    /// Record that a plugin has processed an identity. Never undone.
    pub fn mark_plugin_finished(&self, identity: &Identity, plugin_name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO plugin_history (identity, plugin) VALUES (?1, ?2)",
                params![identity.as_str(), plugin_name],
            )?;
            Ok(())
        })
    }

    /// Whether a plugin has processed an identity.
    pub fn has_plugin_finished(&self, identity: &Identity, plugin_name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM plugin_history WHERE identity = ?1 AND plugin = ?2",
                params![identity.as_str(), plugin_name],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
    }

    /// Reclaim unused space.
    pub fn compact(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("VACUUM"))
    }

    /// Close the store. Further calls fail with a database error.
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        if let Some(conn) = guard.take() {
            debug!("closing audit store");
            conn.close()
                .map_err(|(_, err)| Error::database(err.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> AuditStore {
        AuditStore::in_memory().unwrap()
    }

    #[test]
    fn test_add_then_get_roundtrip() {
        let store = store();
        let item = Data::url("http://example.com/").unwrap();
        assert_eq!(store.add(&item).unwrap(), AddOutcome::Inserted);
        assert!(store.has(item.identity()).unwrap());

        let back = store.get(item.identity()).unwrap().unwrap();
        assert_eq!(back.identity(), item.identity());
        assert_eq!(back.subtype(), item.subtype());
    }

    #[test]
    fn test_reinsertion_merges() {
        let store = store();
        let mut first = Data::url("http://example.com/").unwrap();
        first.add_label("seen");
        let mut second = Data::url("http://example.com/").unwrap();
        second.add_label("crawled");
        second.set_attribute("status", serde_json::json!(200));

        assert_eq!(store.add(&first).unwrap(), AddOutcome::Inserted);
        assert_eq!(store.add(&second).unwrap(), AddOutcome::Merged);
        assert_eq!(store.len().unwrap(), 1);

        let merged = store.get(first.identity()).unwrap().unwrap();
        assert!(merged.has_label("seen"));
        assert!(merged.has_label("crawled"));
        assert_eq!(merged.attribute("status"), Some(&serde_json::json!(200)));
    }

    #[test]
    fn test_merge_order_is_irrelevant_for_sets() {
        let make = |label: &str| {
            let mut d = Data::domain("example.com");
            d.add_label(label);
            d
        };

        let ab = store();
        ab.add(&make("a")).unwrap();
        ab.add(&make("b")).unwrap();
        let ba = store();
        ba.add(&make("b")).unwrap();
        ba.add(&make("a")).unwrap();

        let ab = ab.get(make("a").identity()).unwrap().unwrap();
        let ba = ba.get(make("a").identity()).unwrap().unwrap();
        assert!(ab.has_label("a") && ab.has_label("b"));
        assert!(ba.has_label("a") && ba.has_label("b"));
    }

    #[test]
    fn test_link_backfill_on_stored_endpoint() {
        let store = store();
        let domain = Data::domain("example.com");
        store.add(&domain).unwrap();

        let mut page = Data::url("http://example.com/").unwrap();
        page.add_link(domain.identity().clone());
        store.add(&page).unwrap();

        let stored_domain = store.get(domain.identity()).unwrap().unwrap();
        assert!(stored_domain.links().contains(page.identity()));
    }

    #[test]
    fn test_pending_and_stage_marks() {
        let store = store();
        let a = Data::domain("a.example.com");
        let b = Data::domain("b.example.com");
        store.add(&a).unwrap();
        store.add(&b).unwrap();

        let pending = store.get_pending(Stage::Recon).unwrap();
        assert_eq!(pending.len(), 2);

        store.mark_stage_finished(a.identity(), Stage::Recon).unwrap();
        let pending = store.get_pending(Stage::Recon).unwrap();
        assert_eq!(pending, vec![b.identity().clone()]);

        // Finished is forever.
        store.mark_stage_finished(a.identity(), Stage::Recon).unwrap();
        assert!(store.has_stage_finished(a.identity(), Stage::Recon).unwrap());
    }

    #[test]
    fn test_stage_marks_cover_earlier_stages() {
        let store = store();
        let item = Data::domain("example.com");
        store.add(&item).unwrap();
        store
            .mark_stage_finished(item.identity(), Stage::last())
            .unwrap();

        for stage in Stage::ALL {
            assert!(store.has_stage_finished(item.identity(), stage).unwrap());
            assert!(store.get_pending(stage).unwrap().is_empty());
        }
    }

    #[test]
    fn test_plugin_marks() {
        let store = store();
        let item = Data::domain("example.com");
        store.add(&item).unwrap();

        assert!(!store
            .has_plugin_finished(item.identity(), "testing/recon/spider")
            .unwrap());
        store
            .mark_plugin_finished(item.identity(), "testing/recon/spider")
            .unwrap();
        assert!(store
            .has_plugin_finished(item.identity(), "testing/recon/spider")
            .unwrap());
        assert!(!store
            .has_plugin_finished(item.identity(), "testing/recon/dns")
            .unwrap());
    }

    #[test]
    fn test_close_then_use_fails() {
        let store = store();
        store.close().unwrap();
        let err = store.add(&Data::domain("example.com")).unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        // Closing twice is fine.
        store.close().unwrap();
    }

    #[test]
    fn test_disk_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let store = AuditStore::open(&path).unwrap();
        store.add(&Data::domain("example.com")).unwrap();
        store.compact().unwrap();
        store.close().unwrap();

        let reopened = AuditStore::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
    }
}
