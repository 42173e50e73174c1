//! SQLite database store implementation.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

use super::{MonitorStore, StoreError};
use crate::monitor::{MonitorId, MonitorSpec, MonitorState};

/// Thread-safe SQLite store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // --- Monitor definitions ---

    /// Insert or replace a monitor definition.
    pub fn put_monitor(&self, spec: &MonitorSpec) -> Result<(), StoreError> {
        let json = serde_json::to_string(spec)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO monitors (id, name, kind, spec_json, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
             name=excluded.name, kind=excluded.kind, spec_json=excluded.spec_json, updated_at=excluded.updated_at",
            params![
                spec.id,
                spec.name,
                spec.kind().to_string(),
                json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get all monitor definitions ordered by id.
    pub fn get_monitors(&self) -> Result<Vec<MonitorSpec>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT spec_json FROM monitors ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut specs = Vec::with_capacity(rows.len());
        for json in rows {
            specs.push(serde_json::from_str(&json)?);
        }
        Ok(specs)
    }

    /// Get a monitor definition by id.
    pub fn get_monitor(&self, id: MonitorId) -> Result<Option<MonitorSpec>, StoreError> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT spec_json FROM monitors WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    /// Delete a monitor and its state in one transaction.
    pub fn delete_monitor(&self, id: MonitorId) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM monitor_state WHERE monitor_id = ?1", params![id])?;
        tx.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // --- Runtime state ---

    pub fn put_state(&self, id: MonitorId, state: &MonitorState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO monitor_state (monitor_id, status, uptime, last_checked_at, state_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(monitor_id) DO UPDATE SET
             status=excluded.status, uptime=excluded.uptime,
             last_checked_at=excluded.last_checked_at, state_json=excluded.state_json",
            params![
                id,
                state.status.to_string(),
                state.uptime,
                state.last_checked_at.map(|t| t.to_rfc3339()),
                json,
            ],
        )?;
        Ok(())
    }

    pub fn get_state(&self, id: MonitorId) -> Result<Option<MonitorState>, StoreError> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM monitor_state WHERE monitor_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }
}

#[async_trait]
impl MonitorStore for SqliteStore {
    async fn load_all(&self) -> Result<Vec<MonitorSpec>, StoreError> {
        self.get_monitors()
    }

    async fn save(&self, spec: &MonitorSpec) -> Result<(), StoreError> {
        self.put_monitor(spec)
    }

    async fn delete(&self, id: MonitorId) -> Result<(), StoreError> {
        self.delete_monitor(id)
    }

    async fn load_runtime_state(&self, id: MonitorId) -> Result<Option<MonitorState>, StoreError> {
        self.get_state(id)
    }

    async fn save_runtime_state(&self, id: MonitorId, state: &MonitorState) -> Result<(), StoreError> {
        self.put_state(id, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{HttpTarget, Status, Target};
    use tempfile::NamedTempFile;

    #[test]
    fn test_monitor_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStore::new(tmp.path()).unwrap();

        // Create
        let mut spec = MonitorSpec::new(
            1,
            "Website",
            Target::Http(HttpTarget::new("https://example.com")),
        );
        store.put_monitor(&spec).unwrap();

        // Read
        let fetched = store.get_monitor(1).unwrap().unwrap();
        assert_eq!(fetched, spec);

        // Update
        spec.name = "Updated".to_string();
        spec.retries = 3;
        store.put_monitor(&spec).unwrap();
        let fetched = store.get_monitor(1).unwrap().unwrap();
        assert_eq!(fetched.name, "Updated");
        assert_eq!(fetched.retries, 3);
        assert_eq!(store.get_monitors().unwrap().len(), 1);

        // Delete
        store.delete_monitor(1).unwrap();
        assert!(store.get_monitor(1).unwrap().is_none());
    }

    #[test]
    fn test_state_roundtrip_and_cascade() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStore::new(tmp.path()).unwrap();
        let spec = MonitorSpec::new(4, "db", Target::Tcp { host: "db".into(), port: 5432 });
        store.put_monitor(&spec).unwrap();

        let mut state = MonitorState::new(4, 5);
        state.status = Status::Down;
        state.consecutive_failures = 3;
        state.uptime = 87.5;
        state.last_checked_at = Some(Utc::now());
        store.put_state(4, &state).unwrap();

        let loaded = store.get_state(4).unwrap().unwrap();
        assert_eq!(loaded, state);

        store.delete_monitor(4).unwrap();
        assert!(store.get_state(4).unwrap().is_none());
    }

    #[test]
    fn test_failed_delete_keeps_state() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStore::new(tmp.path()).unwrap();
        let spec = MonitorSpec::new(4, "db", Target::Tcp { host: "db".into(), port: 5432 });
        store.put_monitor(&spec).unwrap();
        store.put_state(4, &MonitorState::new(4, 5)).unwrap();

        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER block_delete BEFORE DELETE ON monitors
                 BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
            )
            .unwrap();

        assert!(store.delete_monitor(4).is_err());
        assert!(store.get_monitor(4).unwrap().is_some());
        assert!(store.get_state(4).unwrap().is_some());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = SqliteStore::new(tmp.path()).unwrap();
            let spec = MonitorSpec::new(9, "router", Target::Ping { host: "10.0.0.1".into() });
            store.put_monitor(&spec).unwrap();
        }
        let store = SqliteStore::new(tmp.path()).unwrap();
        let specs = store.get_monitors().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, 9);
    }

    #[tokio::test]
    async fn test_trait_surface() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStore::new(tmp.path()).unwrap();
        let spec = MonitorSpec::new(2, "db", Target::Tcp { host: "db".into(), port: 3306 });

        tokio_test::assert_ok!(store.save(&spec).await);
        assert_eq!(store.load_all().await.unwrap(), vec![spec]);
        assert!(store.load_runtime_state(2).await.unwrap().is_none());

        tokio_test::assert_ok!(store.save_runtime_state(2, &MonitorState::new(2, 30)).await);
        assert!(store.load_runtime_state(2).await.unwrap().is_some());

        tokio_test::assert_ok!(store.delete(2).await);
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
