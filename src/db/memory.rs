//! In-memory store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{MonitorStore, StoreError};
use crate::monitor::{MonitorId, MonitorSpec, MonitorState};

#[derive(Default)]
struct Tables {
    monitors: BTreeMap<MonitorId, MonitorSpec>,
    states: BTreeMap<MonitorId, MonitorState>,
}

/// Store that keeps everything in process memory.
///
/// Can be switched offline to simulate an unavailable backend.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    online: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            online: AtomicBool::new(true),
        }
    }

    /// A store pre-populated with definitions.
    pub fn with_monitors(specs: impl IntoIterator<Item = MonitorSpec>) -> Self {
        let store = Self::new();
        if let Ok(mut tables) = store.tables.lock() {
            tables.monitors.extend(specs.into_iter().map(|s| (s.id, s)));
        }
        store
    }

    /// While offline every call fails with [`StoreError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Current state record, bypassing the availability switch.
    pub fn state(&self, id: MonitorId) -> Option<MonitorState> {
        self.tables.lock().ok()?.states.get(&id).cloned()
    }

    /// Current definition, bypassing the availability switch.
    pub fn monitor(&self, id: MonitorId) -> Option<MonitorSpec> {
        self.tables.lock().ok()?.monitors.get(&id).cloned()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T, StoreError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        let mut tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut tables))
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<MonitorSpec>, StoreError> {
        self.with_tables(|t| t.monitors.values().cloned().collect())
    }

    async fn save(&self, spec: &MonitorSpec) -> Result<(), StoreError> {
        self.with_tables(|t| {
            t.monitors.insert(spec.id, spec.clone());
        })
    }

    async fn delete(&self, id: MonitorId) -> Result<(), StoreError> {
        self.with_tables(|t| {
            t.monitors.remove(&id);
            t.states.remove(&id);
        })
    }

    async fn load_runtime_state(&self, id: MonitorId) -> Result<Option<MonitorState>, StoreError> {
        self.with_tables(|t| t.states.get(&id).cloned())
    }

    async fn save_runtime_state(&self, id: MonitorId, state: &MonitorState) -> Result<(), StoreError> {
        self.with_tables(|t| {
            t.states.insert(id, state.clone());
        })
    }
}
