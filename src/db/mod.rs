//! Persistence of monitor definitions and their last observed state.
//!
//! The engine only depends on [`MonitorStore`]; [`SqliteStore`] is the
//! production backend and [`MemoryStore`] serves tests and embedders.

mod memory;
mod store;

pub use memory::*;
pub use store::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::monitor::{MonitorId, MonitorSpec, MonitorState};

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Storage of monitor definitions and runtime state.
///
/// Failures are treated as transient by the engine: writes are retried with
/// backoff and queued while the store is down.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<MonitorSpec>, StoreError>;

    async fn save(&self, spec: &MonitorSpec) -> Result<(), StoreError>;

    /// Delete a definition together with its runtime state.
    async fn delete(&self, id: MonitorId) -> Result<(), StoreError>;

    async fn load_runtime_state(&self, id: MonitorId) -> Result<Option<MonitorState>, StoreError>;

    async fn save_runtime_state(&self, id: MonitorId, state: &MonitorState) -> Result<(), StoreError>;
}
