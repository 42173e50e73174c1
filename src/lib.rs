//! Upwatch - monitor scheduling and probing engine.
//!
//! Periodically checks HTTP(S), TCP and ICMP endpoints, debounces status
//! changes, tracks uptime and latency, and hands transitions to a
//! notification dispatcher.

pub mod config;
pub mod db;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod scheduler;

pub use config::EngineConfig;
pub use db::{MemoryStore, MonitorStore, SqliteStore, StoreError};
pub use monitor::{MonitorId, MonitorSpec, MonitorState, Status, Target, TransitionEvent};
pub use notify::{LogDispatcher, NotificationDispatcher, WebhookDispatcher};
pub use probe::{CancelHandle, CancelToken, NetworkProber, ProbeError, ProbeResult, Prober};
pub use scheduler::{MonitorSnapshot, Scheduler, SchedulerError, Summary};
