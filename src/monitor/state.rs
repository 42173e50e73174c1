//! Runtime state of a monitor and the events emitted when it changes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::spec::MonitorId;
use super::uptime::{History, LatencyWindow};
use crate::probe::ProbeError;

/// Committed status of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Up,
    Down,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Up => "up",
            Status::Down => "down",
        };
        f.write_str(s)
    }
}

/// Why a status was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionReason {
    Reachable,
    Unreachable,
    StringCheckFailed,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionReason::Reachable => "reachable",
            TransitionReason::Unreachable => "unreachable",
            TransitionReason::StringCheckFailed => "string-check-failed",
        };
        f.write_str(s)
    }
}

/// Emitted when the committed status of a monitor changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub monitor_id: MonitorId,
    pub monitor_name: String,
    pub previous: Status,
    pub current: Status,
    pub latency_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub reason: TransitionReason,
    pub error: Option<ProbeError>,
}

/// Mutable per-monitor state. Only the monitor's worker mutates it; everyone
/// else sees immutable snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorState {
    pub id: MonitorId,
    pub status: Status,
    /// True while a probe is in flight. Display only.
    #[serde(default)]
    pub checking: bool,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<ProbeError>,
    /// Outcome of the most recent string check, if one ran.
    #[serde(default)]
    pub string_check_result: Option<bool>,
    pub uptime: f64,
    pub history: History,
    #[serde(default)]
    pub latencies: LatencyWindow,
}

impl MonitorState {
    /// Fresh state for a newly registered monitor.
    pub fn new(id: MonitorId, history_capacity: usize) -> Self {
        Self {
            id,
            status: Status::Pending,
            checking: false,
            consecutive_failures: 0,
            last_latency_ms: None,
            last_checked_at: None,
            last_error: None,
            string_check_result: None,
            uptime: 100.0,
            history: History::pending(history_capacity),
            latencies: LatencyWindow::new(history_capacity),
        }
    }

    /// Adopt persisted state under the current history capacity.
    pub fn restore(mut self, id: MonitorId, history_capacity: usize) -> Self {
        self.id = id;
        self.checking = false;
        self.uptime = self.uptime.clamp(0.0, 100.0);
        self.history.resize(history_capacity);
        self.latencies.resize(history_capacity);
        self
    }
}
