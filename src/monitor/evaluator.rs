//! Status state machine: probe outcome in, committed status and transition
//! events out.
//!
//! A DOWN candidate is debounced: `retries` consecutive failures are absorbed
//! silently and the next one commits DOWN. An UP candidate commits at once and
//! clears the failure counter. Events are edge-triggered on the committed
//! status, so repeated DOWN commits notify only once.

use chrono::{DateTime, Utc};

use super::spec::MonitorSpec;
use super::state::{MonitorState, Status, TransitionEvent, TransitionReason};
use crate::probe::ProbeResult;

/// The status a single probe argues for, before debouncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    Up,
    Down(TransitionReason),
}

impl Candidate {
    /// Classify a probe result. `string_match` is `None` when no string check ran.
    pub fn from_probe(result: &ProbeResult, string_match: Option<bool>) -> Self {
        if !result.reachable {
            Candidate::Down(TransitionReason::Unreachable)
        } else if string_match == Some(false) {
            Candidate::Down(TransitionReason::StringCheckFailed)
        } else {
            Candidate::Up
        }
    }

    pub fn reason(&self) -> TransitionReason {
        match self {
            Candidate::Up => TransitionReason::Reachable,
            Candidate::Down(reason) => *reason,
        }
    }
}

/// What one evaluation did to the state.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Status committed this cycle; `None` while a failure is being debounced.
    pub committed: Option<Status>,
    pub event: Option<TransitionEvent>,
}

pub struct StatusEvaluator;

impl StatusEvaluator {
    /// Apply one probe cycle to `state`.
    pub fn evaluate(
        state: &mut MonitorState,
        spec: &MonitorSpec,
        result: &ProbeResult,
        candidate: Candidate,
        at: DateTime<Utc>,
    ) -> Evaluation {
        let previous = state.status;

        let committed = match candidate {
            Candidate::Up => {
                state.consecutive_failures = 0;
                Some(Status::Up)
            }
            Candidate::Down(_) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                (state.consecutive_failures > spec.retries).then_some(Status::Down)
            }
        };

        let event = match committed {
            Some(status) if status != previous => {
                state.status = status;
                Some(TransitionEvent {
                    monitor_id: spec.id,
                    monitor_name: spec.name.clone(),
                    previous,
                    current: status,
                    latency_ms: result.reachable.then_some(result.latency_ms),
                    timestamp: at,
                    reason: candidate.reason(),
                    error: result.error.clone(),
                })
            }
            _ => None,
        };

        Evaluation { committed, event }
    }
}
