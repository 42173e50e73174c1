//! Rolling uptime, status history and latency statistics.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::state::{MonitorState, Status, TransitionReason};

/// Default number of entries kept in a monitor's history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 30;

/// One entry of the status history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Beat {
    Pending,
    Up,
    Down,
    StringCheckFailed,
}

impl Beat {
    /// The history marker for a committed status.
    pub fn committed(status: Status, reason: TransitionReason) -> Self {
        match (status, reason) {
            (Status::Pending, _) => Beat::Pending,
            (Status::Up, _) => Beat::Up,
            (Status::Down, TransitionReason::StringCheckFailed) => Beat::StringCheckFailed,
            (Status::Down, _) => Beat::Down,
        }
    }
}

/// Fixed-capacity status history. Oldest entries are evicted first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    capacity: usize,
    entries: VecDeque<Beat>,
}

impl History {
    /// A full history of `Pending` entries.
    pub fn pending(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: std::iter::repeat(Beat::Pending).take(capacity).collect(),
        }
    }

    pub fn push(&mut self, beat: Beat) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(beat);
    }

    /// Change the capacity, evicting the oldest entries or padding with
    /// `Pending` at the old end.
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
        while self.entries.len() < capacity {
            self.entries.push_front(Beat::Pending);
        }
        self.capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Beat> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<Beat> {
        self.entries.back().copied()
    }
}

/// Bounded window of recent successful latencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Step sizes of the uptime estimator. `down_step` must exceed `up_step`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UptimePolicy {
    pub up_step: f64,
    pub down_step: f64,
}

impl Default for UptimePolicy {
    fn default() -> Self {
        Self {
            up_step: 0.1,
            down_step: 0.5,
        }
    }
}

impl UptimePolicy {
    /// Build a policy, rejecting steps that are negative or not asymmetric.
    pub fn new(up_step: f64, down_step: f64) -> Option<Self> {
        let valid = up_step.is_finite()
            && down_step.is_finite()
            && up_step > 0.0
            && down_step > up_step;
        valid.then_some(Self { up_step, down_step })
    }

    /// Next uptime value after a committed status. `Pending` leaves it unchanged.
    pub fn apply(&self, uptime: f64, status: Status) -> f64 {
        let next = match status {
            Status::Up => uptime + self.up_step,
            Status::Down => uptime - self.down_step,
            Status::Pending => uptime,
        };
        next.clamp(0.0, 100.0)
    }
}

/// Folds each cycle's committed status into uptime and history.
#[derive(Debug, Clone, Copy, Default)]
pub struct UptimeAggregator {
    policy: UptimePolicy,
}

impl UptimeAggregator {
    pub fn new(policy: UptimePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> UptimePolicy {
        self.policy
    }

    /// Record one cycle and return the updated uptime ratio.
    pub fn record(&self, state: &mut MonitorState, reason: TransitionReason) -> f64 {
        state.uptime = self.policy.apply(state.uptime, state.status);
        state.history.push(Beat::committed(state.status, reason));
        state.uptime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_prefilled_and_bounded() {
        let mut history = History::pending(3);
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|b| *b == Beat::Pending));

        history.push(Beat::Up);
        history.push(Beat::Down);
        history.push(Beat::StringCheckFailed);
        history.push(Beat::Up);
        assert_eq!(history.len(), 3);
        let entries: Vec<_> = history.iter().copied().collect();
        assert_eq!(entries, vec![Beat::Down, Beat::StringCheckFailed, Beat::Up]);
        assert_eq!(history.latest(), Some(Beat::Up));
    }

    #[test]
    fn test_history_resize() {
        let mut history = History::pending(2);
        history.push(Beat::Up);
        history.push(Beat::Down);

        history.resize(4);
        let entries: Vec<_> = history.iter().copied().collect();
        assert_eq!(entries, vec![Beat::Pending, Beat::Pending, Beat::Up, Beat::Down]);

        history.resize(1);
        assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![Beat::Down]);
        assert_eq!(history.capacity(), 1);
    }

    #[test]
    fn test_uptime_stays_in_bounds() {
        let policy = UptimePolicy::default();
        let mut uptime = 100.0;
        for _ in 0..500 {
            uptime = policy.apply(uptime, Status::Down);
            assert!((0.0..=100.0).contains(&uptime));
        }
        assert_eq!(uptime, 0.0);
        for i in 0..5000 {
            let status = if i % 7 == 0 { Status::Down } else { Status::Up };
            uptime = policy.apply(uptime, status);
            assert!((0.0..=100.0).contains(&uptime));
        }
        for _ in 0..2000 {
            uptime = policy.apply(uptime, Status::Up);
        }
        assert_eq!(uptime, 100.0);
    }

    #[test]
    fn test_policy_requires_asymmetry() {
        assert!(UptimePolicy::new(0.1, 0.5).is_some());
        assert!(UptimePolicy::new(0.5, 0.5).is_none());
        assert!(UptimePolicy::new(0.5, 0.1).is_none());
        assert!(UptimePolicy::new(0.0, 0.1).is_none());
        assert!(UptimePolicy::new(f64::NAN, 0.1).is_none());

        let policy = UptimePolicy::default();
        assert!(policy.down_step > policy.up_step);
    }

    #[test]
    fn test_record_appends_every_cycle() {
        let aggregator = UptimeAggregator::default();
        let mut state = MonitorState::new(1, 4);

        // Pending leaves uptime unchanged but still records a beat.
        let uptime = aggregator.record(&mut state, TransitionReason::Unreachable);
        assert_eq!(uptime, 100.0);

        state.status = Status::Down;
        let uptime = aggregator.record(&mut state, TransitionReason::StringCheckFailed);
        assert!((uptime - 99.5).abs() < 1e-9);
        assert_eq!(state.history.latest(), Some(Beat::StringCheckFailed));

        state.status = Status::Up;
        let uptime = aggregator.record(&mut state, TransitionReason::Reachable);
        assert!((uptime - 99.6).abs() < 1e-9);
        assert_eq!(state.history.len(), 4);
    }

    #[test]
    fn test_latency_window() {
        let mut window = LatencyWindow::new(3);
        assert_eq!(window.average(), None);
        for v in [10.0, 20.0, 30.0, 40.0] {
            window.push(v);
        }
        window.push(f64::NAN);
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), Some(30.0));
        assert_eq!(window.min(), Some(20.0));
        assert_eq!(window.max(), Some(40.0));
    }
}
