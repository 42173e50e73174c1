//! Per-monitor probe loop.
//!
//! Each registered monitor owns one worker task. The worker is the only writer
//! of its monitor's state, runs at most one probe at a time, and commits each
//! cycle before the next can start.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::Instant;

use super::writer::StoreWriter;
use crate::monitor::{Candidate, MonitorSpec, MonitorState, Status, StatusEvaluator, Target, UptimeAggregator};
use crate::notify::{self, NotificationDispatcher};
use crate::probe::{self, CancelToken, ProbeError, ProbeResult, Prober};

/// Pool waits longer than this are logged.
const POOL_WAIT_WARN: Duration = Duration::from_millis(250);

/// Shared dependencies of every worker.
pub(crate) struct WorkerContext {
    pub prober: Arc<dyn Prober>,
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    pub pool: Arc<Semaphore>,
    pub writer: StoreWriter,
    pub aggregator: UptimeAggregator,
    pub dispatch_retry_delay: Duration,
}

/// State committed by a cycle, with the definition the probe ran under.
pub(crate) type Committed = (Arc<MonitorSpec>, Arc<MonitorState>);

/// A manual check waiting for the next committed state.
///
/// The reply is `None` when the probe it waited on was cancelled.
pub(crate) struct ManualRequest {
    pub reply: oneshot::Sender<Option<Committed>>,
    pub cancel: Option<CancelToken>,
}

pub(crate) struct Worker {
    pub spec: Arc<MonitorSpec>,
    pub spec_rx: watch::Receiver<Arc<MonitorSpec>>,
    pub state: MonitorState,
    pub snapshot_tx: watch::Sender<Arc<MonitorState>>,
    pub manual_rx: mpsc::Receiver<ManualRequest>,
    pub stop_rx: watch::Receiver<bool>,
    pub ctx: Arc<WorkerContext>,
}

impl Worker {
    /// Run until stopped. The first scheduled probe fires after `first_tick`.
    pub async fn run(mut self, first_tick: Duration) {
        let mut deadline = Instant::now() + first_tick;
        // Baseline of the last scheduled tick; `None` until the first one fires.
        let mut last_scheduled: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => break,
                changed = self.spec_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.spec = self.spec_rx.borrow_and_update().clone();
                    tracing::debug!("Monitor {}: definition updated", self.spec.id);
                    if let Some(scheduled) = last_scheduled {
                        deadline = next_deadline(scheduled, self.spec.interval, Instant::now());
                    }
                }
                Some(req) = self.manual_rx.recv() => {
                    let cancel = req.cancel.clone();
                    if self.cycle(vec![req], cancel).await.is_break() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let scheduled = deadline;
                    last_scheduled = Some(scheduled);
                    if self.cycle(Vec::new(), None).await.is_break() {
                        break;
                    }
                    // An update that landed mid-probe sets the next tick.
                    if self.spec_rx.has_changed().unwrap_or(false) {
                        self.spec = self.spec_rx.borrow_and_update().clone();
                    }
                    deadline = next_deadline(scheduled, self.spec.interval, Instant::now());
                }
            }
        }

        tracing::debug!("Monitor {}: worker stopped", self.spec.id);
    }

    /// One probe cycle. Manual requests arriving while the probe is in flight
    /// join it instead of starting another.
    async fn cycle(&mut self, mut joiners: Vec<ManualRequest>, cancel: Option<CancelToken>) -> ControlFlow<()> {
        let spec = self.spec.clone();
        self.set_checking(true);

        let ctx = self.ctx.clone();
        let probe_spec = spec.clone();
        let queued_at = Instant::now();
        let mut task = tokio::spawn(async move {
            let permit = tokio::select! {
                permit = ctx.pool.clone().acquire_owned() => permit.ok(),
                _ = probe::wait_cancelled(cancel.as_ref()) => {
                    return (ProbeResult::failure(ProbeError::Cancelled, 0.0), queued_at.elapsed());
                }
            };
            let waited = queued_at.elapsed();
            let result = probe::execute(ctx.prober.as_ref(), &probe_spec, cancel.as_ref()).await;
            drop(permit);
            (result, waited)
        });

        let joined = loop {
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    // Detached: the probe runs out its timeout and the result
                    // is dropped. Joiners see the worker go away.
                    drop(task);
                    tracing::debug!("Monitor {}: stopped with a probe in flight", spec.id);
                    return ControlFlow::Break(());
                }
                Some(req) = self.manual_rx.recv() => joiners.push(req),
                res = &mut task => break res,
            }
        };

        let (result, waited) = match joined {
            Ok(out) => out,
            Err(e) => (
                ProbeResult::failure(ProbeError::Network(format!("probe task failed: {}", e)), 0.0),
                Duration::ZERO,
            ),
        };
        if waited > POOL_WAIT_WARN {
            tracing::debug!("Monitor {}: probe waited {:?} for a pool slot", spec.id, waited);
        }

        if result.is_cancelled() {
            tracing::debug!("Monitor {}: manual check cancelled, nothing committed", spec.id);
            self.set_checking(false);
            for j in joiners {
                let _ = j.reply.send(None);
            }
            return ControlFlow::Continue(());
        }

        let snapshot = self.commit(&spec, result);
        for j in joiners {
            let _ = j.reply.send(Some((spec.clone(), snapshot.clone())));
        }
        ControlFlow::Continue(())
    }

    /// Evaluate a finished probe and publish the new state.
    fn commit(&mut self, spec: &MonitorSpec, result: ProbeResult) -> Arc<MonitorState> {
        let now = Utc::now();

        let string_match = match &spec.target {
            Target::Http(http) if result.reachable => http
                .string_check()
                .map(|expected| probe::matches(result.body.as_deref().unwrap_or(""), expected)),
            _ => None,
        };
        let candidate = Candidate::from_probe(&result, string_match);
        let evaluation = StatusEvaluator::evaluate(&mut self.state, spec, &result, candidate, now);

        self.state.checking = false;
        self.state.last_checked_at = Some(now);
        self.state.last_latency_ms = result.reachable.then_some(result.latency_ms);
        self.state.last_error = result.error.clone();
        self.state.string_check_result = string_match;
        if result.reachable {
            self.state.latencies.push(result.latency_ms);
        }
        let uptime = self.ctx.aggregator.record(&mut self.state, candidate.reason());

        match &result.error {
            Some(e) => tracing::debug!(
                "Monitor {} probe failed ({}/{}): {}",
                spec.name,
                self.state.consecutive_failures,
                spec.retries + 1,
                e
            ),
            None => tracing::debug!("Monitor {} probe ok in {:.1}ms", spec.name, result.latency_ms),
        }

        let snapshot = Arc::new(self.state.clone());
        self.snapshot_tx.send_replace(snapshot.clone());
        self.ctx.writer.save_state(spec.id, self.state.clone());

        if let Some(event) = evaluation.event {
            if event.current == Status::Down {
                tracing::warn!(
                    "Monitor {} is DOWN ({}), uptime {:.1}%",
                    spec.name,
                    event.reason,
                    uptime
                );
            } else {
                tracing::info!("Monitor {} is {}, uptime {:.1}%", spec.name, event.current, uptime);
            }
            tokio::spawn(notify::deliver(
                self.ctx.dispatcher.clone(),
                event,
                spec.notification_channels.clone(),
                spec.trigger_urls.clone(),
                self.ctx.dispatch_retry_delay,
            ));
        }

        snapshot
    }

    fn set_checking(&mut self, checking: bool) {
        self.state.checking = checking;
        self.snapshot_tx.send_replace(Arc::new(self.state.clone()));
    }
}

/// Deadline after a tick scheduled at `scheduled`. Ticks missed while a probe
/// overran collapse into one immediate tick.
pub(crate) fn next_deadline(scheduled: Instant, interval: Duration, now: Instant) -> Instant {
    let next = scheduled + interval;
    if next <= now {
        now
    } else {
        next
    }
}
