//! Scheduler module for registering monitors and running their probe loops.

mod worker;
mod writer;

pub use writer::RetryPolicy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::db::{MonitorStore, StoreError};
use crate::monitor::{ConfigError, MonitorId, MonitorSpec, MonitorState, Status, UptimeAggregator};
use crate::notify::{NotificationDispatcher, DISPATCH_RETRY_DELAY};
use crate::probe::{self, CancelToken, Prober};

use worker::{ManualRequest, Worker, WorkerContext};
use writer::StoreWriter;

/// Manual checks queued per monitor before callers start waiting to enqueue.
const MANUAL_QUEUE_DEPTH: usize = 16;

/// How long shutdown waits for each worker to exit.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid monitor {id}: {source}")]
    Config { id: MonitorId, source: ConfigError },
    #[error("monitor {0} is already registered")]
    DuplicateId(MonitorId),
    #[error("monitor {0} is not registered")]
    NotFound(MonitorId),
    #[error("check for monitor {0} was cancelled")]
    Cancelled(MonitorId),
    #[error("monitor {0} stopped before the check completed")]
    Stopped(MonitorId),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A monitor's definition together with its latest published state.
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub spec: Arc<MonitorSpec>,
    pub state: Arc<MonitorState>,
}

/// Counts across every registered monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub total: usize,
    pub up: usize,
    pub down: usize,
    pub pending: usize,
    /// Mean uptime ratio; 100 when nothing is registered.
    pub average_uptime: f64,
}

struct MonitorHandle {
    spec_tx: watch::Sender<Arc<MonitorSpec>>,
    snapshot_rx: watch::Receiver<Arc<MonitorState>>,
    manual_tx: mpsc::Sender<ManualRequest>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            spec: self.spec_tx.borrow().clone(),
            state: self.snapshot_rx.borrow().clone(),
        }
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Owns one worker task per registered monitor.
///
/// Workers probe independently: a hung target only delays its own monitor,
/// while the shared probe pool bounds how many probes run at once.
pub struct Scheduler {
    config: EngineConfig,
    store: Arc<dyn MonitorStore>,
    ctx: Arc<WorkerContext>,
    monitors: Arc<RwLock<HashMap<MonitorId, MonitorHandle>>>,
    retry: RetryPolicy,
}

impl Scheduler {
    /// Create a scheduler. Spawns the store writer, so this needs a runtime.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn MonitorStore>,
        prober: Arc<dyn Prober>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        let retry = RetryPolicy {
            attempts: config.store_retry_attempts,
            base: config.store_retry_base,
            ..RetryPolicy::default()
        };
        let (writer, _) = StoreWriter::spawn(store.clone(), retry);

        let ctx = Arc::new(WorkerContext {
            prober,
            dispatcher,
            pool: Arc::new(Semaphore::new(config.max_concurrent_probes.max(1))),
            writer,
            aggregator: UptimeAggregator::new(config.uptime),
            dispatch_retry_delay: DISPATCH_RETRY_DELAY,
        });

        Self {
            config,
            store,
            ctx,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            retry,
        }
    }

    /// Load every stored monitor and start probing. Returns how many started.
    ///
    /// Definitions that no longer validate are skipped with an error log.
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        probe::log_icmp_capability();

        let store = self.store.clone();
        let specs = self
            .retry
            .run("Loading monitors", || store.load_all())
            .await?;

        tracing::info!("Starting scheduler with {} monitors", specs.len());

        let mut started = 0;
        for spec in specs {
            if let Err(e) = spec.validate(self.config.min_interval) {
                tracing::error!("Skipping stored monitor {} ({}): {}", spec.id, spec.name, e);
                continue;
            }

            let id = spec.id;
            let state = match self.retry.run("Loading monitor state", || store.load_runtime_state(id)).await {
                Ok(Some(state)) => state.restore(id, self.config.history_capacity),
                Ok(None) => MonitorState::new(id, self.config.history_capacity),
                Err(e) => {
                    tracing::warn!("Starting monitor {} with fresh state: {}", id, e);
                    MonitorState::new(id, self.config.history_capacity)
                }
            };

            match self.spawn_worker(Arc::new(spec), state, false).await {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!("{}", e),
            }
        }

        Ok(started)
    }

    /// Register a new monitor and persist its definition.
    pub async fn register(&self, spec: MonitorSpec) -> Result<(), SchedulerError> {
        self.validate(&spec)?;
        let state = MonitorState::new(spec.id, self.config.history_capacity);
        self.spawn_worker(Arc::new(spec), state, true).await
    }

    /// Swap in a new definition for a running monitor.
    ///
    /// An in-flight probe finishes under the old definition; later ticks use
    /// the new one. Runtime state is kept.
    pub async fn update(&self, spec: MonitorSpec) -> Result<(), SchedulerError> {
        self.validate(&spec)?;
        let monitors = self.monitors.read().await;
        let handle = monitors.get(&spec.id).ok_or(SchedulerError::NotFound(spec.id))?;

        tracing::info!("Scheduler: Updating monitor {} ({})", spec.id, spec.name);
        let spec = Arc::new(spec);
        handle.spec_tx.send_replace(spec.clone());
        self.ctx.writer.save_spec(spec);
        Ok(())
    }

    /// Stop probing a monitor. Returns false if it was not registered.
    ///
    /// A probe still in flight is abandoned and its result never committed.
    /// The stored definition is kept; see [`Scheduler::remove`].
    pub async fn unregister(&self, id: MonitorId) -> bool {
        self.detach(id).await.is_some()
    }

    /// Unregister a monitor and delete its definition and state from the store.
    ///
    /// The delete is queued once the worker has exited, so a commit racing
    /// the removal cannot write state back afterwards.
    pub async fn remove(&self, id: MonitorId) -> bool {
        let Some(mut task) = self.detach(id).await else {
            self.ctx.writer.delete(id);
            return false;
        };
        if tokio::time::timeout(WORKER_STOP_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!("Monitor {} worker did not stop in time, aborting it", id);
            task.abort();
        }
        self.ctx.writer.delete(id);
        true
    }

    async fn detach(&self, id: MonitorId) -> Option<JoinHandle<()>> {
        let handle = self.monitors.write().await.remove(&id)?;
        handle.stop();
        tracing::info!("Scheduler: Removed monitor {}", id);
        Some(handle.task)
    }

    /// Probe a monitor now and return the state committed by that probe,
    /// paired with the definition it ran under.
    ///
    /// If a probe is already in flight the request joins it. When `cancel`
    /// fires, the caller gets [`SchedulerError::Cancelled`] right away; a probe
    /// started by this request is aborted and nothing is committed.
    pub async fn manual_check(
        &self,
        id: MonitorId,
        cancel: Option<CancelToken>,
    ) -> Result<MonitorSnapshot, SchedulerError> {
        let manual_tx = {
            let monitors = self.monitors.read().await;
            let handle = monitors.get(&id).ok_or(SchedulerError::NotFound(id))?;
            handle.manual_tx.clone()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ManualRequest {
            reply: reply_tx,
            cancel: cancel.clone(),
        };

        let exchange = async {
            manual_tx
                .send(request)
                .await
                .map_err(|_| SchedulerError::Stopped(id))?;
            match reply_rx.await {
                Ok(Some(committed)) => Ok(committed),
                Ok(None) => Err(SchedulerError::Cancelled(id)),
                Err(_) => Err(SchedulerError::Stopped(id)),
            }
        };

        let (spec, state) = tokio::select! {
            res = exchange => res?,
            _ = probe::wait_cancelled(cancel.as_ref()) => return Err(SchedulerError::Cancelled(id)),
        };

        Ok(MonitorSnapshot { spec, state })
    }

    /// Latest state of one monitor.
    pub async fn get_snapshot(&self, id: MonitorId) -> Option<MonitorSnapshot> {
        self.monitors.read().await.get(&id).map(MonitorHandle::snapshot)
    }

    /// Latest state of every monitor, ordered by id.
    pub async fn list_snapshots(&self) -> Vec<MonitorSnapshot> {
        let mut snapshots: Vec<_> = self
            .monitors
            .read()
            .await
            .values()
            .map(MonitorHandle::snapshot)
            .collect();
        snapshots.sort_by_key(|s| s.spec.id);
        snapshots
    }

    pub async fn summary(&self) -> Summary {
        let monitors = self.monitors.read().await;
        let mut summary = Summary {
            total: monitors.len(),
            ..Summary::default()
        };
        let mut uptime_sum = 0.0;
        for handle in monitors.values() {
            let state = handle.snapshot_rx.borrow();
            match state.status {
                Status::Up => summary.up += 1,
                Status::Down => summary.down += 1,
                Status::Pending => summary.pending += 1,
            }
            uptime_sum += state.uptime;
        }
        summary.average_uptime = if summary.total == 0 {
            100.0
        } else {
            uptime_sum / summary.total as f64
        };
        summary
    }

    /// Push queued store writes now. Returns how many are still waiting on the store.
    pub async fn flush_store(&self) -> usize {
        self.ctx.writer.flush().await
    }

    /// Stop every worker and flush pending store writes.
    pub async fn shutdown(&self) {
        let handles: Vec<MonitorHandle> = self.monitors.write().await.drain().map(|(_, h)| h).collect();
        tracing::info!("Stopping scheduler with {} monitors", handles.len());

        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            if tokio::time::timeout(WORKER_STOP_TIMEOUT, handle.task).await.is_err() {
                tracing::warn!("A monitor worker did not stop in time");
            }
        }

        let unsaved = self.ctx.writer.flush().await;
        if unsaved > 0 {
            tracing::error!("{} store writes could not be persisted", unsaved);
        }
    }

    fn validate(&self, spec: &MonitorSpec) -> Result<(), SchedulerError> {
        spec.validate(self.config.min_interval)
            .map_err(|source| SchedulerError::Config { id: spec.id, source })
    }

    /// Start a worker for `spec`. With `persist`, the definition is queued for
    /// the store ahead of any state the worker commits.
    async fn spawn_worker(
        &self,
        spec: Arc<MonitorSpec>,
        state: MonitorState,
        persist: bool,
    ) -> Result<(), SchedulerError> {
        let mut monitors = self.monitors.write().await;
        if monitors.contains_key(&spec.id) {
            return Err(SchedulerError::DuplicateId(spec.id));
        }
        if persist {
            self.ctx.writer.save_spec(spec.clone());
        }

        tracing::info!("Scheduler: Adding {} monitor {} ({})", spec.kind(), spec.id, spec.name);

        let (spec_tx, spec_rx) = watch::channel(spec.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(state.clone()));
        let (manual_tx, manual_rx) = mpsc::channel(MANUAL_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = Worker {
            spec: spec.clone(),
            spec_rx,
            state,
            snapshot_tx,
            manual_rx,
            stop_rx,
            ctx: self.ctx.clone(),
        };
        let task = tokio::spawn(worker.run(self.first_tick()));

        monitors.insert(
            spec.id,
            MonitorHandle {
                spec_tx,
                snapshot_rx,
                manual_tx,
                stop_tx,
                task,
            },
        );
        Ok(())
    }

    /// Random delay before a new worker's first probe, so a restart does not
    /// fire every monitor at once.
    fn first_tick(&self) -> Duration {
        let max_ms = self.config.startup_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}
