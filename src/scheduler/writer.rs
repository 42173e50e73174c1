//! Background writer that serializes every store update.
//!
//! All writes go through one task, so updates for a given monitor reach the
//! store in the order they were made. Failed writes are retried with
//! exponential backoff; if the store stays down they are parked and retried
//! on the next tick, coalescing state updates so the queue stays bounded.
//! Callers queue a delete only after the monitor's worker has exited, so no
//! state write for that id can follow it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::db::{MonitorStore, StoreError};
use crate::monitor::{MonitorId, MonitorSpec, MonitorState};

/// Exponential backoff for store calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base: Duration::from_millis(200),
            max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    tracing::warn!("{} failed (attempt {}/{}), retrying in {:?}: {}", what, attempt + 1, attempts, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub(crate) enum StoreOp {
    SaveSpec(Arc<MonitorSpec>),
    SaveState(MonitorId, Box<MonitorState>),
    Delete(MonitorId),
    /// Try to drain the queue now; replies with the number of writes still parked.
    Flush(oneshot::Sender<usize>),
}

impl StoreOp {
    fn monitor_id(&self) -> Option<MonitorId> {
        match self {
            StoreOp::SaveSpec(spec) => Some(spec.id),
            StoreOp::SaveState(id, _) | StoreOp::Delete(id) => Some(*id),
            StoreOp::Flush(_) => None,
        }
    }
}

/// Handle for queueing store writes.
#[derive(Clone)]
pub(crate) struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreOp>,
}

impl StoreWriter {
    pub fn spawn(store: Arc<dyn MonitorStore>, policy: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_store_writer(rx, store, policy));
        (Self { tx }, handle)
    }

    pub fn save_spec(&self, spec: Arc<MonitorSpec>) {
        self.send(StoreOp::SaveSpec(spec));
    }

    pub fn save_state(&self, id: MonitorId, state: MonitorState) {
        self.send(StoreOp::SaveState(id, Box::new(state)));
    }

    pub fn delete(&self, id: MonitorId) {
        self.send(StoreOp::Delete(id));
    }

    /// Push queued writes now. Returns how many remain unpersisted.
    pub async fn flush(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.send(StoreOp::Flush(tx));
        rx.await.unwrap_or(0)
    }

    fn send(&self, op: StoreOp) {
        if self.tx.send(op).is_err() {
            tracing::debug!("Store writer closed, dropping write");
        }
    }
}

/// Writes waiting for the store, oldest first.
#[derive(Default)]
struct WriteQueue {
    pending: VecDeque<StoreOp>,
}

impl WriteQueue {
    fn push(&mut self, op: StoreOp) {
        match op {
            StoreOp::Delete(id) => {
                self.pending.retain(|p| p.monitor_id() != Some(id));
            }
            StoreOp::SaveState(id, _) => {
                let last = self
                    .pending
                    .iter_mut()
                    .rev()
                    .find(|p| p.monitor_id() == Some(id));
                if let Some(last) = last {
                    if matches!(last, StoreOp::SaveState(..)) {
                        *last = op;
                        return;
                    }
                }
            }
            StoreOp::SaveSpec(_) | StoreOp::Flush(_) => {}
        }
        self.pending.push_back(op);
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Run the writer until every handle is dropped, then flush what is left.
async fn run_store_writer(
    mut rx: mpsc::UnboundedReceiver<StoreOp>,
    store: Arc<dyn MonitorStore>,
    policy: RetryPolicy,
) {
    let mut queue = WriteQueue::default();
    let mut parked_until: Option<Instant> = None;
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            op = rx.recv() => {
                let Some(op) = op else {
                    // Channel closed, flush remaining and exit
                    flush_queue(store.as_ref(), &mut queue, &policy).await;
                    break;
                };

                let mut acks = Vec::new();
                let mut next = Some(op);
                while let Some(op) = next.take() {
                    match op {
                        StoreOp::Flush(ack) => acks.push(ack),
                        other => queue.push(other),
                    }
                    next = rx.try_recv().ok();
                }

                let parked = parked_until.is_some_and(|t| Instant::now() < t);
                if !acks.is_empty() || !parked {
                    parked_until = flush_queue(store.as_ref(), &mut queue, &policy)
                        .await
                        .then(|| Instant::now() + policy.max);
                }
                for ack in acks {
                    let _ = ack.send(queue.len());
                }
            }
            _ = interval.tick() => {
                let parked = parked_until.is_some_and(|t| Instant::now() < t);
                if !queue.is_empty() && !parked {
                    parked_until = flush_queue(store.as_ref(), &mut queue, &policy)
                        .await
                        .then(|| Instant::now() + policy.max);
                }
            }
        }
    }
}

/// Write queued ops in order. Returns true if the store gave up and writes remain.
async fn flush_queue(store: &dyn MonitorStore, queue: &mut WriteQueue, policy: &RetryPolicy) -> bool {
    while let Some(op) = queue.pending.front() {
        let result = policy.run("Store write", || apply(store, op)).await;
        match result {
            Ok(()) => {
                queue.pending.pop_front();
            }
            Err(e) => {
                tracing::error!(
                    "Store unavailable, {} writes queued until it recovers: {}",
                    queue.len(),
                    e
                );
                return true;
            }
        }
    }
    false
}

async fn apply(store: &dyn MonitorStore, op: &StoreOp) -> Result<(), StoreError> {
    match op {
        StoreOp::SaveSpec(spec) => store.save(spec).await,
        StoreOp::SaveState(id, state) => store.save_runtime_state(*id, state).await,
        StoreOp::Delete(id) => store.delete(*id).await,
        StoreOp::Flush(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::monitor::{Status, Target};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        }
    }

    fn spec(id: MonitorId) -> Arc<MonitorSpec> {
        Arc::new(MonitorSpec::new(id, "db", Target::Tcp { host: "db".into(), port: 5432 }))
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy {
            attempts: 6,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1000));
        assert_eq!(policy.delay(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let mut calls = 0;
        let result: Result<(), StoreError> = fast_policy()
            .run("test", || {
                calls += 1;
                async { Err(StoreError::Unavailable("down".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_queue_coalesces_state_writes() {
        let mut queue = WriteQueue::default();
        queue.push(StoreOp::SaveSpec(spec(1)));
        queue.push(StoreOp::SaveState(1, Box::new(MonitorState::new(1, 3))));
        let mut down = MonitorState::new(1, 3);
        down.status = Status::Down;
        queue.push(StoreOp::SaveState(1, Box::new(down)));
        queue.push(StoreOp::SaveState(2, Box::new(MonitorState::new(2, 3))));
        assert_eq!(queue.len(), 3);

        match &queue.pending[1] {
            StoreOp::SaveState(1, state) => assert_eq!(state.status, Status::Down),
            _ => panic!("expected the latest state for monitor 1"),
        }
    }

    #[test]
    fn test_delete_drops_queued_writes_only() {
        let mut queue = WriteQueue::default();
        queue.push(StoreOp::SaveSpec(spec(1)));
        queue.push(StoreOp::SaveState(1, Box::new(MonitorState::new(1, 3))));
        queue.push(StoreOp::SaveSpec(spec(2)));
        queue.push(StoreOp::Delete(1));
        assert_eq!(queue.len(), 2);
        assert!(matches!(queue.pending[1], StoreOp::Delete(1)));

        // Nothing about the deleted id outlives the delete itself.
        queue.pending.clear();
        queue.push(StoreOp::SaveSpec(spec(1)));
        queue.push(StoreOp::SaveState(1, Box::new(MonitorState::new(1, 3))));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_writes_survive_store_outage() {
        let store = Arc::new(MemoryStore::new());
        store.set_online(false);
        let (writer, _task) = StoreWriter::spawn(store.clone(), fast_policy());

        writer.save_spec(spec(1));
        writer.save_state(1, MonitorState::new(1, 3));
        assert_eq!(writer.flush().await, 2);
        assert!(store.monitor(1).is_none());

        store.set_online(true);
        assert_eq!(writer.flush().await, 0);
        assert!(store.monitor(1).is_some());
        assert!(store.state(1).is_some());
    }

    #[tokio::test]
    async fn test_closing_writer_flushes() {
        let store = Arc::new(MemoryStore::new());
        let (writer, task) = StoreWriter::spawn(store.clone(), fast_policy());
        writer.save_spec(spec(3));
        drop(writer);
        task.await.unwrap();
        assert!(store.monitor(3).is_some());
    }
}
