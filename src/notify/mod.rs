//! Hand-off of transition events to notification channels and webhook
//! triggers.
//!
//! The engine never waits on delivery: each event is dispatched on its own
//! task, retried at most once, and failures are only logged.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::monitor::{Status, TransitionEvent};

/// Delay before the single retry of a failed dispatch.
pub const DISPATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook {url} answered HTTP {status}")]
    Rejected { url: String, status: u16 },
    #[error("dispatch failed: {0}")]
    Failed(String),
}

/// Receives transition events from the scheduler.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        event: &TransitionEvent,
        channels: &BTreeSet<String>,
        trigger_urls: &[String],
    ) -> Result<(), DispatchError>;
}

/// Dispatcher that only writes transitions to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(
        &self,
        event: &TransitionEvent,
        channels: &BTreeSet<String>,
        _trigger_urls: &[String],
    ) -> Result<(), DispatchError> {
        tracing::info!(
            monitor_id = event.monitor_id,
            channels = ?channels,
            "Monitor {} changed {} -> {} ({})",
            event.monitor_name,
            event.previous,
            event.current,
            event.reason
        );
        Ok(())
    }
}

/// Posts the event as JSON to every trigger URL when a monitor goes DOWN.
///
/// Channel delivery (email, chat) belongs to the consumer; channels are
/// logged with the event.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("upwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn dispatch(
        &self,
        event: &TransitionEvent,
        channels: &BTreeSet<String>,
        trigger_urls: &[String],
    ) -> Result<(), DispatchError> {
        LogDispatcher.dispatch(event, channels, trigger_urls).await?;

        if event.current != Status::Down {
            return Ok(());
        }

        let mut first_error = None;
        for url in trigger_urls {
            let outcome = match self.client.post(url).json(event).send().await {
                Ok(resp) if resp.status().is_success() => Ok(()),
                Ok(resp) => Err(DispatchError::Rejected {
                    url: url.clone(),
                    status: resp.status().as_u16(),
                }),
                Err(e) => Err(DispatchError::Http(e)),
            };
            if let Err(e) = outcome {
                tracing::warn!("Trigger {} for monitor {} failed: {}", url, event.monitor_id, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Dispatch an event, retrying once after [`DISPATCH_RETRY_DELAY`].
pub async fn deliver(
    dispatcher: Arc<dyn NotificationDispatcher>,
    event: TransitionEvent,
    channels: BTreeSet<String>,
    trigger_urls: Vec<String>,
    retry_delay: Duration,
) {
    if let Err(e) = dispatcher.dispatch(&event, &channels, &trigger_urls).await {
        tracing::warn!(
            "Dispatch for monitor {} failed, retrying once: {}",
            event.monitor_id,
            e
        );
        tokio::time::sleep(retry_delay).await;
        if let Err(e) = dispatcher.dispatch(&event, &channels, &trigger_urls).await {
            tracing::error!("Dispatch for monitor {} failed: {}", event.monitor_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::TransitionReason;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn event(current: Status) -> TransitionEvent {
        TransitionEvent {
            monitor_id: 5,
            monitor_name: "api".into(),
            previous: Status::Up,
            current,
            latency_ms: None,
            timestamp: Utc::now(),
            reason: TransitionReason::Unreachable,
            error: None,
        }
    }

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl NotificationDispatcher for Flaky {
        async fn dispatch(
            &self,
            _event: &TransitionEvent,
            _channels: &BTreeSet<String>,
            _trigger_urls: &[String],
        ) -> Result<(), DispatchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(DispatchError::Failed("channel offline".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_deliver_retries_at_most_once() {
        let flaky = Arc::new(Flaky { calls: AtomicUsize::new(0), failures: 1 });
        deliver(flaky.clone(), event(Status::Down), BTreeSet::new(), vec![], Duration::ZERO).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let broken = Arc::new(Flaky { calls: AtomicUsize::new(0), failures: usize::MAX });
        deliver(broken.clone(), event(Status::Down), BTreeSet::new(), vec![], Duration::ZERO).await;
        assert_eq!(broken.calls.load(Ordering::SeqCst), 2);

        let healthy = Arc::new(Flaky { calls: AtomicUsize::new(0), failures: 0 });
        deliver(healthy.clone(), event(Status::Down), BTreeSet::new(), vec![], Duration::ZERO).await;
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_webhook_posts_event_on_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = sock.read(&mut buf).await.unwrap();
            let _ = sock
                .write_all(b"HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n")
                .await;
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let dispatcher = WebhookDispatcher::new(Duration::from_secs(2)).unwrap();
        let urls = vec![format!("http://{}/hook", addr)];

        // Recoveries do not fire triggers.
        dispatcher.dispatch(&event(Status::Up), &BTreeSet::new(), &urls).await.unwrap();

        dispatcher.dispatch(&event(Status::Down), &BTreeSet::new(), &urls).await.unwrap();
        let request = received.await.unwrap();
        assert!(request.starts_with("POST /hook"));
    }

    #[tokio::test]
    async fn test_webhook_rejection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        });

        let dispatcher = WebhookDispatcher::new(Duration::from_secs(2)).unwrap();
        let urls = vec![format!("http://{}/hook", addr)];
        let err = dispatcher
            .dispatch(&event(Status::Down), &BTreeSet::new(), &urls)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { status: 500, .. }));
    }
}
