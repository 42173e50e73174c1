//! Probe module for network monitoring.
//!
//! Supports HTTP, TCP and Ping probes, plus the substring check applied to
//! HTTP bodies.

mod http;
mod matcher;
mod ping;
mod tcp;

pub use http::*;
pub use matcher::*;
pub use ping::*;
pub use tcp::*;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::monitor::{MonitorSpec, Target};

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeError {
    #[error("dns resolution failed: {0}")]
    DnsFailure(String),
    #[error("connection refused")]
    ConnectionRefused,
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(u32),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("server error: HTTP {0}")]
    ServerError(u16),
    #[error("client error: HTTP {0}")]
    ClientError(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("probe cancelled")]
    Cancelled,
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    /// Response body, kept only when a string check needs it.
    pub body: Option<String>,
    pub error: Option<ProbeError>,
}

impl ProbeResult {
    pub fn success(latency_ms: f64, status_code: Option<u16>, body: Option<String>) -> Self {
        Self {
            reachable: true,
            latency_ms,
            status_code,
            body,
            error: None,
        }
    }

    pub fn failure(error: ProbeError, latency_ms: f64) -> Self {
        Self {
            reachable: false,
            latency_ms,
            status_code: None,
            body: None,
            error: Some(error),
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(ProbeError::Cancelled))
    }
}

/// Performs one check against a monitor's target.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, spec: &MonitorSpec) -> ProbeResult;
}

/// Prober backed by real network I/O.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkProber;

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, spec: &MonitorSpec) -> ProbeResult {
        run_probe(spec).await
    }
}

/// Run a probe with the given monitor definition.
pub async fn run_probe(spec: &MonitorSpec) -> ProbeResult {
    let start = Instant::now();

    let result = match &spec.target {
        Target::Http(http) => run_http_probe(http, spec.timeout).await,
        Target::Tcp { host, port } => run_tcp_probe(host, *port, spec.timeout)
            .await
            .map(|latency| ProbeResult::success(latency, None, None)),
        Target::Ping { host } => run_ping_probe(host, spec.timeout)
            .await
            .map(|latency| ProbeResult::success(latency, None, None)),
    };

    match result {
        // Enforce timeout check
        Ok(r) if r.latency_ms >= duration_ms(spec.timeout) => {
            ProbeResult::failure(ProbeError::Timeout(spec.timeout), r.latency_ms)
        }
        Ok(r) => r,
        Err(e) => ProbeResult::failure(e, elapsed_ms(start)),
    }
}

/// Run `prober` under the monitor's timeout, aborting early if `cancel` fires.
///
/// Never takes longer than `spec.timeout`; a probe that overruns is reported
/// as [`ProbeError::Timeout`] and a cancelled one as [`ProbeError::Cancelled`].
pub async fn execute(
    prober: &dyn Prober,
    spec: &MonitorSpec,
    cancel: Option<&CancelToken>,
) -> ProbeResult {
    let start = Instant::now();

    tokio::select! {
        res = tokio::time::timeout(spec.timeout, prober.probe(spec)) => match res {
            Ok(result) => result,
            Err(_) => ProbeResult::failure(ProbeError::Timeout(spec.timeout), elapsed_ms(start)),
        },
        _ = wait_cancelled(cancel) => ProbeResult::failure(ProbeError::Cancelled, elapsed_ms(start)),
    }
}

/// Resolves when `cancel` fires; never resolves without a token.
pub async fn wait_cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

/// Caller side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation signal handed to a manual check.
///
/// Dropping the [`CancelHandle`] without calling `cancel` never cancels.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    duration_ms(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Target;

    struct Hang;

    #[async_trait]
    impl Prober for Hang {
        async fn probe(&self, _spec: &MonitorSpec) -> ProbeResult {
            std::future::pending().await
        }
    }

    fn spec(timeout: Duration) -> MonitorSpec {
        let mut spec = MonitorSpec::new(1, "hang", Target::Ping { host: "127.0.0.1".into() });
        spec.timeout = timeout;
        spec
    }

    #[tokio::test]
    async fn test_execute_enforces_timeout() {
        let start = Instant::now();
        let result = execute(&Hang, &spec(Duration::from_millis(50)), None).await;
        assert!(!result.reachable);
        assert_eq!(result.error, Some(ProbeError::Timeout(Duration::from_millis(50))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_execute_honours_cancellation() {
        let (handle, token) = CancelToken::new();
        let spec = spec(Duration::from_secs(30));

        let task = tokio::spawn(async move { execute(&Hang, &spec, Some(&token)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_handle_never_cancels() {
        let (handle, token) = CancelToken::new();
        drop(handle);
        assert!(!token.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(30), token.cancelled()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_probe_error_serialization() {
        let json = serde_json::to_value(ProbeError::ConnectionRefused).unwrap();
        assert_eq!(json["kind"], "connection_refused");
        let json = serde_json::to_value(ProbeError::TooManyRedirects(3)).unwrap();
        assert_eq!(json["detail"], 3);
    }
}
