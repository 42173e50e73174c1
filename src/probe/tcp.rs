//! TCP connect probe implementation.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::{elapsed_ms, ProbeError};

/// Run a TCP probe against `host:port`.
///
/// Returns the connect latency in milliseconds. The connection is closed as
/// soon as it is established.
pub async fn run_tcp_probe(host: &str, port: u16, timeout: Duration) -> Result<f64, ProbeError> {
    let start = Instant::now();

    let addr = tokio::time::timeout(timeout, resolve(host, port))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    let remaining = timeout.saturating_sub(start.elapsed());
    let stream = tokio::time::timeout(remaining, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| map_io_error(e, timeout))?;

    let latency = elapsed_ms(start);
    drop(stream);

    Ok(latency)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::DnsFailure(format!("{}: {}", host, e)))?;

    addrs
        .next()
        .ok_or_else(|| ProbeError::DnsFailure(format!("no addresses found for {}", host)))
}

pub(crate) fn map_io_error(e: std::io::Error, timeout: Duration) -> ProbeError {
    match e.kind() {
        ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ProbeError::Timeout(timeout),
        ErrorKind::PermissionDenied => ProbeError::PermissionDenied(e.to_string()),
        _ => ProbeError::Network(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let latency = run_tcp_probe("127.0.0.1", port, Duration::from_secs(2)).await.unwrap();
        assert!(latency >= 0.0);
        assert!(latency < 2000.0);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = run_tcp_probe("127.0.0.1", port, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err, ProbeError::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_tcp_probe_unresolvable_host() {
        let err = run_tcp_probe("does-not-exist.invalid", 80, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::DnsFailure(_) | ProbeError::Timeout(_)));
    }

    #[test]
    fn test_map_io_error() {
        let timeout = Duration::from_secs(1);
        let refused = std::io::Error::from(ErrorKind::ConnectionRefused);
        assert_eq!(map_io_error(refused, timeout), ProbeError::ConnectionRefused);
        let timed_out = std::io::Error::from(ErrorKind::TimedOut);
        assert_eq!(map_io_error(timed_out, timeout), ProbeError::Timeout(timeout));
    }
}
