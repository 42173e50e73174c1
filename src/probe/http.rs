//! HTTP probe implementation.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use reqwest::redirect::Policy;

use super::{elapsed_ms, ProbeError, ProbeResult};
use crate::monitor::HttpTarget;

const DEFAULT_USER_AGENT: &str = concat!("upwatch/", env!("CARGO_PKG_VERSION"));

/// Most of a response body kept for the string check.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Run an HTTP probe against the given target.
///
/// A response below 500 counts as reachable; 4xx only when the target does
/// not treat client errors as down. The body is only read when a string
/// check is configured, and then at most [`MAX_BODY_BYTES`] of it.
pub async fn run_http_probe(target: &HttpTarget, timeout: Duration) -> Result<ProbeResult, ProbeError> {
    let redirects = if target.follow_redirects {
        Policy::limited(target.max_redirects as usize)
    } else {
        Policy::none()
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(redirects)
        .user_agent(target.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let mut request = client.request(target.method.into(), &target.url);
    for header in &target.headers {
        request = request.header(header.key.as_str(), header.value.as_str());
    }

    let start = Instant::now();

    let response = request
        .send()
        .await
        .map_err(|e| classify_error(&e, timeout, target.max_redirects))?;

    let status = response.status();

    let body = match target.string_check() {
        Some(_) => Some(
            read_body(response, MAX_BODY_BYTES)
                .await
                .map_err(|e| classify_error(&e, timeout, target.max_redirects))?,
        ),
        None => None,
    };

    let latency = elapsed_ms(start);
    let code = status.as_u16();

    if status.is_server_error() {
        return Ok(ProbeResult::failure(ProbeError::ServerError(code), latency).with_status(code));
    }
    if status.is_client_error() && target.treat_client_errors_as_down {
        return Ok(ProbeResult::failure(ProbeError::ClientError(code), latency).with_status(code));
    }

    Ok(ProbeResult::success(latency, Some(code), body))
}

/// Read up to `limit` bytes of the body, dropping the rest of the stream.
async fn read_body(mut response: reqwest::Response, limit: usize) -> Result<String, reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let take = chunk.len().min(limit - buf.len());
        buf.extend_from_slice(&chunk[..take]);
        if buf.len() >= limit {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Map a reqwest failure onto a probe error kind.
pub(crate) fn classify_error(e: &reqwest::Error, timeout: Duration, max_redirects: u32) -> ProbeError {
    if e.is_timeout() {
        return ProbeError::Timeout(timeout);
    }
    if e.is_redirect() {
        return ProbeError::TooManyRedirects(max_redirects);
    }

    let mut source: Option<&(dyn StdError + 'static)> = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return ProbeError::ConnectionRefused,
                std::io::ErrorKind::TimedOut => return ProbeError::Timeout(timeout),
                std::io::ErrorKind::PermissionDenied => {
                    return ProbeError::PermissionDenied(io.to_string())
                }
                _ => {}
            }
        }

        let msg = err.to_string().to_lowercase();
        if msg.contains("dns error") || msg.contains("failed to lookup address") {
            return ProbeError::DnsFailure(err.to_string());
        }
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            return ProbeError::Tls(err.to_string());
        }
        if msg.contains("connection refused") {
            return ProbeError::ConnectionRefused;
        }

        source = err.source();
    }

    ProbeError::Network(e.to_string())
}
