//! Monitor definitions and their validation.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identifier of a monitor.
pub type MonitorId = i64;

/// Rejected monitor definition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("interval {interval:?} is below the minimum of {min:?}")]
    IntervalTooShort { interval: Duration, min: Duration },
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("timeout {timeout:?} exceeds interval {interval:?}")]
    TimeoutExceedsInterval { timeout: Duration, interval: Duration },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid header {0}")]
    InvalidHeader(String),
    #[error("string check is enabled but no expected string is set")]
    MissingExpectedString,
    #[error("host must not be empty")]
    EmptyHost,
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("invalid trigger url {0}")]
    InvalidTriggerUrl(String),
}

/// The protocol a monitor probes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MonitorKind {
    Http,
    Tcp,
    Ping,
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorKind::Http => "HTTP",
            MonitorKind::Tcp => "TCP",
            MonitorKind::Ping => "PING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Head,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

/// HTTP(S) target configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTarget {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    #[serde(default)]
    pub expected_string: Option<String>,
    #[serde(default)]
    pub string_check_enabled: bool,
    /// Report 4xx responses as unreachable instead of reachable.
    #[serde(default)]
    pub treat_client_errors_as_down: bool,
}

fn default_follow_redirects() -> bool {
    true
}

fn default_max_redirects() -> u32 {
    10
}

impl HttpTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: Vec::new(),
            user_agent: None,
            follow_redirects: default_follow_redirects(),
            max_redirects: default_max_redirects(),
            expected_string: None,
            string_check_enabled: false,
            treat_client_errors_as_down: false,
        }
    }

    /// The substring to look for, if the string check applies.
    pub fn string_check(&self) -> Option<&str> {
        if self.string_check_enabled {
            self.expected_string.as_deref()
        } else {
            None
        }
    }
}

/// What a monitor probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum Target {
    Http(HttpTarget),
    Tcp { host: String, port: u16 },
    Ping { host: String },
}

impl Target {
    pub fn kind(&self) -> MonitorKind {
        match self {
            Target::Http(_) => MonitorKind::Http,
            Target::Tcp { .. } => MonitorKind::Tcp,
            Target::Ping { .. } => MonitorKind::Ping,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Http(http) => write!(f, "{}", http.url),
            Target::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Target::Ping { host } => write!(f, "{}", host),
        }
    }
}

/// A monitor definition. Immutable once handed to the scheduler; updates
/// replace the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSpec {
    pub id: MonitorId,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub target: Target,
    pub interval: Duration,
    pub timeout: Duration,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub notification_channels: BTreeSet<String>,
    #[serde(default)]
    pub trigger_urls: Vec<String>,
}

impl MonitorSpec {
    /// A spec with a 60s interval, 10s timeout and no retries.
    pub fn new(id: MonitorId, name: impl Into<String>, target: Target) -> Self {
        Self {
            id,
            name: name.into(),
            group: None,
            target,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            retries: 0,
            notification_channels: BTreeSet::new(),
            trigger_urls: Vec::new(),
        }
    }

    pub fn kind(&self) -> MonitorKind {
        self.target.kind()
    }

    /// Check the definition against the engine's constraints.
    pub fn validate(&self, min_interval: Duration) -> Result<(), ConfigError> {
        if self.interval.is_zero() || self.interval < min_interval {
            return Err(ConfigError::IntervalTooShort {
                interval: self.interval,
                min: min_interval,
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.timeout > self.interval {
            return Err(ConfigError::TimeoutExceedsInterval {
                timeout: self.timeout,
                interval: self.interval,
            });
        }

        match &self.target {
            Target::Http(http) => validate_http(http)?,
            Target::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return Err(ConfigError::EmptyHost);
                }
                if *port == 0 {
                    return Err(ConfigError::InvalidPort);
                }
            }
            Target::Ping { host } => {
                if host.trim().is_empty() {
                    return Err(ConfigError::EmptyHost);
                }
            }
        }

        for url in &self.trigger_urls {
            match reqwest::Url::parse(url) {
                Ok(u) if matches!(u.scheme(), "http" | "https") => {}
                _ => return Err(ConfigError::InvalidTriggerUrl(url.clone())),
            }
        }

        Ok(())
    }
}

fn validate_http(http: &HttpTarget) -> Result<(), ConfigError> {
    let url = reqwest::Url::parse(&http.url).map_err(|e| ConfigError::InvalidUrl {
        url: http.url.clone(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            url: http.url.clone(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }

    for header in &http.headers {
        if HeaderName::from_bytes(header.key.as_bytes()).is_err()
            || HeaderValue::from_str(&header.value).is_err()
        {
            return Err(ConfigError::InvalidHeader(header.key.clone()));
        }
    }
    if let Some(agent) = &http.user_agent {
        if HeaderValue::from_str(agent).is_err() {
            return Err(ConfigError::InvalidHeader("user-agent".into()));
        }
    }

    if http.string_check_enabled
        && http.expected_string.as_deref().map_or(true, str::is_empty)
    {
        return Err(ConfigError::MissingExpectedString);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(5);

    fn http_spec(url: &str) -> MonitorSpec {
        MonitorSpec::new(1, "web", Target::Http(HttpTarget::new(url)))
    }

    #[test]
    fn test_valid_specs() {
        assert!(http_spec("https://example.com/status").validate(MIN).is_ok());

        let tcp = MonitorSpec::new(
            2,
            "db",
            Target::Tcp { host: "db.example.com".into(), port: 5432 },
        );
        assert!(tcp.validate(MIN).is_ok());

        let ping = MonitorSpec::new(3, "router", Target::Ping { host: "192.168.1.1".into() });
        assert!(ping.validate(MIN).is_ok());
    }

    #[test]
    fn test_interval_and_timeout_rules() {
        let mut spec = http_spec("https://example.com");
        spec.interval = Duration::from_secs(2);
        spec.timeout = Duration::from_secs(1);
        assert!(matches!(spec.validate(MIN), Err(ConfigError::IntervalTooShort { .. })));

        spec.interval = Duration::ZERO;
        assert!(matches!(
            spec.validate(Duration::ZERO),
            Err(ConfigError::IntervalTooShort { .. })
        ));

        spec.interval = Duration::from_secs(30);
        spec.timeout = Duration::ZERO;
        assert_eq!(spec.validate(MIN), Err(ConfigError::ZeroTimeout));

        spec.timeout = Duration::from_secs(31);
        assert!(matches!(
            spec.validate(MIN),
            Err(ConfigError::TimeoutExceedsInterval { .. })
        ));

        spec.timeout = Duration::from_secs(30);
        assert!(spec.validate(MIN).is_ok());
    }

    #[test]
    fn test_http_target_rules() {
        assert!(matches!(
            http_spec("not a url").validate(MIN),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            http_spec("ftp://example.com").validate(MIN),
            Err(ConfigError::InvalidUrl { .. })
        ));

        let mut target = HttpTarget::new("https://example.com");
        target.string_check_enabled = true;
        let spec = MonitorSpec::new(1, "web", Target::Http(target.clone()));
        assert_eq!(spec.validate(MIN), Err(ConfigError::MissingExpectedString));

        target.expected_string = Some("ok".into());
        target.headers.push(Header { key: "bad header".into(), value: "x".into() });
        let spec = MonitorSpec::new(1, "web", Target::Http(target));
        assert!(matches!(spec.validate(MIN), Err(ConfigError::InvalidHeader(_))));

        let mut target = HttpTarget::new("https://example.com");
        target.user_agent = Some("bad\nagent".into());
        let spec = MonitorSpec::new(1, "web", Target::Http(target.clone()));
        assert_eq!(spec.validate(MIN), Err(ConfigError::InvalidHeader("user-agent".into())));

        target.user_agent = Some("upwatch-test/1.0".into());
        let spec = MonitorSpec::new(1, "web", Target::Http(target));
        assert!(spec.validate(MIN).is_ok());
    }

    #[test]
    fn test_tcp_and_trigger_rules() {
        let spec = MonitorSpec::new(1, "db", Target::Tcp { host: "db".into(), port: 0 });
        assert_eq!(spec.validate(MIN), Err(ConfigError::InvalidPort));

        let spec = MonitorSpec::new(1, "db", Target::Ping { host: "  ".into() });
        assert_eq!(spec.validate(MIN), Err(ConfigError::EmptyHost));

        let mut spec = http_spec("https://example.com");
        spec.trigger_urls.push("mailto:ops@example.com".into());
        assert!(matches!(spec.validate(MIN), Err(ConfigError::InvalidTriggerUrl(_))));
    }

    #[test]
    fn test_string_check_only_when_enabled() {
        let mut target = HttpTarget::new("https://example.com");
        target.expected_string = Some("healthy".into());
        assert_eq!(target.string_check(), None);
        target.string_check_enabled = true;
        assert_eq!(target.string_check(), Some("healthy"));
    }

    #[test]
    fn test_spec_json_shape() {
        let spec = MonitorSpec::new(7, "db", Target::Tcp { host: "db".into(), port: 5432 });
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["target"]["kind"], "TCP");
        assert_eq!(json["target"]["port"], 5432);

        let back: MonitorSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
