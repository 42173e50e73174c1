//! Ping probe implementation with native ICMP and degraded fallbacks.
//!
//! Preference order: RAW ICMP socket (privileged), DGRAM ICMP socket
//! (unprivileged where the kernel allows it), the system `ping` command, and
//! finally a TCP connect to port 80 as a reachability heuristic. Blocking
//! sockets run in `spawn_blocking` for sub-millisecond timing precision.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{duration_ms, elapsed_ms, run_tcp_probe, ProbeError};

/// Port used by the TCP reachability heuristic.
const FALLBACK_TCP_PORT: u16 = 80;

/// How ping probes reach the network on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpCapability {
    /// RAW ICMP sockets (CAP_NET_RAW or root).
    Raw,
    /// DGRAM ICMP sockets (unprivileged).
    Datagram,
    /// No native ICMP; shell out to `ping`.
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

static TCP_FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

/// Detected ICMP capability, probed once per process.
pub fn icmp_capability() -> IcmpCapability {
    *ICMP_CAPABILITY.get_or_init(detect_icmp_capability)
}

/// Log how ping monitors will run. Degraded modes are warnings, never errors.
pub fn log_icmp_capability() {
    match icmp_capability() {
        IcmpCapability::Raw => tracing::info!("Ping probe: using native ICMP (RAW socket)"),
        IcmpCapability::Datagram => {
            tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)")
        }
        IcmpCapability::CommandOnly => tracing::warn!(
            "Ping probe: native ICMP unavailable (needs CAP_NET_RAW or ping_group_range), \
             falling back to the ping command"
        ),
    }
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        return IcmpCapability::Raw;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        return IcmpCapability::Datagram;
    }
    IcmpCapability::CommandOnly
}

/// Run a ping probe against the given host.
///
/// Returns the round-trip time in milliseconds.
pub async fn run_ping_probe(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let socket_type = match icmp_capability() {
        IcmpCapability::Raw => Type::RAW,
        IcmpCapability::Datagram => Type::DGRAM,
        IcmpCapability::CommandOnly => return run_ping_command(host, timeout).await,
    };

    // Resolve before spawn_blocking (DNS is async)
    let ip = resolve_address(host).await?;

    let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, socket_type, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

    match result {
        Err(ProbeError::PermissionDenied(msg)) => {
            tracing::warn!(
                "Native ping to {} denied ({}), falling back to the ping command",
                host,
                msg
            );
            run_ping_command(host, timeout).await
        }
        other => other,
    }
}

async fn resolve_address(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::DnsFailure(format!("{}: {}", host, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::DnsFailure(format!("no addresses found for {}", host)))
}

/// Per-family ICMP constants.
#[derive(Debug, Clone, Copy)]
struct IcmpFamily {
    domain: Domain,
    protocol: Protocol,
    echo_request: u8,
    echo_reply: u8,
    /// The kernel fills in the checksum (ICMPv6).
    kernel_checksum: bool,
}

const ICMP_V4: IcmpFamily = IcmpFamily {
    domain: Domain::IPV4,
    protocol: Protocol::ICMPV4,
    echo_request: 8,
    echo_reply: 0,
    kernel_checksum: false,
};

const ICMP_V6: IcmpFamily = IcmpFamily {
    domain: Domain::IPV6,
    protocol: Protocol::ICMPV6,
    echo_request: 128,
    echo_reply: 129,
    kernel_checksum: true,
};

/// Send one echo request and wait for its reply. Runs on a blocking thread.
fn run_blocking_ping(ip: IpAddr, socket_type: Type, timeout: Duration) -> Result<f64, ProbeError> {
    let family = match ip {
        IpAddr::V4(_) => ICMP_V4,
        IpAddr::V6(_) => ICMP_V6,
    };
    let raw = socket_type == Type::RAW;

    let socket = Socket::new(family.domain, socket_type, Some(family.protocol))
        .map_err(|e| socket_error("create ICMP socket", e, timeout))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| socket_error("set timeout", e, timeout))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| socket_error("connect", e, timeout))?;

    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(family, identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| socket_error("send", e, timeout))?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| socket_error("set timeout", e, timeout))?;

        let len = (&socket)
            .read(&mut buf)
            .map_err(|e| socket_error("receive", e, timeout))?;
        let rtt = elapsed_ms(start);

        // RAW IPv4 sockets deliver the IP header as well.
        let offset = if raw && family.domain == Domain::IPV4 && len > 0 && buf[0] >> 4 == 4 {
            usize::from(buf[0] & 0x0f) * 4
        } else {
            0
        };

        if let Some((kind, id, seq)) = parse_echo_header(&buf[..len], offset) {
            // DGRAM sockets rewrite the identifier, so only RAW replies can be matched on it.
            let id_matches = !raw || id == identifier;
            if kind == family.echo_reply && seq == sequence && id_matches {
                if rtt >= duration_ms(timeout) {
                    return Err(ProbeError::Timeout(timeout));
                }
                return Ok(rtt);
            }
        }
        // Someone else's packet, keep waiting
    }
}

fn socket_error(op: &str, e: std::io::Error, timeout: Duration) -> ProbeError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(format!("{}: {}", op, e)),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
        _ => ProbeError::Network(format!("failed to {}: {}", op, e)),
    }
}

/// Type, identifier and sequence of the ICMP header at `offset`.
fn parse_echo_header(packet: &[u8], offset: usize) -> Option<(u8, u16, u16)> {
    let header = packet.get(offset..offset + 8)?;
    Some((
        header[0],
        u16::from_be_bytes([header[4], header[5]]),
        u16::from_be_bytes([header[6], header[7]]),
    ))
}

/// Build an echo request: 8 byte header plus a 56 byte payload that starts
/// with a timestamp.
fn build_echo_request(family: IcmpFamily, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = family.echo_request;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if !family.kernel_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Internet checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Run ping via command execution (fallback).
async fn run_ping_command(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) =>
        {
            if !TCP_FALLBACK_WARNED.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "Ping probe: ping command unusable ({}), using TCP reachability on port {}",
                    e,
                    FALLBACK_TCP_PORT
                );
            }
            return run_tcp_reachability(host, timeout).await;
        }
        Err(e) => return Err(ProbeError::Command(format!("failed to execute ping: {}", e))),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("unknown host")
            || stderr.contains("Name or service not known")
            || stderr.contains("cannot resolve")
        {
            return Err(ProbeError::DnsFailure(stderr.trim().to_string()));
        }
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout)
}

/// Treat a completed or actively refused TCP handshake as proof of life.
async fn run_tcp_reachability(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let start = Instant::now();
    match run_tcp_probe(host, FALLBACK_TCP_PORT, timeout).await {
        Ok(latency) => Ok(latency),
        Err(ProbeError::ConnectionRefused) => Ok(elapsed_ms(start)),
        Err(e) => Err(e),
    }
}

/// Parse `ping` output for the round-trip time in milliseconds.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // Per-packet response "time=X.XXX ms" (Linux, some macOS)
            r"time[=<](?P<ms>[0-9.]+)\s*ms",
            // Summary line (macOS)
            r"round-trip\s+min/avg/max/stddev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
            // Summary line (Linux)
            r"rtt\s+min/avg/max/mdev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    patterns
        .iter()
        .filter_map(|re| re.captures(output))
        .filter_map(|caps| caps.name("ms")?.as_str().parse::<f64>().ok())
        .next()
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
