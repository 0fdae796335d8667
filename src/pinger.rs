//! Reachability-only probing without the proxy engine.
//!
//! A low-cost alternative to the full phase-1 pipeline: one ICMP echo (when
//! raw sockets are available to this process) or a TCP connect against a
//! short list of common ports. No port pool and no engine involvement.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{stream, StreamExt};
use log::{debug, info};
use once_cell::sync::Lazy;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::results::{ProbeResult, ResultStore};
use crate::scanner::CancelToken;

/// Raw-socket availability, detected once per process. Creating an ICMP raw
/// socket needs CAP_NET_RAW (or root) on Linux.
static ICMP_AVAILABLE: Lazy<bool> = Lazy::new(|| {
    let usable = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok();
    info!(
        "icmp raw sockets {}",
        if usable { "available" } else { "unavailable, falling back to tcp connect" }
    );
    usable
});

/// Lightweight prober configuration.
#[derive(Debug, Clone)]
pub struct PingConfig {
    pub threads: usize,
    /// Sequential attempts per candidate; first success wins.
    pub retries: u32,
    /// Per-attempt timeout; kept short by design.
    pub timeout: Duration,
    /// Successful probes slower than this are demoted to failures.
    pub max_latency: Option<Duration>,
    /// Ports tried in order by the TCP fallback.
    pub tcp_ports: Vec<u16>,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            threads: 16,
            retries: 2,
            timeout: Duration::from_millis(1500),
            max_latency: None,
            tcp_ports: vec![443, 80, 22, 53],
        }
    }
}

/// Concurrent reachability pipeline writing into the shared result store.
pub struct Pinger {
    config: PingConfig,
    store: Arc<ResultStore>,
    cancel: CancelToken,
}

impl Pinger {
    #[must_use]
    pub fn new(config: PingConfig, store: Arc<ResultStore>, cancel: CancelToken) -> Self {
        Self {
            config,
            store,
            cancel,
        }
    }

    /// Probes every candidate with bounded concurrency.
    pub async fn run(&self, candidates: &[String]) {
        stream::iter(candidates)
            .map(|candidate| async move {
                if self.cancel.is_cancelled() {
                    return;
                }
                let result = self.probe_candidate(candidate).await;
                self.store.add(result);
            })
            .buffer_unordered(self.config.threads.max(1))
            .collect::<()>()
            .await;
    }

    /// Up to `retries` sequential attempts, stopping at the first success.
    async fn probe_candidate(&self, candidate: &str) -> ProbeResult {
        let Ok(ip) = candidate.parse::<IpAddr>() else {
            return ProbeResult::failed(candidate, "not an IP address");
        };

        let mut last_error = "unreachable".to_owned();
        for attempt in 1..=self.config.retries.max(1) {
            if self.cancel.is_cancelled() {
                return ProbeResult::failed(candidate, "cancelled");
            }
            match self.probe_once(ip).await {
                Ok(latency) => {
                    if let Some(ceiling) = self.config.max_latency {
                        if latency > ceiling {
                            // reachable but too slow counts as a failure
                            last_error = format!(
                                "latency {}ms over ceiling {}ms",
                                latency.as_millis(),
                                ceiling.as_millis()
                            );
                            continue;
                        }
                    }
                    debug!("{candidate} reachable in {}ms (attempt {attempt})", latency.as_millis());
                    let mut result = ProbeResult::ok(candidate, latency, 0);
                    result.status_code = None;
                    return result;
                }
                Err(err) => last_error = err,
            }
        }
        ProbeResult::failed(candidate, &last_error)
    }

    async fn probe_once(&self, ip: IpAddr) -> Result<Duration, String> {
        if ip.is_ipv4() && *ICMP_AVAILABLE {
            icmp_ping(ip, self.config.timeout).await
        } else {
            self.tcp_ping(ip).await
        }
    }

    /// TCP-connect fallback: the first port that accepts wins.
    async fn tcp_ping(&self, ip: IpAddr) -> Result<Duration, String> {
        let mut last_error = "no fallback ports configured".to_owned();
        for &port in &self.config.tcp_ports {
            let started = Instant::now();
            match timeout(self.config.timeout, TcpStream::connect(SocketAddr::new(ip, port))).await
            {
                Ok(Ok(_stream)) => return Ok(started.elapsed()),
                Ok(Err(err)) => last_error = format!("connect {ip}:{port}: {err}"),
                Err(_) => last_error = format!("connect {ip}:{port}: timed out"),
            }
        }
        Err(last_error)
    }
}

/// One ICMP echo over a raw socket, on the blocking pool.
async fn icmp_ping(ip: IpAddr, wait: Duration) -> Result<Duration, String> {
    tokio::task::spawn_blocking(move || icmp_ping_blocking(ip, wait))
        .await
        .map_err(|e| e.to_string())?
}

fn icmp_ping_blocking(ip: IpAddr, wait: Duration) -> Result<Duration, String> {
    let mut socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .map_err(|e| e.to_string())?;
    socket
        .set_read_timeout(Some(wait))
        .map_err(|e| e.to_string())?;
    socket
        .connect(&SockAddr::from(SocketAddr::new(ip, 0)))
        .map_err(|e| e.to_string())?;

    let ident = (std::process::id() & 0xffff) as u16;
    let packet = echo_request(ident, 1);
    let started = Instant::now();
    socket.write_all(&packet).map_err(|e| e.to_string())?;

    let mut buf = [0_u8; 1024];
    loop {
        let read = socket.read(&mut buf).map_err(|e| e.to_string())?;
        // strip the IPv4 header to get at the ICMP reply
        if read >= 28 && buf[20] == 0 && u16::from_be_bytes([buf[24], buf[25]]) == ident {
            return Ok(started.elapsed());
        }
        if started.elapsed() >= wait {
            return Err("echo reply timed out".to_owned());
        }
    }
}

/// ICMP echo request: type 8, code 0, checksum over the whole message.
fn echo_request(ident: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![8, 0, 0, 0];
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(b"fragscan");
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// RFC 1071 ones'-complement sum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0_u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::CancelToken;
    use tokio::net::TcpListener;

    #[test]
    fn checksum_verifies_to_zero() {
        let packet = echo_request(0x1234, 7);
        // re-summing a checksummed message yields zero
        assert_eq!(icmp_checksum(&packet), 0);
        assert_eq!(packet[0], 8);
        assert_eq!(&packet[4..6], &0x1234_u16.to_be_bytes());
    }

    fn config_with_port(port: u16) -> PingConfig {
        PingConfig {
            threads: 2,
            retries: 1,
            timeout: Duration::from_millis(500),
            max_latency: None,
            tcp_ports: vec![port],
        }
    }

    #[tokio::test]
    async fn tcp_fallback_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let store = Arc::new(ResultStore::new());
        let pinger = Pinger::new(config_with_port(port), Arc::clone(&store), CancelToken::new());
        let result = pinger.probe_candidate("127.0.0.1").await;
        // raw-socket environments answer via ICMP, the rest via TCP; either
        // way loopback must be reachable
        assert!(result.success, "loopback unreachable: {:?}", result.error);
    }

    #[tokio::test]
    async fn unparseable_candidate_fails_fast() {
        let store = Arc::new(ResultStore::new());
        let pinger = Pinger::new(config_with_port(1), Arc::clone(&store), CancelToken::new());
        let result = pinger.probe_candidate("not-an-ip").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("not an IP address"));
    }

    #[tokio::test]
    async fn over_ceiling_latency_is_demoted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = config_with_port(port);
        config.max_latency = Some(Duration::ZERO);
        let store = Arc::new(ResultStore::new());
        let pinger = Pinger::new(config, Arc::clone(&store), CancelToken::new());
        let result = pinger.probe_candidate("127.0.0.1").await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("over ceiling"));
    }

    #[tokio::test]
    async fn run_records_one_result_per_candidate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let store = Arc::new(ResultStore::new());
        let pinger = Pinger::new(config_with_port(port), Arc::clone(&store), CancelToken::new());
        let candidates = vec!["127.0.0.1".to_owned(), "bogus".to_owned()];
        pinger.run(&candidates).await;

        assert_eq!(store.count(), 2);
    }
}
