//! [`ProxyEngine`] adapter over an external xray-compatible core binary.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::engine::{FragmentSettings, Probe, ProxyEngine, ProxySettings};
use crate::error::ScanError;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one engine process per leased local port and probes through its
/// SOCKS5 inbound with an HTTP client.
pub struct ProcessEngine {
    binary: PathBuf,
    config_dir: PathBuf,
    instances: DashMap<u16, Child>,
    config_logged: AtomicBool,
}

impl ProcessEngine {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_dir: std::env::temp_dir(),
            instances: DashMap::new(),
            config_logged: AtomicBool::new(false),
        }
    }

    fn config_path(&self, local_port: u16) -> PathBuf {
        self.config_dir.join(format!("fragscan-{local_port}.json"))
    }

    /// HTTP client routed through the instance's SOCKS endpoint.
    fn socks_client(local_port: u16, timeout: Duration) -> Result<reqwest::Client, ScanError> {
        let proxy = reqwest::Proxy::all(format!("socks5://127.0.0.1:{local_port}"))
            .map_err(|e| ScanError::NetworkTest(e.to_string()))?;
        reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::NetworkTest(e.to_string()))
    }
}

#[async_trait]
impl ProxyEngine for ProcessEngine {
    async fn generate_config(
        &self,
        proxy: &ProxySettings,
        target: &str,
        local_port: u16,
        fragment: Option<&FragmentSettings>,
    ) -> Result<Vec<u8>, ScanError> {
        if proxy.uuid.is_empty() {
            return Err(ScanError::ConfigGeneration(
                "proxy settings are missing a uuid".to_owned(),
            ));
        }

        let mut outbound = serde_json::json!({
            "tag": "proxy",
            "protocol": proxy.protocol,
            "settings": {
                "vnext": [{
                    "address": target,
                    "port": proxy.server_port,
                    "users": [{
                        "id": proxy.uuid,
                        "encryption": "none",
                        "flow": "xtls-rprx-vision"
                    }]
                }]
            },
            "streamSettings": {
                "network": "tcp",
                "security": "reality",
                "realitySettings": {
                    "serverName": proxy.server_name,
                    "publicKey": proxy.public_key,
                    "shortId": proxy.short_id,
                    "fingerprint": "chrome"
                }
            }
        });
        if fragment.is_some() {
            outbound["streamSettings"]["sockopt"] = serde_json::json!({
                "dialerProxy": "fragment",
                "tcpNoDelay": true
            });
        }

        let mut outbounds = vec![outbound];
        if let Some(frag) = fragment {
            outbounds.push(serde_json::json!({
                "tag": "fragment",
                "protocol": "freedom",
                "settings": {
                    "fragment": {
                        "packets": frag.packets,
                        "length": frag.length.to_string(),
                        "interval": frag.interval.to_string()
                    }
                }
            }));
        }

        let config = serde_json::json!({
            "log": { "loglevel": "none" },
            "inbounds": [{
                "tag": "socks-in",
                "listen": "127.0.0.1",
                "port": local_port,
                "protocol": "socks",
                "settings": { "udp": true }
            }],
            "outbounds": outbounds
        });

        if self
            .config_logged
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("first generated engine config: {config}");
        }

        serde_json::to_vec_pretty(&config).map_err(|e| ScanError::ConfigGeneration(e.to_string()))
    }

    async fn start(&self, config: &[u8], local_port: u16) -> Result<(), ScanError> {
        let path = self.config_path(local_port);
        tokio::fs::write(&path, config)
            .await
            .map_err(|e| ScanError::EngineStart(format!("writing {}: {e}", path.display())))?;

        let child = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanError::EngineStart(format!("{}: {e}", self.binary.display())))?;

        if let Some(mut old) = self.instances.insert(local_port, child) {
            warn!("replacing a stale engine instance on port {local_port}");
            let _ = old.start_kill();
        }
        Ok(())
    }

    async fn wait_ready(&self, local_port: u16, timeout: Duration) -> Result<(), ScanError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        let deadline = Instant::now() + timeout;
        loop {
            if TcpStream::connect(addr).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ScanError::EngineNotReady(timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn stop(&self, local_port: u16) {
        if let Some((_, mut child)) = self.instances.remove(&local_port) {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        let _ = tokio::fs::remove_file(self.config_path(local_port)).await;
    }

    async fn test_connectivity(
        &self,
        local_port: u16,
        url: &str,
        timeout: Duration,
    ) -> Result<Probe, ScanError> {
        let client = Self::socks_client(local_port, timeout)?;
        let started = Instant::now();
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| ScanError::NetworkTest(e.to_string()))?;
        let latency = started.elapsed();
        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(ScanError::NetworkTest(format!("status {status}")));
        }
        Ok(Probe {
            latency,
            status_code: status.as_u16(),
        })
    }

    async fn test_packet_loss(
        &self,
        local_port: u16,
        url: &str,
        count: u32,
        per_probe_timeout: Duration,
    ) -> Result<f64, ScanError> {
        if count == 0 {
            return Ok(0.0);
        }
        let mut lost = 0_u32;
        for _ in 0..count {
            // a fresh client per probe so connection reuse cannot mask loss
            let ok = match Self::socks_client(local_port, per_probe_timeout) {
                Ok(client) => match client.head(url).send().await {
                    Ok(response) => {
                        response.status().is_success() || response.status().is_redirection()
                    }
                    Err(_) => false,
                },
                Err(_) => false,
            };
            if !ok {
                lost += 1;
            }
        }
        Ok(f64::from(lost) / f64::from(count) * 100.0)
    }

    async fn test_download_speed(
        &self,
        local_port: u16,
        url: &str,
        timeout: Duration,
    ) -> Result<f64, ScanError> {
        let client = Self::socks_client(local_port, timeout)?;
        let started = Instant::now();
        let body = client
            .get(url)
            .send()
            .await
            .map_err(|e| ScanError::NetworkTest(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| ScanError::NetworkTest(e.to_string()))?;
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return Err(ScanError::NetworkTest("download finished in zero time".to_owned()));
        }
        #[allow(clippy::cast_precision_loss)]
        Ok(body.len() as f64 / elapsed)
    }

    async fn test_upload_speed(
        &self,
        local_port: u16,
        url: &str,
        timeout: Duration,
    ) -> Result<f64, ScanError> {
        const UPLOAD_BYTES: usize = 1_000_000;
        let client = Self::socks_client(local_port, timeout)?;
        let started = Instant::now();
        let response = client
            .post(url)
            .body(vec![0_u8; UPLOAD_BYTES])
            .send()
            .await
            .map_err(|e| ScanError::NetworkTest(e.to_string()))?;
        let elapsed = started.elapsed().as_secs_f64();
        if !response.status().is_success() {
            return Err(ScanError::NetworkTest(format!("status {}", response.status())));
        }
        if elapsed <= 0.0 {
            return Err(ScanError::NetworkTest("upload finished in zero time".to_owned()));
        }
        #[allow(clippy::cast_precision_loss)]
        Ok(UPLOAD_BYTES as f64 / elapsed)
    }
}
