//! Narrow capability interface over the external proxy core.
//!
//! The scanner never references a concrete engine type; everything it needs
//! from the proxy protocol implementation (Reality/VLESS handshake, SOCKS
//! inbound, transport framing) is consumed through [`ProxyEngine`]. Tests
//! substitute a stub that returns scripted outcomes; production wires in
//! [`process::ProcessEngine`].

pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::fragment::Range;

/// Outbound proxy identity used for every generated config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Outbound protocol name, e.g. "vless".
    pub protocol: String,
    pub uuid: String,
    /// SNI presented during the handshake.
    pub server_name: String,
    pub server_port: u16,
    /// Reality public key, when the outbound uses Reality.
    pub public_key: String,
    pub short_id: String,
}

/// Fragmentation applied to the engine's outbound stream: which packets to
/// split (`packets` is a zone name such as "tlshello" or "1-3"), into what
/// byte lengths, with what millisecond gaps.
#[derive(Debug, Clone)]
pub struct FragmentSettings {
    pub packets: String,
    pub length: Range,
    pub interval: Range,
}

/// What one connectivity probe through the engine observed.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub latency: Duration,
    pub status_code: u16,
}

/// Black-box contract of the external proxy engine.
///
/// Instances are keyed by their local SOCKS port: `start` materializes an
/// instance listening on `local_port`, and every later call addresses it by
/// the same port. `stop` is idempotent; stopping a port with no instance is
/// a no-op.
#[async_trait]
pub trait ProxyEngine: Send + Sync + 'static {
    /// Renders a full engine configuration for one candidate endpoint.
    async fn generate_config(
        &self,
        proxy: &ProxySettings,
        target: &str,
        local_port: u16,
        fragment: Option<&FragmentSettings>,
    ) -> Result<Vec<u8>, ScanError>;

    /// Starts an engine instance on `local_port` with the given config.
    async fn start(&self, config: &[u8], local_port: u16) -> Result<(), ScanError>;

    /// Polls until the instance's local port accepts connections, or the
    /// timeout elapses.
    async fn wait_ready(&self, local_port: u16, timeout: Duration) -> Result<(), ScanError>;

    /// Tears the instance down. Idempotent.
    async fn stop(&self, local_port: u16);

    /// One HTTP probe through the instance's SOCKS endpoint. A transport
    /// failure or rejected status code is a [`ScanError::NetworkTest`].
    async fn test_connectivity(
        &self,
        local_port: u16,
        url: &str,
        timeout: Duration,
    ) -> Result<Probe, ScanError>;

    /// `count` sequential HEAD-style probes, each through a fresh client,
    /// returning the failure percentage.
    async fn test_packet_loss(
        &self,
        local_port: u16,
        url: &str,
        count: u32,
        per_probe_timeout: Duration,
    ) -> Result<f64, ScanError>;

    /// One timed download; bytes per second from total elapsed time.
    async fn test_download_speed(
        &self,
        local_port: u16,
        url: &str,
        timeout: Duration,
    ) -> Result<f64, ScanError>;

    /// One timed upload; bytes per second from total elapsed time.
    async fn test_upload_speed(
        &self,
        local_port: u16,
        url: &str,
        timeout: Duration,
    ) -> Result<f64, ScanError>;
}

/// Bytes per second to megabits per second.
#[must_use]
pub fn bytes_per_sec_to_mbps(bps: f64) -> f64 {
    bps * 8.0 / 1_000_000.0
}
