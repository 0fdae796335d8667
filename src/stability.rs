//! Phase-2 stability profiling.
//!
//! The profiler takes the phase-1 survivors and hammers each one with
//! repeated rounds of latency and packet-loss measurements through a single
//! long-lived engine instance per candidate. Candidates run strictly
//! sequentially so that measurements never compete for bandwidth, with a
//! cooldown between them. Each candidate gets a composite 0-100 score and
//! a pass/fail verdict against configurable thresholds.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_derive::Serialize;

use crate::engine::{bytes_per_sec_to_mbps, ProxyEngine, ProxySettings, FragmentSettings};
use crate::error::ScanError;
use crate::port_pool::PortPool;
use crate::scanner::CancelToken;

/// Profiler knobs.
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// Measurement rounds per candidate. Each round takes one latency
    /// sample and one packet-loss sample.
    pub rounds: u32,
    /// Probes inside one packet-loss sample.
    pub loss_probes_per_round: u32,
    /// Wait between rounds of the same candidate.
    pub round_interval: Duration,
    /// Wait between candidates.
    pub cooldown: Duration,
    pub ready_timeout: Duration,
    pub probe_timeout: Duration,
    pub health_check_url: String,
    /// Jitter is only meaningful with at least two latency samples.
    pub jitter_enabled: bool,
    /// Measure download and upload throughput once, after the round loop.
    pub bandwidth: bool,
    pub download_url: String,
    pub upload_url: String,
    pub bandwidth_timeout: Duration,
    /// Verdict thresholds. The throughput floors only apply when set.
    pub max_packet_loss_pct: f64,
    pub min_download_mbps: Option<f64>,
    pub min_upload_mbps: Option<f64>,
    pub max_avg_latency: Duration,
    pub min_success_rate: f64,
    pub proxy: ProxySettings,
    pub fragment: Option<FragmentSettings>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            rounds: 10,
            loss_probes_per_round: 10,
            round_interval: Duration::from_millis(500),
            cooldown: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(4),
            probe_timeout: Duration::from_secs(10),
            health_check_url: "https://www.gstatic.com/generate_204".to_owned(),
            jitter_enabled: true,
            bandwidth: false,
            download_url: "https://speed.cloudflare.com/__down?bytes=10000000".to_owned(),
            upload_url: "https://speed.cloudflare.com/__up".to_owned(),
            bandwidth_timeout: Duration::from_secs(30),
            max_packet_loss_pct: 15.0,
            min_download_mbps: None,
            min_upload_mbps: None,
            max_avg_latency: Duration::from_millis(1500),
            min_success_rate: 0.7,
            proxy: ProxySettings::default(),
            fragment: None,
        }
    }
}

/// Composite profile of one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct StabilityResult {
    pub address: String,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    /// Population standard deviation of latency samples, in milliseconds.
    /// `None` when jitter is disabled or fewer than two samples landed.
    pub jitter_ms: Option<f64>,
    pub packet_loss_pct: f64,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    /// Fraction of rounds that produced a latency sample.
    pub success_rate: f64,
    /// Composite 0-100.
    pub score: f64,
    pub passed: bool,
    pub fail_reason: Option<String>,
}

/// Composite score out of 100: packet loss weighs 50, latency 30,
/// jitter 20. With jitter disabled the 20 jitter points are granted.
#[must_use]
pub fn stability_score(
    avg_latency_ms: f64,
    packet_loss_pct: f64,
    jitter_ms: Option<f64>,
) -> f64 {
    let loss_score = (50.0 * (1.0 - packet_loss_pct / 100.0)).max(0.0);
    let latency_score = (30.0 * (1.0 - (avg_latency_ms - 100.0) / 2900.0)).clamp(0.0, 30.0);
    let jitter_score = match jitter_ms {
        Some(jitter) => (20.0 * (1.0 - (jitter - 10.0) / 190.0)).clamp(0.0, 20.0),
        None => 20.0,
    };
    loss_score + latency_score + jitter_score
}

/// Sequential phase-2 profiler.
pub struct StabilityProfiler<E: ProxyEngine> {
    engine: Arc<E>,
    ports: Arc<PortPool>,
    config: StabilityConfig,
    cancel: CancelToken,
}

impl<E: ProxyEngine> StabilityProfiler<E> {
    #[must_use]
    pub fn new(
        engine: Arc<E>,
        ports: Arc<PortPool>,
        config: StabilityConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            engine,
            ports,
            config,
            cancel,
        }
    }

    /// Profiles each candidate in order. Candidates whose engine never came
    /// up fail with a reason instead of aborting the whole run; cancellation
    /// aborts between candidates and between rounds.
    pub async fn run(&self, addresses: &[String]) -> Result<Vec<StabilityResult>, ScanError> {
        if addresses.is_empty() {
            return Err(ScanError::NoCandidates(
                "no candidates survived phase 1".to_owned(),
            ));
        }
        info!("profiling {} candidates sequentially", addresses.len());

        let mut results = Vec::with_capacity(addresses.len());
        for (index, address) in addresses.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if index > 0 {
                tokio::time::sleep(self.config.cooldown).await;
            }
            results.push(self.profile(address).await?);
        }

        // best first: score descending, then latency ascending
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.avg_latency_ms
                        .partial_cmp(&b.avg_latency_ms)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        Ok(results)
    }

    /// Profiles one candidate through a single engine session.
    async fn profile(&self, address: &str) -> Result<StabilityResult, ScanError> {
        let lease = self.ports.acquire().await;
        let port = lease.port();

        let started = self.start_session(address, port).await;
        let result = match started {
            Ok(()) => {
                let result = self.measure_rounds(address, port).await;
                self.engine.stop(port).await;
                result?
            }
            Err(err) => {
                warn!("{address}: engine session failed: {err}");
                self.engine.stop(port).await;
                failed_result(address, &format!("engine session failed: {err}"))
            }
        };
        Ok(result)
    }

    async fn start_session(&self, address: &str, port: u16) -> Result<(), ScanError> {
        let config_bytes = self
            .engine
            .generate_config(&self.config.proxy, address, port, self.config.fragment.as_ref())
            .await?;
        self.engine.start(&config_bytes, port).await?;
        self.engine.wait_ready(port, self.config.ready_timeout).await?;
        Ok(())
    }

    /// All measurement rounds against an already-running engine instance.
    /// Every round takes both samples; a loss probe that fails outright is
    /// recorded as total loss for that round.
    async fn measure_rounds(&self, address: &str, port: u16) -> Result<StabilityResult, ScanError> {
        let rounds = self.config.rounds.max(1);
        let mut latencies_ms: Vec<f64> = Vec::with_capacity(rounds as usize);
        let mut loss_samples: Vec<f64> = Vec::with_capacity(rounds as usize);
        for round in 0..rounds {
            if self.cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if round > 0 {
                tokio::time::sleep(self.config.round_interval).await;
            }
            match self
                .engine
                .test_connectivity(port, &self.config.health_check_url, self.config.probe_timeout)
                .await
            {
                Ok(probe) => latencies_ms.push(probe.latency.as_secs_f64() * 1000.0),
                Err(err) => debug!("{address}: latency sample in round {round} failed: {err}"),
            }
            match self
                .engine
                .test_packet_loss(
                    port,
                    &self.config.health_check_url,
                    self.config.loss_probes_per_round,
                    self.config.probe_timeout,
                )
                .await
            {
                Ok(loss) => loss_samples.push(loss),
                Err(err) => {
                    debug!("{address}: loss sample in round {round} failed: {err}");
                    loss_samples.push(100.0);
                }
            }
        }

        let (download, upload) = if self.config.bandwidth {
            let down = self
                .engine
                .test_download_speed(port, &self.config.download_url, self.config.bandwidth_timeout)
                .await
                .map_err(|err| debug!("{address}: download measurement failed: {err}"))
                .ok()
                .map(bytes_per_sec_to_mbps);
            let up = self
                .engine
                .test_upload_speed(port, &self.config.upload_url, self.config.bandwidth_timeout)
                .await
                .map_err(|err| debug!("{address}: upload measurement failed: {err}"))
                .ok()
                .map(bytes_per_sec_to_mbps);
            (down, up)
        } else {
            (None, None)
        };

        Ok(self.aggregate(address, &latencies_ms, &loss_samples, rounds, download, upload))
    }

    fn aggregate(
        &self,
        address: &str,
        latencies_ms: &[f64],
        loss_samples: &[f64],
        rounds: u32,
        download_mbps: Option<f64>,
        upload_mbps: Option<f64>,
    ) -> StabilityResult {
        if latencies_ms.is_empty() {
            return failed_result(address, "all latency rounds failed");
        }

        let avg = latencies_ms.iter().sum::<f64>() / latencies_ms.len() as f64;
        let min = latencies_ms.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = latencies_ms.iter().cloned().fold(0.0_f64, f64::max);
        let jitter = if self.config.jitter_enabled && latencies_ms.len() >= 2 {
            Some(population_stddev(latencies_ms, avg))
        } else {
            None
        };
        // rounds that never recorded a loss sample count as total loss
        let measured: f64 = loss_samples.iter().sum();
        let missing = f64::from(rounds) - loss_samples.len() as f64;
        let packet_loss = (measured + missing * 100.0) / f64::from(rounds);
        let success_rate = latencies_ms.len() as f64 / f64::from(rounds);
        let score = stability_score(avg, packet_loss, jitter);

        let fail_reason = self.verdict(avg, packet_loss, success_rate, download_mbps, upload_mbps);
        StabilityResult {
            address: address.to_owned(),
            avg_latency_ms: avg,
            min_latency_ms: min,
            max_latency_ms: max,
            jitter_ms: jitter,
            packet_loss_pct: packet_loss,
            download_mbps,
            upload_mbps,
            success_rate,
            score,
            passed: fail_reason.is_none(),
            fail_reason,
        }
    }

    /// Independent checks, first failing one wins: packet loss, then the
    /// throughput floors, then latency and success rate.
    fn verdict(
        &self,
        avg_latency_ms: f64,
        packet_loss_pct: f64,
        success_rate: f64,
        download_mbps: Option<f64>,
        upload_mbps: Option<f64>,
    ) -> Option<String> {
        if packet_loss_pct > self.config.max_packet_loss_pct {
            return Some(format!(
                "packet loss {packet_loss_pct:.1}% over {:.1}%",
                self.config.max_packet_loss_pct
            ));
        }
        if let Some(floor) = self.config.min_download_mbps {
            match download_mbps {
                Some(rate) if rate >= floor => {}
                Some(rate) => {
                    return Some(format!("download {rate:.1} Mbps below {floor:.1} Mbps"))
                }
                None => return Some("download measurement failed".to_owned()),
            }
        }
        if let Some(floor) = self.config.min_upload_mbps {
            match upload_mbps {
                Some(rate) if rate >= floor => {}
                Some(rate) => {
                    return Some(format!("upload {rate:.1} Mbps below {floor:.1} Mbps"))
                }
                None => return Some("upload measurement failed".to_owned()),
            }
        }
        let max_avg = self.config.max_avg_latency.as_secs_f64() * 1000.0;
        if avg_latency_ms > max_avg {
            return Some(format!(
                "average latency {avg_latency_ms:.0}ms over {max_avg:.0}ms"
            ));
        }
        if success_rate < self.config.min_success_rate {
            return Some(format!(
                "success rate {:.0}% below {:.0}%",
                success_rate * 100.0,
                self.config.min_success_rate * 100.0
            ));
        }
        None
    }
}

fn failed_result(address: &str, reason: &str) -> StabilityResult {
    StabilityResult {
        address: address.to_owned(),
        avg_latency_ms: 0.0,
        min_latency_ms: 0.0,
        max_latency_ms: 0.0,
        jitter_ms: None,
        packet_loss_pct: 100.0,
        download_mbps: None,
        upload_mbps: None,
        success_rate: 0.0,
        score: 0.0,
        passed: false,
        fail_reason: Some(reason.to_owned()),
    }
}

fn population_stddev(samples: &[f64], mean: f64) -> f64 {
    let variance =
        samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt()
}
