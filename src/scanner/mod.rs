//! Phase-1 scanning: the concurrent worker pool driving connectivity probes.
//!
//! One dispatcher feeds a bounded queue (twice the worker count) that `N`
//! workers drain. Pausing is cooperative and granular only at the "about to
//! dispatch the next job" boundary; in-flight jobs always run to
//! completion. Every test cycle leases its local port from the shared
//! [`PortPool`] and releases it on every exit path, and every outcome lands
//! in the shared [`ResultStore`] exactly once per candidate.

mod control;

use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use control::CancelToken;

use log::{debug, info};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::candidates::{load_candidates, CandidateOptions};
use crate::engine::{bytes_per_sec_to_mbps, FragmentSettings, ProxyEngine, ProxySettings};
use crate::error::ScanError;
use crate::port_pool::PortPool;
use crate::results::{ProbeResult, ResultStore};

/// Lifecycle of one pool: `Idle → Running → {Running ⇄ Paused} →
/// Stopped | Completed`. `stop` terminates unconditionally from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

/// Callback invoked with every finished [`ProbeResult`] before it is
/// stored. Presentation (progress bars, colors) belongs to the caller.
pub type ResultObserver = Box<dyn Fn(&ProbeResult) + Send + Sync>;

/// Phase-1 configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Concurrent workers; at least 1.
    pub threads: usize,
    /// Full test cycles per candidate before giving up; at least 1.
    pub retries: u32,
    /// How long to poll the engine's local port before an attempt fails.
    pub ready_timeout: Duration,
    /// Per-probe HTTP timeout.
    pub probe_timeout: Duration,
    /// Successful probes slower than this are demoted to failures.
    pub max_latency: Option<Duration>,
    pub health_check_url: String,
    /// Sequential packet-loss probes run once per successful candidate;
    /// zero disables the measurement.
    pub loss_probes: u32,
    pub loss_probe_timeout: Duration,
    /// Run one download and one upload measurement per successful candidate.
    pub bandwidth: bool,
    pub download_url: String,
    pub upload_url: String,
    pub bandwidth_timeout: Duration,
    /// Fixed wait between retries of the same candidate.
    pub retry_backoff: Duration,
    pub proxy: ProxySettings,
    /// Fragmentation applied to every generated config, typically the
    /// optimizer's pick.
    pub fragment: Option<FragmentSettings>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            threads: 16,
            retries: 3,
            ready_timeout: Duration::from_secs(4),
            probe_timeout: Duration::from_secs(10),
            max_latency: None,
            health_check_url: "https://www.gstatic.com/generate_204".to_owned(),
            loss_probes: 10,
            loss_probe_timeout: Duration::from_secs(3),
            bandwidth: false,
            download_url: "https://speed.cloudflare.com/__down?bytes=10000000".to_owned(),
            upload_url: "https://speed.cloudflare.com/__up".to_owned(),
            bandwidth_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(500),
            proxy: ProxySettings::default(),
            fragment: None,
        }
    }
}

struct PoolShared<E: ProxyEngine> {
    engine: Arc<E>,
    ports: Arc<PortPool>,
    store: Arc<ResultStore>,
    config: ScanConfig,
    state: Mutex<PoolState>,
    paused: watch::Sender<bool>,
    cancel: CancelToken,
    on_result: Option<ResultObserver>,
}

/// Everything a successful attempt measured.
struct AttemptOutcome {
    latency: Duration,
    status_code: u16,
    packet_loss_pct: Option<f64>,
    download_mbps: Option<f64>,
    upload_mbps: Option<f64>,
}

/// The phase-1 worker pool.
pub struct WorkerPool<E: ProxyEngine> {
    shared: Arc<PoolShared<E>>,
    candidates: Mutex<Vec<String>>,
}

impl<E: ProxyEngine> WorkerPool<E> {
    #[must_use]
    pub fn new(
        engine: Arc<E>,
        ports: Arc<PortPool>,
        store: Arc<ResultStore>,
        config: ScanConfig,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(PoolShared {
                engine,
                ports,
                store,
                config,
                state: Mutex::new(PoolState::Idle),
                paused,
                cancel: CancelToken::new(),
                on_result: None,
            }),
            candidates: Mutex::new(Vec::new()),
        }
    }

    /// Registers a per-result callback. Must be called before `run`.
    #[must_use]
    pub fn with_observer(mut self, observer: ResultObserver) -> Self {
        Arc::get_mut(&mut self.shared)
            .expect("observer must be attached before the pool is shared")
            .on_result = Some(observer);
        self
    }

    /// Parses and stores the candidate set, returning its size.
    pub fn load_candidates(
        &self,
        source: &str,
        options: &CandidateOptions,
    ) -> Result<usize, ScanError> {
        let candidates = load_candidates(source, options)?;
        let count = candidates.len();
        *self.candidates.lock().unwrap() = candidates;
        Ok(count)
    }

    /// Injects an already-expanded candidate list.
    pub fn set_candidates(&self, candidates: Vec<String>) {
        *self.candidates.lock().unwrap() = candidates;
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        *self.shared.state.lock().unwrap()
    }

    /// A handle on the pool's root cancellation signal, e.g. for ctrl-c
    /// wiring or sharing with the profiler.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Blocks future dispatch; in-flight jobs run to completion.
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
        let mut state = self.shared.state.lock().unwrap();
        if *state == PoolState::Running {
            *state = PoolState::Paused;
        }
    }

    /// Reopens dispatch after a pause.
    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
        let mut state = self.shared.state.lock().unwrap();
        if *state == PoolState::Paused {
            *state = PoolState::Running;
        }
    }

    /// Terminates the run from any state. Idempotent: repeated calls have
    /// no additional effect.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
        *self.shared.state.lock().unwrap() = PoolState::Stopped;
    }

    /// Runs the full scan: one dispatcher, `threads` workers, bounded
    /// queue. Returns once every dispatched candidate has a result or the
    /// run was cancelled.
    pub async fn run(&self) -> Result<(), ScanError> {
        let candidates = self.candidates.lock().unwrap().clone();
        if candidates.is_empty() {
            return Err(ScanError::NoCandidates("no candidates loaded".to_owned()));
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == PoolState::Stopped {
                return Err(ScanError::Cancelled);
            }
            *state = PoolState::Running;
        }
        let threads = self.shared.config.threads.max(1);
        info!(
            "scanning {} candidates with {} workers ({} retries each)",
            candidates.len(),
            threads,
            self.shared.config.retries.max(1)
        );

        let (tx, rx) = mpsc::channel::<String>(threads * 2);
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let shared = Arc::clone(&self.shared);
            let rx = Arc::clone(&rx);
            workers.push(tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(candidate) = job else { break };
                    shared.probe_candidate(&candidate).await;
                }
            }));
        }

        let dispatcher = tokio::spawn(dispatch(Arc::clone(&self.shared), tx, candidates));

        let _ = dispatcher.await;
        for worker in workers {
            let _ = worker.await;
        }

        let cancelled = self.shared.cancel.is_cancelled();
        let mut state = self.shared.state.lock().unwrap();
        *state = if cancelled {
            PoolState::Stopped
        } else {
            PoolState::Completed
        };
        drop(state);
        if cancelled {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Feeds candidates into the queue, honoring pause and cancellation before
/// each dispatch.
async fn dispatch<E: ProxyEngine>(
    shared: Arc<PoolShared<E>>,
    tx: mpsc::Sender<String>,
    candidates: Vec<String>,
) {
    let mut paused = shared.paused.subscribe();
    for candidate in candidates {
        if shared.cancel.is_cancelled() {
            return;
        }
        tokio::select! {
            res = paused.wait_for(|p| !*p) => {
                if res.is_err() {
                    return;
                }
            }
            () = shared.cancel.cancelled() => return,
        }
        tokio::select! {
            res = tx.send(candidate) => {
                if res.is_err() {
                    return;
                }
            }
            () = shared.cancel.cancelled() => return,
        }
    }
}

impl<E: ProxyEngine> PoolShared<E> {
    /// Runs the full attempt sequence for one candidate and records exactly
    /// one result.
    async fn probe_candidate(&self, address: &str) {
        let retries = self.config.retries.max(1);
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=retries {
            if self.cancel.is_cancelled() {
                last_error = ScanError::Cancelled.to_string();
                break;
            }
            match self.attempt(address).await {
                Ok(outcome) => {
                    let mut result =
                        ProbeResult::ok(address, outcome.latency, outcome.status_code);
                    result.packet_loss_pct = outcome.packet_loss_pct;
                    result.download_mbps = outcome.download_mbps;
                    result.upload_mbps = outcome.upload_mbps;
                    self.record(result);
                    return;
                }
                Err(err) => {
                    debug!("attempt {attempt}/{retries} for {address} failed: {err}");
                    last_error = err.to_string();
                    if matches!(err, ScanError::Cancelled) {
                        break;
                    }
                    if attempt < retries {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }
        self.record(ProbeResult::failed(address, &last_error));
    }

    fn record(&self, result: ProbeResult) {
        if let Some(observer) = &self.on_result {
            observer(&result);
        }
        self.store.add(result);
    }

    /// One full test cycle: lease a port, start an engine instance, probe
    /// through it, tear everything down. The engine is stopped and the
    /// lease dropped on every exit path.
    async fn attempt(&self, address: &str) -> Result<AttemptOutcome, ScanError> {
        let lease = self.ports.acquire().await;
        let port = lease.port();

        let config_bytes = self
            .engine
            .generate_config(&self.config.proxy, address, port, self.config.fragment.as_ref())
            .await?;
        self.engine.start(&config_bytes, port).await?;

        let outcome = tokio::select! {
            res = self.measure(port) => res,
            () = self.cancel.cancelled() => Err(ScanError::Cancelled),
        };

        self.engine.stop(port).await;
        outcome
    }

    /// Readiness poll, connectivity probe and, on success, the one-shot
    /// packet-loss and bandwidth measurements.
    async fn measure(&self, port: u16) -> Result<AttemptOutcome, ScanError> {
        self.engine.wait_ready(port, self.config.ready_timeout).await?;
        let probe = self
            .engine
            .test_connectivity(port, &self.config.health_check_url, self.config.probe_timeout)
            .await?;
        if let Some(ceiling) = self.config.max_latency {
            if probe.latency > ceiling {
                return Err(ScanError::NetworkTest(format!(
                    "latency {}ms over ceiling {}ms",
                    probe.latency.as_millis(),
                    ceiling.as_millis()
                )));
            }
        }

        let packet_loss_pct = if self.config.loss_probes > 0 {
            self.engine
                .test_packet_loss(
                    port,
                    &self.config.health_check_url,
                    self.config.loss_probes,
                    self.config.loss_probe_timeout,
                )
                .await
                .ok()
        } else {
            None
        };

        let (download_mbps, upload_mbps) = if self.config.bandwidth {
            let down = self
                .engine
                .test_download_speed(port, &self.config.download_url, self.config.bandwidth_timeout)
                .await
                .ok()
                .map(bytes_per_sec_to_mbps);
            let up = self
                .engine
                .test_upload_speed(port, &self.config.upload_url, self.config.bandwidth_timeout)
                .await
                .ok()
                .map(bytes_per_sec_to_mbps);
            (down, up)
        } else {
            (None, None)
        };

        Ok(AttemptOutcome {
            latency: probe.latency,
            status_code: probe.status_code,
            packet_loss_pct,
            download_mbps,
            upload_mbps,
        })
    }
}
