//! Adaptive discovery of working TLS-fragmentation parameters.
//!
//! A fragmentation *zone* names where in the handshake outgoing packets are
//! split (the TLS ClientHello, the first few data packets, ...). For each
//! zone the [`RangeSearch`] walks a byte-length range and a millisecond
//! interval range with golden-ratio sized steps until it finds a combination
//! that reliably survives inspection, using nothing but an injected
//! black-box [`FragmentTester`].

mod range_search;

use std::sync::Arc;
use std::time::Duration;

pub use range_search::{select_best, Range, RangeSearch, SearchConfig, PHI};

use crate::engine::{FragmentSettings, ProxyEngine, ProxySettings};
use crate::port_pool::PortPool;

/// A named fragmentation strategy under test, with the caller-supplied
/// bounds the search may never leave.
#[derive(Debug, Clone)]
pub struct Zone {
    pub name: String,
    /// Fragment byte-length bounds.
    pub size: Range,
    /// Inter-fragment delay bounds, milliseconds.
    pub interval: Range,
}

impl Zone {
    #[must_use]
    pub fn new(name: &str, size: Range, interval: Range) -> Self {
        Self {
            name: name.to_owned(),
            size,
            interval,
        }
    }
}

/// Zones worth searching when the caller has no opinion: the ClientHello
/// split plus two early-packet splits, with generous bounds.
#[must_use]
pub fn default_zones() -> Vec<Zone> {
    vec![
        Zone::new("tlshello", Range::new(1, 500), Range::new(1, 60)),
        Zone::new("1-2", Range::new(40, 200), Range::new(5, 40)),
        Zone::new("1-5", Range::new(100, 400), Range::new(10, 50)),
    ]
}

/// Outcome of the search for one zone. Mutated across attempts, then frozen
/// and returned.
#[derive(Debug, Clone)]
pub struct ZoneResult {
    pub zone: String,
    pub best_size: Option<Range>,
    pub best_interval: Option<Range>,
    pub best_latency: Option<Duration>,
    pub success_count: u32,
    pub total_tests: u32,
    pub success: bool,
}

impl ZoneResult {
    #[must_use]
    pub(crate) fn empty(zone: &str) -> Self {
        Self {
            zone: zone.to_owned(),
            best_size: None,
            best_interval: None,
            best_latency: None,
            success_count: 0,
            total_tests: 0,
            success: false,
        }
    }

    /// Failure marker for a zone whose bounds were invalid; consumed no
    /// tester calls.
    #[must_use]
    pub(crate) fn skipped(zone: &str) -> Self {
        Self::empty(zone)
    }

    #[must_use]
    pub fn success_ratio(&self) -> f64 {
        if self.total_tests == 0 {
            return 0.0;
        }
        f64::from(self.success_count) / f64::from(self.total_tests)
    }

    /// The winning parameters as engine fragment settings, if any attempt
    /// succeeded.
    #[must_use]
    pub fn fragment_settings(&self) -> Option<FragmentSettings> {
        Some(FragmentSettings {
            packets: self.zone.clone(),
            length: self.best_size?,
            interval: self.best_interval?,
        })
    }
}

/// What a single tester call observed.
#[derive(Debug, Clone, Copy)]
pub struct TesterOutcome {
    pub success: bool,
    pub latency: Duration,
}

/// Black box that answers "does this (zone, size, interval) combination
/// produce a working handshake?". A genuine DPI rejection and an unrelated
/// infrastructure failure both come back as a plain failure; the search
/// does not tell them apart.
#[async_trait::async_trait]
pub trait FragmentTester: Send + Sync {
    async fn test(&self, zone: &str, size: Range, interval: Range) -> TesterOutcome;
}

/// Structured progress event emitted after every tester call. Presentation
/// belongs to the caller.
#[derive(Debug, Clone)]
pub struct SearchEvent {
    pub zone: String,
    pub attempt: u32,
    pub success: bool,
    pub size: Range,
    pub interval: Range,
    pub latency: Duration,
}

/// Observer callback for [`SearchEvent`]s.
pub type SearchObserver = Box<dyn Fn(&SearchEvent) + Send + Sync>;

/// [`FragmentTester`] that drives a full engine cycle against one
/// representative candidate: lease a port, start an engine instance with the
/// candidate fragmentation settings, probe through it, tear everything down.
pub struct EngineTester<E: ProxyEngine> {
    engine: Arc<E>,
    ports: Arc<PortPool>,
    proxy: ProxySettings,
    target: String,
    health_check_url: String,
    ready_timeout: Duration,
    probe_timeout: Duration,
}

impl<E: ProxyEngine> EngineTester<E> {
    #[must_use]
    pub fn new(
        engine: Arc<E>,
        ports: Arc<PortPool>,
        proxy: ProxySettings,
        target: &str,
        health_check_url: &str,
        ready_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            ports,
            proxy,
            target: target.to_owned(),
            health_check_url: health_check_url.to_owned(),
            ready_timeout,
            probe_timeout,
        }
    }

    async fn cycle(&self, settings: &FragmentSettings) -> Result<Duration, crate::error::ScanError> {
        let lease = self.ports.acquire().await;
        let config = self
            .engine
            .generate_config(&self.proxy, &self.target, lease.port(), Some(settings))
            .await?;
        self.engine.start(&config, lease.port()).await?;
        let outcome = async {
            self.engine.wait_ready(lease.port(), self.ready_timeout).await?;
            let probe = self
                .engine
                .test_connectivity(lease.port(), &self.health_check_url, self.probe_timeout)
                .await?;
            Ok(probe.latency)
        }
        .await;
        // teardown runs on success and failure alike; the lease drops after
        self.engine.stop(lease.port()).await;
        outcome
    }
}

#[async_trait::async_trait]
impl<E: ProxyEngine> FragmentTester for EngineTester<E> {
    async fn test(&self, zone: &str, size: Range, interval: Range) -> TesterOutcome {
        let settings = FragmentSettings {
            packets: zone.to_owned(),
            length: size,
            interval,
        };
        match self.cycle(&settings).await {
            Ok(latency) => TesterOutcome {
                success: true,
                latency,
            },
            Err(err) => {
                log::debug!("fragment test failed for zone {zone:?}: {err}");
                TesterOutcome {
                    success: false,
                    latency: Duration::ZERO,
                }
            }
        }
    }
}
