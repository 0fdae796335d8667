//! End-to-end pipeline test: fragment search, phase-1 scan and phase-2
//! profiling against a scripted in-process engine, all sharing one port
//! pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fragscan::engine::{FragmentSettings, Probe, ProxyEngine, ProxySettings};
use fragscan::error::ScanError;
use fragscan::fragment::{default_zones, select_best, EngineTester, RangeSearch, SearchConfig};
use fragscan::port_pool::PortPool;
use fragscan::results::ResultStore;
use fragscan::scanner::{PoolState, ScanConfig, WorkerPool};
use fragscan::stability::{StabilityConfig, StabilityProfiler};

/// Engine where endpoints only answer when a fragment length of at least
/// 50 bytes is configured, mimicking a network that eats whole ClientHellos.
#[derive(Default)]
struct FragmentSensitiveEngine {
    latencies_ms: HashMap<String, u64>,
    sessions: Mutex<HashMap<u16, (String, bool)>>,
    active: AtomicU32,
    peak_active: AtomicU32,
}

impl FragmentSensitiveEngine {
    fn with_endpoints(endpoints: &[(&str, u64)]) -> Self {
        Self {
            latencies_ms: endpoints
                .iter()
                .map(|&(a, ms)| (a.to_owned(), ms))
                .collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ProxyEngine for FragmentSensitiveEngine {
    async fn generate_config(
        &self,
        proxy: &ProxySettings,
        target: &str,
        local_port: u16,
        fragment: Option<&FragmentSettings>,
    ) -> Result<Vec<u8>, ScanError> {
        if proxy.uuid.is_empty() {
            return Err(ScanError::ConfigGeneration("uuid is required".to_owned()));
        }
        let fragmented = fragment.is_some_and(|f| f.length.min >= 50);
        self.sessions
            .lock()
            .unwrap()
            .insert(local_port, (target.to_owned(), fragmented));
        Ok(Vec::new())
    }

    async fn start(&self, _config: &[u8], _local_port: u16) -> Result<(), ScanError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_ready(&self, _local_port: u16, _timeout: Duration) -> Result<(), ScanError> {
        Ok(())
    }

    async fn stop(&self, local_port: u16) {
        if self.sessions.lock().unwrap().remove(&local_port).is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn test_connectivity(
        &self,
        local_port: u16,
        _url: &str,
        _timeout: Duration,
    ) -> Result<Probe, ScanError> {
        let (target, fragmented) = self
            .sessions
            .lock()
            .unwrap()
            .get(&local_port)
            .cloned()
            .ok_or_else(|| ScanError::EngineNotReady(Duration::ZERO))?;
        if !fragmented {
            return Err(ScanError::NetworkTest("handshake reset".to_owned()));
        }
        match self.latencies_ms.get(&target) {
            Some(&ms) => Ok(Probe {
                latency: Duration::from_millis(ms),
                status_code: 204,
            }),
            None => Err(ScanError::NetworkTest("unreachable".to_owned())),
        }
    }

    async fn test_packet_loss(
        &self,
        _local_port: u16,
        _url: &str,
        _count: u32,
        _per_probe_timeout: Duration,
    ) -> Result<f64, ScanError> {
        Ok(10.0)
    }

    async fn test_download_speed(
        &self,
        _local_port: u16,
        _url: &str,
        _timeout: Duration,
    ) -> Result<f64, ScanError> {
        Ok(2_500_000.0)
    }

    async fn test_upload_speed(
        &self,
        _local_port: u16,
        _url: &str,
        _timeout: Duration,
    ) -> Result<f64, ScanError> {
        Ok(1_250_000.0)
    }
}

fn proxy() -> ProxySettings {
    ProxySettings {
        uuid: "11111111-2222-3333-4444-555555555555".to_owned(),
        server_name: "cdn.example.net".to_owned(),
        server_port: 443,
        ..ProxySettings::default()
    }
}

fn quick_scan_config(fragment: Option<FragmentSettings>) -> ScanConfig {
    ScanConfig {
        threads: 4,
        retries: 2,
        retry_backoff: Duration::from_millis(1),
        loss_probes: 2,
        proxy: proxy(),
        fragment,
        ..ScanConfig::default()
    }
}

#[tokio::test]
async fn full_pipeline_finds_and_profiles_endpoints() {
    let engine = Arc::new(FragmentSensitiveEngine::with_endpoints(&[
        ("172.64.0.1", 80),
        ("172.64.0.2", 140),
        ("172.64.0.3", 60),
    ]));
    let ports = PortPool::new(41000, 41015);

    // fragment search against one representative endpoint
    let tester = EngineTester::new(
        Arc::clone(&engine),
        Arc::clone(&ports),
        proxy(),
        "172.64.0.1",
        "https://example.com/health",
        Duration::from_secs(1),
        Duration::from_secs(1),
    );
    let search = RangeSearch::new(SearchConfig::default()).unwrap();
    let zone_results = search.run(&default_zones(), &tester).await.unwrap();
    let best = select_best(&zone_results).expect("some zone must converge");
    let fragment = best.fragment_settings().expect("winner carries settings");
    assert!(fragment.length.min >= 50, "search must land in the working region");

    // phase 1 with the discovered settings
    let store = Arc::new(ResultStore::new());
    let pool = WorkerPool::new(
        Arc::clone(&engine),
        Arc::clone(&ports),
        Arc::clone(&store),
        quick_scan_config(Some(fragment.clone())),
    );
    pool.set_candidates(vec![
        "172.64.0.1".to_owned(),
        "172.64.0.2".to_owned(),
        "172.64.0.3".to_owned(),
        "172.64.0.4".to_owned(),
    ]);
    pool.run().await.unwrap();

    assert_eq!(pool.state(), PoolState::Completed);
    assert_eq!(store.count(), 4);
    let successes = store.sorted_by_latency();
    assert_eq!(successes.len(), 3);
    assert_eq!(successes[0].address, "172.64.0.3");
    assert_eq!(successes[0].packet_loss_pct, Some(10.0));

    // phase 2 over the survivors, reusing the same pool of local ports
    let survivors: Vec<String> = successes.into_iter().map(|r| r.address).collect();
    let profiler = StabilityProfiler::new(
        Arc::clone(&engine),
        Arc::clone(&ports),
        StabilityConfig {
            rounds: 3,
            round_interval: Duration::from_millis(1),
            cooldown: Duration::from_millis(1),
            proxy: proxy(),
            fragment: Some(fragment),
            ..StabilityConfig::default()
        },
        pool.cancel_token(),
    );
    let profiles = profiler.run(&survivors).await.unwrap();

    assert_eq!(profiles.len(), 3);
    assert_eq!(profiles[0].address, "172.64.0.3");
    assert!(profiles[0].passed);
    assert!(profiles.windows(2).all(|w| w[0].score >= w[1].score));

    // nothing leaked: no engine instance or port lease survives the run
    assert_eq!(engine.active.load(Ordering::SeqCst), 0);
    assert_eq!(ports.leased(), 0);
    // concurrency never exceeded the configured pool sizes
    assert!(engine.peak_active.load(Ordering::SeqCst) <= 16);
}

#[tokio::test]
async fn unfragmented_scan_records_failures_without_aborting() {
    let engine = Arc::new(FragmentSensitiveEngine::with_endpoints(&[("172.64.0.1", 80)]));
    let ports = PortPool::new(41100, 41107);
    let store = Arc::new(ResultStore::new());

    let pool = WorkerPool::new(engine, ports, Arc::clone(&store), quick_scan_config(None));
    pool.set_candidates(vec!["172.64.0.1".to_owned(), "172.64.0.2".to_owned()]);
    pool.run().await.unwrap();

    assert_eq!(store.count(), 2);
    assert_eq!(store.success_count(), 0);
    for result in store.all() {
        assert!(result.error.as_deref().unwrap().contains("handshake reset"));
    }
}
