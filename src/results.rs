//! Thread-safe collection of probe outcomes and its derived views.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_derive::Serialize;

/// Everything one phase-1 attempt sequence learned about a candidate.
/// Created exactly once per candidate, after the first success or once
/// retries are exhausted, and immutable thereafter.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub address: String,
    pub success: bool,
    pub latency: Duration,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    /// Megabits per second, when bandwidth testing ran.
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    /// Stamped by the store on arrival.
    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    /// A successful probe before store admission.
    #[must_use]
    pub fn ok(address: &str, latency: Duration, status_code: u16) -> Self {
        Self {
            address: address.to_owned(),
            success: true,
            latency,
            status_code: Some(status_code),
            error: None,
            download_mbps: None,
            upload_mbps: None,
            packet_loss_pct: None,
            timestamp: Utc::now(),
        }
    }

    /// A terminal failure carrying the last attempt's error.
    #[must_use]
    pub fn failed(address: &str, error: &str) -> Self {
        Self {
            address: address.to_owned(),
            success: false,
            latency: Duration::ZERO,
            status_code: None,
            error: Some(error.to_owned()),
            download_mbps: None,
            upload_mbps: None,
            packet_loss_pct: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX)
    }
}

/// One row of the exportable latency-sorted table. Derived, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct ExportRow {
    pub address: String,
    pub latency_ms: u64,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only store shared by all phase-1 workers. All mutation is
/// serialized under a single lock; insertion order is preserved but
/// consumers read the derived latency-sorted view.
#[derive(Default)]
pub struct ResultStore {
    results: Mutex<Vec<ProbeResult>>,
}

impl ResultStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a result, stamping its arrival time.
    pub fn add(&self, mut result: ProbeResult) {
        result.timestamp = Utc::now();
        self.results.lock().unwrap().push(result);
    }

    #[must_use]
    pub fn all(&self) -> Vec<ProbeResult> {
        self.results.lock().unwrap().clone()
    }

    #[must_use]
    pub fn successful(&self) -> Vec<ProbeResult> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.success)
            .cloned()
            .collect()
    }

    /// Successes only, stable-sorted by ascending latency.
    #[must_use]
    pub fn sorted_by_latency(&self) -> Vec<ProbeResult> {
        let mut successes = self.successful();
        successes.sort_by_key(|r| r.latency);
        successes
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    #[must_use]
    pub fn success_count(&self) -> usize {
        self.results.lock().unwrap().iter().filter(|r| r.success).count()
    }

    /// The latency-sorted successes as exportable rows.
    #[must_use]
    pub fn to_rows(&self) -> Vec<ExportRow> {
        self.sorted_by_latency()
            .into_iter()
            .map(|r| ExportRow {
                latency_ms: r.latency_ms(),
                download_mbps: r.download_mbps,
                upload_mbps: r.upload_mbps,
                packet_loss_pct: r.packet_loss_pct,
                outcome: if r.success { "ok".to_owned() } else { "failed".to_owned() },
                timestamp: r.timestamp,
                address: r.address,
            })
            .collect()
    }

    /// The same view as a structured document.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!(self.to_rows())
    }
}
