use std::time::Duration;

use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::fragment::{FragmentTester, SearchEvent, SearchObserver, Zone, ZoneResult};

/// Golden ratio conjugate, `(sqrt(5) - 1) / 2`. Shift and widen steps are
/// sized as `width * (1 - PHI)` so the search walks the space in decreasing,
/// non-resonant strides.
pub const PHI: f64 = 0.618_033_988_749_894_9;

/// Approximate byte length of a TLS ClientHello, used to derive a plausible
/// inter-fragment delay from a fragment size.
const CLIENT_HELLO_BYTES: i64 = 300;

/// An inclusive integer interval, `min > 0` and `max > min` for every valid
/// value. All transformations return a new `Range`; nothing mutates in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub min: i64,
    pub max: i64,
}

impl Range {
    #[must_use]
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.min > 0 && self.max > self.min
    }

    #[must_use]
    pub const fn width(self) -> i64 {
        self.max - self.min
    }

    #[must_use]
    pub const fn midpoint(self) -> i64 {
        (self.min + self.max) / 2
    }

    /// Clamps the range into `bounds`. A range collapsed flat against a bound
    /// keeps a unit-width window just inside it, so the result of clamping a
    /// valid range into valid bounds is always valid.
    #[must_use]
    pub fn clamped(self, bounds: Self) -> Self {
        let mut min = self.min.max(bounds.min);
        let mut max = self.max.min(bounds.max);
        if max <= min {
            if min >= bounds.max {
                min = bounds.max - 1;
                max = bounds.max;
            } else {
                max = min + 1;
            }
        }
        Self { min, max }
    }

    /// Shrinks the range toward its center by 10% from each side, at least
    /// one unit per side. A shrink that would invert the range or leave a
    /// width below 2 is a no-op.
    #[must_use]
    pub fn narrowed(self) -> Self {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let step = ((self.width() as f64) * 0.1).floor().max(1.0) as i64;
        let (min, max) = (self.min + step, self.max - step);
        if max - min < 2 {
            return self;
        }
        Self { min, max }
    }

    /// Translates both bounds by `delta` (may be negative). Callers re-clamp
    /// into the original bounds before use.
    #[must_use]
    pub const fn shifted(self, delta: i64) -> Self {
        Self {
            min: self.min + delta,
            max: self.max + delta,
        }
    }

    /// Grows both bounds by `step`, never past `bounds`.
    #[must_use]
    pub fn widened(self, step: i64, bounds: Self) -> Self {
        Self {
            min: (self.min - step).max(bounds.min),
            max: (self.max + step).min(bounds.max),
        }
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Step size used when shifting or widening a range: `width * (1 - PHI)`,
/// floored to at least one unit.
#[must_use]
fn phi_step(width: i64) -> i64 {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let step = ((width as f64) * (1.0 - PHI)).floor() as i64;
    step.max(1)
}

/// Derives an interval range correlated to the current fragment size: the
/// ideal delay is `CLIENT_HELLO_BYTES / size midpoint`, clamped into the
/// zone's interval bounds, then windowed to half the original interval width
/// (minimum window 5) centered on that ideal value.
#[must_use]
fn correlated_interval(size: Range, interval_bounds: Range) -> Range {
    let ideal = (CLIENT_HELLO_BYTES / size.midpoint().max(1))
        .clamp(interval_bounds.min, interval_bounds.max);
    let window = (interval_bounds.width() / 2).max(5);
    Range::new(ideal - window / 2, ideal + window / 2).clamped(interval_bounds)
}

/// Tunables for one optimizer run. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Upper bound on tester invocations per zone.
    pub max_tries_per_zone: u32,
    /// Fraction of `max_tries_per_zone` successes (at least 3) that counts
    /// as converged; in `(0, 1]`.
    pub success_threshold: f64,
    /// Narrowing stops once the size range is at most twice this wide.
    pub min_range_width: i64,
    /// Derive the interval range from the current size range.
    pub correlation: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_tries_per_zone: 15,
            success_threshold: 0.5,
            min_range_width: 3,
            correlation: true,
        }
    }
}

/// Adaptive range search over fragmentation zones.
///
/// For each zone the search repeatedly asks the injected tester whether the
/// current (size, interval) ranges produce a working handshake, narrowing
/// the ranges on success and shifting them in a four-way rotation on
/// failure, with all steps sized by the golden-ratio conjugate. Zones are
/// searched strictly in the caller-supplied order and each zone's attempts
/// are strictly sequential; the search owns no shared mutable state.
pub struct RangeSearch {
    config: SearchConfig,
    observer: Option<SearchObserver>,
}

impl RangeSearch {
    /// Builds a search after verifying the golden-ratio constant against
    /// `(sqrt(5) - 1) / 2`. A mismatch means the binary's search constants
    /// are corrupted and is fatal, not recoverable.
    pub fn new(config: SearchConfig) -> Result<Self, ScanError> {
        let exact = (5.0_f64.sqrt() - 1.0) / 2.0;
        if (exact - PHI).abs() > 1e-4 {
            return Err(ScanError::SearchConfigIntegrity(PHI));
        }
        Ok(Self {
            config,
            observer: None,
        })
    }

    /// Registers a callback invoked after every tester call with a
    /// structured [`SearchEvent`]. Rendering lives with the caller.
    #[must_use]
    pub fn with_observer(mut self, observer: SearchObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Number of successes that ends a zone's search early.
    #[must_use]
    fn confidence_target(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = (f64::from(self.config.max_tries_per_zone) * self.config.success_threshold)
            .ceil() as u32;
        scaled.max(3)
    }

    /// Searches every zone in order and returns one result per zone.
    /// Zones with invalid bounds are skipped without a tester call.
    pub async fn run(
        &self,
        zones: &[Zone],
        tester: &dyn FragmentTester,
    ) -> Result<Vec<ZoneResult>, ScanError> {
        let mut results = Vec::with_capacity(zones.len());
        for zone in zones {
            if !zone.size.is_valid() || !zone.interval.is_valid() {
                warn!(
                    "skipping zone {:?}: invalid bounds size={} interval={}",
                    zone.name, zone.size, zone.interval
                );
                results.push(ZoneResult::skipped(&zone.name));
                continue;
            }
            results.push(self.search_zone(zone, tester).await?);
        }
        Ok(results)
    }

    /// Runs the bounded adaptive search for a single zone.
    pub async fn search_zone(
        &self,
        zone: &Zone,
        tester: &dyn FragmentTester,
    ) -> Result<ZoneResult, ScanError> {
        let target = self.confidence_target();
        let mut size = zone.size;
        let mut interval = if self.config.correlation {
            correlated_interval(size, zone.interval)
        } else {
            zone.interval
        };

        let mut result = ZoneResult::empty(&zone.name);
        let mut fail_streak = 0_u32;

        for attempt in 1..=self.config.max_tries_per_zone {
            size = size.clamped(zone.size);
            interval = interval.clamped(zone.interval);

            let outcome = tester.test(&zone.name, size, interval).await;
            result.total_tests += 1;

            if let Some(observer) = &self.observer {
                observer(&SearchEvent {
                    zone: zone.name.clone(),
                    attempt,
                    success: outcome.success,
                    size,
                    interval,
                    latency: outcome.latency,
                });
            }

            if outcome.success {
                fail_streak = 0;
                result.success_count += 1;
                if result
                    .best_latency
                    .is_none_or(|best| outcome.latency < best)
                {
                    result.best_size = Some(size);
                    result.best_interval = Some(interval);
                    result.best_latency = Some(outcome.latency);
                }
                if result.success_count >= target {
                    debug!(
                        "zone {:?} converged after {} attempts ({} successes)",
                        zone.name, attempt, result.success_count
                    );
                    break;
                }
                if size.width() > 2 * self.config.min_range_width {
                    size = size.narrowed();
                    interval = interval.narrowed();
                }
            } else {
                fail_streak += 1;
                if fail_streak >= 3 && result.best_latency.is_some() {
                    debug!(
                        "zone {:?}: fail streak with a recorded best, stopping",
                        zone.name
                    );
                    break;
                }
                let size_step = phi_step(size.width());
                let interval_step = phi_step(interval.width());
                match (attempt - 1) % 4 {
                    0 => {
                        size = size.shifted(-size_step);
                        interval = interval.shifted(-interval_step);
                    }
                    1 => {
                        size = size.shifted(size_step);
                        interval = interval.shifted(interval_step);
                    }
                    // Small fragments with long gaps are the combination
                    // most likely to slip past inspection.
                    2 => {
                        size = size.shifted(-size_step);
                        interval = interval.shifted(interval_step);
                    }
                    _ => {
                        size = size.widened(size_step, zone.size);
                        interval = interval.widened(interval_step, zone.interval);
                    }
                }
                if self.config.correlation {
                    interval = correlated_interval(size, zone.interval);
                }
            }
        }

        result.success = result.best_latency.is_some();
        Ok(result)
    }
}

/// Picks the best configuration across zones: highest success ratio, ties
/// broken by lowest best latency. Skipped and failed zones never win.
#[must_use]
pub fn select_best(results: &[ZoneResult]) -> Option<&ZoneResult> {
    results
        .iter()
        .filter(|r| r.success && r.total_tests > 0)
        .max_by(|a, b| {
            a.success_ratio()
                .partial_cmp(&b.success_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    // lower latency wins, so compare reversed
                    b.best_latency
                        .unwrap_or(Duration::MAX)
                        .cmp(&a.best_latency.unwrap_or(Duration::MAX))
                })
        })
}
