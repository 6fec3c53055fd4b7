//! SLO compliance tracking: a rolling window of hourly buckets per named
//! SLO, plus a latency histogram, so callers can ask "are we inside budget"
//! without re-deriving it from raw events each time.
//!
//! Reuses [`crate::performance::latency::LatencyHistogram`] for the
//! per-SLO latency distribution rather than introducing a second histogram
//! implementation — same fixed log-bucket layout this codebase already uses
//! for hot-path latency, so `latency_quantile` is O(log buckets) with no
//! allocation.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::performance::latency::LatencyHistogram;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SloConfig {
    /// Total rolling window tracked (default 30 days).
    pub window: Duration,
    /// Width of each bucket the window is divided into (default 1 hour).
    pub bucket_width: Duration,
    /// Fraction of events that must be "good" to meet the SLO (e.g. 0.999).
    pub target: f64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 24 * 3600),
            bucket_width: Duration::from_secs(3600),
            target: 0.999,
        }
    }
}

struct Bucket {
    start: Instant,
    good: u64,
    total: u64,
}

struct SloState {
    config: SloConfig,
    buckets: VecDeque<Bucket>,
    histogram: LatencyHistogram,
}

impl SloState {
    fn new(config: SloConfig) -> Self {
        Self {
            config,
            buckets: VecDeque::new(),
            histogram: LatencyHistogram::new(),
        }
    }

    fn max_buckets(&self) -> usize {
        (self.config.window.as_secs_f64() / self.config.bucket_width.as_secs_f64()).ceil() as usize
    }

    /// Drop buckets older than the window and start a fresh current bucket
    /// if the last one's width has elapsed. Runs before every record so the
    /// window is always accurate at read time, not just at rotation time.
    fn rotate(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.duration_since(front.start) > self.config.window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
        let needs_new = match self.buckets.back() {
            Some(b) => now.duration_since(b.start) >= self.config.bucket_width,
            None => true,
        };
        if needs_new {
            self.buckets.push_back(Bucket { start: now, good: 0, total: 0 });
            let max = self.max_buckets().max(1);
            while self.buckets.len() > max {
                self.buckets.pop_front();
            }
        }
    }

    fn record(&mut self, now: Instant, good: bool, latency_us: u64) {
        self.rotate(now);
        let bucket = self.buckets.back_mut().expect("rotate always leaves a current bucket");
        bucket.total += 1;
        if good {
            bucket.good += 1;
        }
        self.histogram.record(latency_us);
    }

    fn compliance(&self) -> f64 {
        let (good, total) = self
            .buckets
            .iter()
            .fold((0u64, 0u64), |(g, t), b| (g + b.good, t + b.total));
        if total == 0 {
            1.0
        } else {
            good as f64 / total as f64
        }
    }

    fn error_budget(&self) -> f64 {
        let compliance = self.compliance();
        (1.0 - self.config.target) - (1.0 - compliance)
    }
}

/// Registry of named SLOs, each independently configurable.
pub struct SloMonitor {
    default_config: SloConfig,
    overrides: RwLock<HashMap<String, SloConfig>>,
    states: RwLock<HashMap<String, SloState>>,
}

impl SloMonitor {
    pub fn new(default_config: SloConfig) -> Self {
        Self {
            default_config,
            overrides: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn configure(&self, name: impl Into<String>, config: SloConfig) {
        self.overrides.write().insert(name.into(), config);
    }

    fn config_for(&self, name: &str) -> SloConfig {
        self.overrides.read().get(name).copied().unwrap_or(self.default_config)
    }

    pub fn record(&self, name: &str, good: bool, latency: Duration) {
        let mut states = self.states.write();
        let state = states
            .entry(name.to_string())
            .or_insert_with(|| SloState::new(self.config_for(name)));
        state.record(Instant::now(), good, latency.as_micros() as u64);
    }

    /// Ratio of good events in the current window. `1.0` for an SLO with no
    /// recorded events yet.
    pub fn compliance(&self, name: &str) -> f64 {
        self.states.read().get(name).map(|s| s.compliance()).unwrap_or(1.0)
    }

    /// `(1 - target) - (1 - compliance)`; negative means the error budget is
    /// exhausted.
    pub fn error_budget(&self, name: &str) -> f64 {
        self.states
            .read()
            .get(name)
            .map(|s| s.error_budget())
            .unwrap_or(1.0 - self.config_for(name).target)
    }

    /// Latency at quantile `q` (0.0..=1.0) in microseconds.
    pub fn latency_quantile(&self, name: &str, q: f64) -> u64 {
        self.states
            .read()
            .get(name)
            .map(|s| s.histogram.percentile(q * 100.0))
            .unwrap_or(0)
    }
}

impl Default for SloMonitor {
    fn default() -> Self {
        Self::new(SloConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compliance_tracks_good_ratio() {
        let monitor = SloMonitor::default();
        for _ in 0..9 {
            monitor.record("submit_order", true, Duration::from_millis(1));
        }
        monitor.record("submit_order", false, Duration::from_millis(1));
        assert!((monitor.compliance("submit_order") - 0.9).abs() < 1e-9);
    }

    #[test]
    fn error_budget_goes_negative_when_target_missed() {
        let mut config = SloConfig::default();
        config.target = 0.999;
        let monitor = SloMonitor::new(config);
        for _ in 0..90 {
            monitor.record("submit_order", true, Duration::from_millis(1));
        }
        for _ in 0..10 {
            monitor.record("submit_order", false, Duration::from_millis(1));
        }
        assert!(monitor.error_budget("submit_order") < 0.0);
    }

    #[test]
    fn unrecorded_slo_reports_full_compliance() {
        let monitor = SloMonitor::default();
        assert_eq!(monitor.compliance("never_called"), 1.0);
        assert!(monitor.error_budget("never_called") >= 0.0);
    }

    #[test]
    fn latency_quantile_reflects_recorded_samples() {
        let monitor = SloMonitor::default();
        for ms in [1, 5, 10, 50, 100] {
            monitor.record("submit_order", true, Duration::from_millis(ms));
        }
        let p99 = monitor.latency_quantile("submit_order", 0.99);
        assert!(p99 >= 50_000);
    }

    #[test]
    fn per_slo_override_is_isolated() {
        let monitor = SloMonitor::default();
        monitor.configure("strict", SloConfig { target: 0.9999, ..SloConfig::default() });
        monitor.record("strict", true, Duration::from_millis(1));
        monitor.record("lenient", true, Duration::from_millis(1));
        assert_eq!(monitor.compliance("strict"), 1.0);
        assert_eq!(monitor.compliance("lenient"), 1.0);
    }
}
