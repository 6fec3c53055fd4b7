//! Per-dependency circuit breaker: closed/open/half-open FSM over a rolling
//! window of call outcomes, generalized from the single ad-hoc
//! `CircuitBreaker`/`CircuitState` pair this codebase already keeps per
//! failover endpoint into a named registry any dependency can use.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Number of most recent call outcomes kept in the rolling window.
    pub window_size: usize,
    /// Minimum samples in the window before trip conditions are evaluated.
    pub min_samples: usize,
    /// Trip if failure-rate exceeds this over the window.
    pub failure_rate_threshold: f64,
    /// Trip if slow-call-rate exceeds this over the window.
    pub slow_rate_threshold: f64,
    /// A call slower than this counts as "slow" even if it succeeded.
    pub slow_call_threshold: Duration,
    /// How long to stay open before allowing a half-open probe.
    pub cooldown: Duration,
    /// Cooldown doubles on each re-trip from half-open, capped here.
    pub max_cooldown: Duration,
    /// Concurrent probe calls allowed while half-open.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_samples: 10,
            failure_rate_threshold: 0.5,
            slow_rate_threshold: 0.5,
            slow_call_threshold: Duration::from_millis(500),
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(300),
            half_open_probes: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerRejection {
    /// The circuit is open; the call was not attempted.
    CircuitOpen,
    /// The circuit is half-open and the probe budget is already spent.
    ProbeBudgetExhausted,
}

impl std::fmt::Display for BreakerRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerRejection::CircuitOpen => write!(f, "circuit open"),
            BreakerRejection::ProbeBudgetExhausted => write!(f, "half-open probe budget exhausted"),
        }
    }
}

impl std::error::Error for BreakerRejection {}

struct Sample {
    outcome: CallOutcome,
    slow: bool,
}

/// One breaker guarding a single named dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    window: VecDeque<Sample>,
    next_attempt_at: Option<Instant>,
    current_cooldown: Duration,
    half_open_in_flight: u32,
    half_open_failed: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let current_cooldown = config.cooldown;
        Self {
            config,
            state: CircuitState::Closed,
            window: VecDeque::new(),
            next_attempt_at: None,
            current_cooldown,
            half_open_in_flight: 0,
            half_open_failed: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Ask permission to make a call. On `Ok`, the caller must eventually
    /// report the outcome via [`CircuitBreaker::record`].
    fn try_acquire(&mut self, now: Instant) -> Result<(), BreakerRejection> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.next_attempt_at.is_some_and(|t| now >= t) {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_in_flight = 0;
                    self.half_open_failed = false;
                    self.try_acquire(now)
                } else {
                    Err(BreakerRejection::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight < self.config.half_open_probes {
                    self.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(BreakerRejection::ProbeBudgetExhausted)
                }
            }
        }
    }

    fn record(&mut self, now: Instant, outcome: CallOutcome, latency: Duration) {
        let slow = latency > self.config.slow_call_threshold;
        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                if outcome == CallOutcome::Failure || slow {
                    self.half_open_failed = true;
                }
                if self.half_open_in_flight == 0 {
                    if self.half_open_failed {
                        self.trip(now);
                    } else {
                        self.close();
                    }
                }
            }
            CircuitState::Closed => {
                self.window.push_back(Sample { outcome, slow });
                while self.window.len() > self.config.window_size {
                    self.window.pop_front();
                }
                if self.window.len() >= self.config.min_samples && self.should_trip() {
                    self.trip(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn should_trip(&self) -> bool {
        let n = self.window.len() as f64;
        let failures = self
            .window
            .iter()
            .filter(|s| s.outcome == CallOutcome::Failure)
            .count() as f64;
        let slow = self.window.iter().filter(|s| s.slow).count() as f64;
        (failures / n) > self.config.failure_rate_threshold
            || (slow / n) > self.config.slow_rate_threshold
    }

    fn trip(&mut self, now: Instant) {
        let was_half_open = self.state == CircuitState::HalfOpen;
        self.state = CircuitState::Open;
        if was_half_open {
            self.current_cooldown = (self.current_cooldown * 2).min(self.config.max_cooldown);
        } else {
            self.current_cooldown = self.config.cooldown;
        }
        self.next_attempt_at = Some(now + self.current_cooldown);
        warn!(cooldown_ms = self.current_cooldown.as_millis() as u64, "circuit tripped open");
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.window.clear();
        self.next_attempt_at = None;
        self.current_cooldown = self.config.cooldown;
        info!("circuit closed");
    }
}

/// Registry of named circuit breakers, one per external dependency, the way
/// the rest of this codebase keeps one registry per cross-cutting concern
/// (compare the SLO registry and the cache tag index).
pub struct CircuitRegistry {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    overrides: RwLock<HashMap<String, CircuitBreakerConfig>>,
}

impl CircuitRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Override the configuration used for breakers created after this call
    /// for the given dependency name. Has no effect on an already-created
    /// breaker.
    pub fn configure(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        self.overrides.write().insert(name.into(), config);
    }

    fn config_for(&self, name: &str) -> CircuitBreakerConfig {
        self.overrides
            .read()
            .get(name)
            .copied()
            .unwrap_or(self.default_config)
    }

    /// Run `f` through the named breaker, recording its latency and
    /// success/failure. `f` decides what counts as a failure via its
    /// `Result`; `Err` is recorded as `CallOutcome::Failure`.
    pub async fn call<F, Fut, T, E>(&self, name: &str, f: F) -> Result<Result<T, E>, BreakerRejection>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let now = Instant::now();
        {
            let mut breakers = self.breakers.write();
            let breaker = breakers
                .entry(name.to_string())
                .or_insert_with(|| CircuitBreaker::new(self.config_for(name)));
            breaker.try_acquire(now)?;
        }

        let start = Instant::now();
        let result = f().await;
        let latency = start.elapsed();
        let outcome = if result.is_ok() {
            CallOutcome::Success
        } else {
            CallOutcome::Failure
        };
        self.breakers
            .write()
            .get_mut(name)
            .expect("breaker inserted above")
            .record(Instant::now(), outcome, latency);
        Ok(result)
    }

    pub fn state(&self, name: &str) -> CircuitState {
        self.breakers
            .read()
            .get(name)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window_size: 10,
            min_samples: 4,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_millis(10),
            max_cooldown: Duration::from_millis(100),
            half_open_probes: 1,
            ..CircuitBreakerConfig::default()
        }
    }

    #[tokio::test]
    async fn closed_allows_calls_until_threshold_trips() {
        let registry = CircuitRegistry::new(failing_config());
        for _ in 0..4 {
            let r: Result<Result<(), &str>, _> = registry.call("dep", || async { Err("boom") }).await;
            assert!(r.is_ok());
        }
        assert_eq!(registry.state("dep"), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_short_circuits_without_calling() {
        let registry = CircuitRegistry::new(failing_config());
        for _ in 0..4 {
            let _: Result<Result<(), &str>, _> = registry.call("dep", || async { Err("boom") }).await;
        }
        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called2 = called.clone();
        let r = registry
            .call("dep", || async move {
                called2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;
        assert_eq!(r.unwrap_err(), BreakerRejection::CircuitOpen);
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_circuit() {
        let registry = CircuitRegistry::new(failing_config());
        for _ in 0..4 {
            let _: Result<Result<(), &str>, _> = registry.call("dep", || async { Err("boom") }).await;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
        let r: Result<Result<(), &str>, _> = registry.call("dep", || async { Ok(()) }).await;
        assert!(r.is_ok());
        assert_eq!(registry.state("dep"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_with_longer_cooldown() {
        let registry = CircuitRegistry::new(failing_config());
        for _ in 0..4 {
            let _: Result<Result<(), &str>, _> = registry.call("dep", || async { Err("boom") }).await;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
        let _: Result<Result<(), &str>, _> = registry.call("dep", || async { Err("boom") }).await;
        assert_eq!(registry.state("dep"), CircuitState::Open);
    }

    #[tokio::test]
    async fn slow_calls_count_toward_trip_even_if_successful() {
        let config = CircuitBreakerConfig {
            window_size: 10,
            min_samples: 4,
            slow_rate_threshold: 0.5,
            slow_call_threshold: Duration::from_millis(1),
            cooldown: Duration::from_millis(10),
            ..CircuitBreakerConfig::default()
        };
        let registry = CircuitRegistry::new(config);
        for _ in 0..4 {
            let r: Result<Result<(), &str>, _> = registry
                .call("dep", || async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(())
                })
                .await;
            assert!(r.is_ok());
        }
        assert_eq!(registry.state("dep"), CircuitState::Open);
    }
}
