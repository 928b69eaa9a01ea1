//! Circuit breaker implementation
//!
//! One breaker per dependency name. Failure rate is computed over a rolling
//! sample window; state transitions follow CLOSED → OPEN → HALF_OPEN → CLOSED.
//!
//! Time-based transitions (OPEN → HALF_OPEN) are evaluated lazily on the next
//! [`CircuitBreaker::allow_request`] or [`CircuitBreaker::state`] call — there
//! is no background timer, so tests must query to observe the transition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::metrics::{CIRCUIT_STATE, MetricsSink};

/// Circuit breaker state
///
/// Declaration order matters: the exported gauge is the ordinal
/// (closed = 0, half-open = 1, open = 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is half-open (allowing limited probe requests)
    HalfOpen,
    /// Circuit is open (blocking requests)
    Open,
}

impl CircuitState {
    /// Gauge value exported for this state.
    #[must_use]
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }

    /// Lowercase name, matching the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

/// Serializable breaker snapshot for the admin inspection endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Dependency this breaker protects
    pub dependency: String,
    /// Current state
    pub state: CircuitState,
    /// Samples currently inside the rolling window
    pub samples: usize,
    /// Failures among those samples
    pub failures: usize,
}

/// Mutable breaker state, guarded by a single mutex. Critical sections are a
/// few comparisons and an increment.
#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Rolling window of `(timestamp, success)` outcomes.
    samples: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    /// Probes handed out during the current HALF_OPEN episode.
    probes: u32,
    /// Consecutive successes during the current HALF_OPEN episode.
    probe_successes: u32,
}

/// Circuit breaker for a single dependency
pub struct CircuitBreaker {
    /// Dependency name (gauge label)
    name: String,
    error_threshold_pct: f64,
    min_samples: usize,
    window: Duration,
    open_duration: Duration,
    half_open_max_requests: u32,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new breaker in the CLOSED state and export its gauge.
    #[must_use]
    pub fn new(
        name: &str,
        config: &CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let breaker = Self {
            name: name.to_string(),
            error_threshold_pct: config.error_threshold_pct,
            min_samples: config.min_samples,
            window: config.window,
            open_duration: config.open_duration,
            half_open_max_requests: config.half_open_max_requests,
            clock,
            metrics,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                samples: VecDeque::new(),
                opened_at: None,
                probes: 0,
                probe_successes: 0,
            }),
        };
        breaker.export_gauge(CircuitState::Closed);
        breaker
    }

    /// Check whether a request may proceed.
    ///
    /// No side effects besides lazy time-based transition checks and probe
    /// accounting while half-open; safe to call before every guarded
    /// operation.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance_time(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probes < self.half_open_max_requests {
                    inner.probes += 1;
                    debug!(
                        dependency = %self.name,
                        probe = inner.probes,
                        budget = self.half_open_max_requests,
                        "Half-open probe allowed"
                    );
                    true
                } else {
                    // Probe budget spent; deny until outstanding outcomes arrive.
                    false
                }
            }
        }
    }

    /// Record a successful call. Never panics.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.advance_time(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                let now = self.clock.now();
                inner.samples.push_back((now, true));
                self.evict_old(&mut inner, now);
            }
            CircuitState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.half_open_max_requests {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call. Never panics.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.advance_time(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                let now = self.clock.now();
                inner.samples.push_back((now, false));
                self.evict_old(&mut inner, now);

                let total = inner.samples.len();
                if total < self.min_samples {
                    return;
                }
                let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
                #[allow(clippy::cast_precision_loss)]
                let rate = failures as f64 / total as f64 * 100.0;
                if rate >= self.error_threshold_pct {
                    warn!(
                        dependency = %self.name,
                        failure_rate_pct = rate,
                        threshold_pct = self.error_threshold_pct,
                        samples = total,
                        "Failure rate over threshold"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // A probe failed: reopen immediately and restart the timer.
                warn!(dependency = %self.name, "Probe failed while half-open, reopening circuit");
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, after lazy time-based transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance_time(&mut inner);
        inner.state
    }

    /// Snapshot for the admin inspection endpoint.
    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.inner.lock();
        self.advance_time(&mut inner);
        let now = self.clock.now();
        self.evict_old(&mut inner, now);
        let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
        BreakerStatus {
            dependency: self.name.clone(),
            state: inner.state,
            samples: inner.samples.len(),
            failures,
        }
    }

    /// Apply the OPEN → HALF_OPEN edge once `open_duration` has elapsed.
    fn advance_time(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };
        if self.clock.now().duration_since(opened_at) >= self.open_duration {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    /// Remove samples older than the rolling window.
    fn evict_old(&self, inner: &mut Inner, now: Instant) {
        while let Some((ts, _)) = inner.samples.front() {
            if now.duration_since(*ts) >= self.window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, new_state: CircuitState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        inner.state = new_state;

        match new_state {
            CircuitState::Closed => {
                inner.samples.clear();
                inner.opened_at = None;
                inner.probes = 0;
                inner.probe_successes = 0;
                info!(dependency = %self.name, "Circuit breaker closed");
            }
            CircuitState::Open => {
                inner.opened_at = Some(self.clock.now());
                warn!(
                    dependency = %self.name,
                    from = old_state.as_str(),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.probes = 0;
                inner.probe_successes = 0;
                debug!(dependency = %self.name, "Circuit breaker half-open");
            }
        }

        self.export_gauge(new_state);
    }

    fn export_gauge(&self, state: CircuitState) {
        self.metrics.set_gauge(
            CIRCUIT_STATE,
            &[("dependency", self.name.clone())],
            state.gauge_value(),
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::RecordingSink;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            error_threshold_pct: 50.0,
            min_samples: 4,
            window: Duration::from_secs(60),
            open_duration: Duration::from_millis(300),
            half_open_max_requests: 3,
        }
    }

    fn breaker_with(
        config: &CircuitBreakerConfig,
    ) -> (CircuitBreaker, Arc<ManualClock>, Arc<RecordingSink>) {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingSink::new());
        let breaker = CircuitBreaker::new(
            "db_primary",
            config,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&sink) as Arc<dyn MetricsSink>,
        );
        (breaker, clock, sink)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    #[test]
    fn full_lifecycle_closed_open_half_open_closed() {
        // GIVEN: min_samples=4, threshold 50%, open for 300ms, 3 probes to close
        let (cb, clock, sink) = breaker_with(&test_config());

        // WHEN: 4 consecutive failures
        for _ in 0..4 {
            cb.record_failure();
        }
        // THEN: open, gauge 2
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert_eq!(sink.gauge_value(CIRCUIT_STATE, ("dependency", "db_primary")), Some(2.0));

        // WHEN: the open duration elapses
        clock.advance(Duration::from_millis(350));
        // THEN: next query observes half-open, gauge 1
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(sink.gauge_value(CIRCUIT_STATE, ("dependency", "db_primary")), Some(1.0));

        // WHEN: 3 consecutive probe successes
        for _ in 0..3 {
            cb.record_success();
        }
        // THEN: closed again, gauge 0
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
        assert_eq!(sink.gauge_value(CIRCUIT_STATE, ("dependency", "db_primary")), Some(0.0));
    }

    #[test]
    fn stays_closed_below_min_samples() {
        // 100% local failure rate but only 3 of 4 required samples
        let (cb, _clock, _sink) = breaker_with(&test_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn stays_closed_below_error_threshold() {
        let (cb, _clock, _sink) = breaker_with(&test_config());
        // 6 samples, 2 failures → 33% < 50%
        for _ in 0..4 {
            cb.record_success();
        }
        for _ in 0..2 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let (cb, _clock, _sink) = breaker_with(&test_config());
        // 2 successes + 2 failures → 50% at 4 samples, threshold inclusive
        cb.record_success();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    // ── Open state ───────────────────────────────────────────────────────────

    #[test]
    fn open_denies_until_duration_elapses() {
        let (cb, clock, _sink) = breaker_with(&test_config());
        for _ in 0..4 {
            cb.record_failure();
        }
        assert!(!cb.allow_request());
        clock.advance(Duration::from_millis(299));
        assert!(!cb.allow_request(), "still open just before the deadline");
        clock.advance(Duration::from_millis(1));
        assert!(cb.allow_request(), "half-open probe allowed at the deadline");
    }

    #[test]
    fn outcomes_recorded_while_open_are_ignored() {
        let (cb, _clock, _sink) = breaker_with(&test_config());
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    // ── Half-open state ──────────────────────────────────────────────────────

    fn open_then_half_open(cb: &CircuitBreaker, clock: &ManualClock) {
        for _ in 0..4 {
            cb.record_failure();
        }
        clock.advance(Duration::from_millis(350));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_caps_outstanding_probes() {
        let (cb, clock, _sink) = breaker_with(&test_config());
        open_then_half_open(&cb, &clock);

        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(!cb.allow_request(), "4th probe denied until outcomes arrive");
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_timer() {
        let (cb, clock, sink) = breaker_with(&test_config());
        open_then_half_open(&cb, &clock);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(sink.gauge_value(CIRCUIT_STATE, ("dependency", "db_primary")), Some(2.0));

        // Timer restarted: still open 200ms later, half-open after the full 300ms
        clock.advance(Duration::from_millis(200));
        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance(Duration::from_millis(100));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn closing_clears_the_failure_window() {
        let (cb, clock, _sink) = breaker_with(&test_config());
        open_then_half_open(&cb, &clock);
        for _ in 0..3 {
            cb.record_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        // The old failures are gone: it takes min_samples fresh failures to reopen
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    // ── Window eviction ──────────────────────────────────────────────────────

    #[test]
    fn samples_outside_window_are_excluded_from_the_rate() {
        let config = CircuitBreakerConfig {
            window: Duration::from_secs(10),
            ..test_config()
        };
        let (cb, clock, _sink) = breaker_with(&config);

        // 3 old failures, then everything ages out of the window
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(11));

        // 1 fresh failure alone is below min_samples — must stay closed
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    // ── Gauge ordinals ───────────────────────────────────────────────────────

    #[test]
    fn gauge_values_match_state_ordinals() {
        assert_eq!(CircuitState::Closed.gauge_value(), 0.0);
        assert_eq!(CircuitState::HalfOpen.gauge_value(), 1.0);
        assert_eq!(CircuitState::Open.gauge_value(), 2.0);
    }

    #[test]
    fn new_breaker_exports_closed_gauge() {
        let (_cb, _clock, sink) = breaker_with(&test_config());
        assert_eq!(sink.gauge_value(CIRCUIT_STATE, ("dependency", "db_primary")), Some(0.0));
    }

    // ── Status snapshot ──────────────────────────────────────────────────────

    #[test]
    fn status_reports_window_contents() {
        let (cb, _clock, _sink) = breaker_with(&test_config());
        cb.record_success();
        cb.record_failure();
        let status = cb.status();
        assert_eq!(status.dependency, "db_primary");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.samples, 2);
        assert_eq!(status.failures, 1);
    }

    // ── Independence ─────────────────────────────────────────────────────────

    #[test]
    fn breakers_for_different_dependencies_are_independent() {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingSink::new());
        let config = test_config();
        let a = CircuitBreaker::new(
            "db_primary",
            &config,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&sink) as Arc<dyn MetricsSink>,
        );
        let b = CircuitBreaker::new(
            "cache",
            &config,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&sink) as Arc<dyn MetricsSink>,
        );
        for _ in 0..4 {
            a.record_failure();
        }
        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
