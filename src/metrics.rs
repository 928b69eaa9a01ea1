//! Metrics sink abstraction and scoped request timing.
//!
//! Guards never talk to the `metrics` facade directly; they go through
//! [`MetricsSink`] so tests can capture every emission with [`RecordingSink`]
//! and assert on it (including the label-cardinality drift guard — each metric
//! below has a *closed* label set).
//!
//! Metric inventory:
//!
//! | name | type | labels |
//! |---|---|---|
//! | `guard_api_requests_total` | counter | `endpoint`, `method`, `status_class` |
//! | `guard_rate_limit_total` | counter | `endpoint`, `decision` |
//! | `guard_denials_total` | counter | `endpoint`, `reason` |
//! | `guard_internal_errors_total` | counter | `endpoint` |
//! | `guard_circuit_state` | gauge | `dependency` (value = state ordinal) |
//! | `guard_kill_switch_enabled` | gauge | `switch` (value 0/1) |
//! | `guard_request_duration_seconds` | histogram | `endpoint`, `method` |

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Counter: API requests by endpoint, method, and status class.
pub const API_REQUESTS_TOTAL: &str = "guard_api_requests_total";
/// Counter: rate-limit decisions by endpoint.
pub const RATE_LIMIT_TOTAL: &str = "guard_rate_limit_total";
/// Counter: guard denials by endpoint and reason.
pub const DENIALS_TOTAL: &str = "guard_denials_total";
/// Counter: errors raised inside the guard chain itself (fail-open path).
pub const GUARD_INTERNAL_ERRORS_TOTAL: &str = "guard_internal_errors_total";
/// Gauge: circuit-breaker state ordinal per dependency.
pub const CIRCUIT_STATE: &str = "guard_circuit_state";
/// Gauge: kill-switch state (0/1) per switch.
pub const KILL_SWITCH_ENABLED: &str = "guard_kill_switch_enabled";
/// Histogram: request duration per endpoint and method.
pub const REQUEST_DURATION_SECONDS: &str = "guard_request_duration_seconds";

/// Label set for a single emission: `(key, value)` pairs.
pub type Labels<'a> = &'a [(&'static str, String)];

/// Sink for guard metrics.
///
/// Implementations must be cheap and infallible — metrics emission happens on
/// the request hot path and must never take it down.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Increment a counter by one.
    fn increment(&self, name: &'static str, labels: Labels<'_>);
    /// Set a gauge to an absolute value.
    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);
    /// Record a histogram observation.
    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Production sink forwarding to the `metrics` facade (exported to Prometheus
/// when the `metrics` feature installs a recorder in `main`).
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetrySink;

fn to_labels(labels: Labels<'_>) -> Vec<telemetry_metrics::Label> {
    labels
        .iter()
        .map(|(key, value)| telemetry_metrics::Label::new(*key, value.clone()))
        .collect()
}

impl MetricsSink for TelemetrySink {
    fn increment(&self, name: &'static str, labels: Labels<'_>) {
        telemetry_metrics::counter!(name, to_labels(labels)).increment(1);
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        telemetry_metrics::gauge!(name, to_labels(labels)).set(value);
    }

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        telemetry_metrics::histogram!(name, to_labels(labels)).record(value);
    }
}

/// A single captured metric emission.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    /// Counter increment.
    Increment {
        /// Metric name.
        name: &'static str,
        /// Label pairs as emitted.
        labels: Vec<(&'static str, String)>,
    },
    /// Gauge set.
    Gauge {
        /// Metric name.
        name: &'static str,
        /// Label pairs as emitted.
        labels: Vec<(&'static str, String)>,
        /// Gauge value.
        value: f64,
    },
    /// Histogram observation.
    Observe {
        /// Metric name.
        name: &'static str,
        /// Label pairs as emitted.
        labels: Vec<(&'static str, String)>,
        /// Observed value.
        value: f64,
    },
}

impl MetricEvent {
    /// Metric name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Increment { name, .. } | Self::Gauge { name, .. } | Self::Observe { name, .. } => name,
        }
    }

    /// Label keys of this event, in emission order.
    #[must_use]
    pub fn label_keys(&self) -> Vec<&'static str> {
        match self {
            Self::Increment { labels, .. }
            | Self::Gauge { labels, .. }
            | Self::Observe { labels, .. } => labels.iter().map(|(k, _)| *k).collect(),
        }
    }
}

/// Test sink that records every emission for later assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingSink {
    /// Create an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Events for a single metric name.
    #[must_use]
    pub fn events_for(&self, name: &str) -> Vec<MetricEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    /// Latest gauge value for `name` with a matching label pair.
    #[must_use]
    pub fn gauge_value(&self, name: &str, label: (&str, &str)) -> Option<f64> {
        self.events
            .lock()
            .iter()
            .rev()
            .find_map(|e| match e {
                MetricEvent::Gauge { name: n, labels, value }
                    if *n == name && labels.iter().any(|(k, v)| *k == label.0 && v == label.1) =>
                {
                    Some(*value)
                }
                _ => None,
            })
    }

    /// Count of increments for `name`, optionally filtered by a label pair.
    #[must_use]
    pub fn increments(&self, name: &str, label: Option<(&str, &str)>) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| match e {
                MetricEvent::Increment { name: n, labels } if *n == name => label
                    .is_none_or(|(lk, lv)| labels.iter().any(|(k, v)| *k == lk && v == lv)),
                _ => false,
            })
            .count()
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl MetricsSink for RecordingSink {
    fn increment(&self, name: &'static str, labels: Labels<'_>) {
        self.events.lock().push(MetricEvent::Increment {
            name,
            labels: labels.to_vec(),
        });
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.events.lock().push(MetricEvent::Gauge {
            name,
            labels: labels.to_vec(),
            value,
        });
    }

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.events.lock().push(MetricEvent::Observe {
            name,
            labels: labels.to_vec(),
            value,
        });
    }
}

/// RAII timer that records a duration histogram when dropped.
///
/// The observation happens on every exit path, normal or unwinding, and never
/// alters the propagation of an in-flight panic or error.
#[derive(Debug)]
pub struct ScopedTimer {
    sink: Arc<dyn MetricsSink>,
    name: &'static str,
    labels: Vec<(&'static str, String)>,
    started: Instant,
}

impl ScopedTimer {
    /// Start timing; the observation is emitted on drop.
    #[must_use]
    pub fn start(
        sink: Arc<dyn MetricsSink>,
        name: &'static str,
        labels: Vec<(&'static str, String)>,
    ) -> Self {
        Self {
            sink,
            name,
            labels,
            started: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.sink.observe(self.name, &self.labels, elapsed);
    }
}
