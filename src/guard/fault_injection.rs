//! Fault injection — forcing real failure modes at named points.
//!
//! Tests (and, carefully, operators running drills) enable a [`FaultPoint`];
//! thin hook call sites elsewhere check [`FaultInjector::is_enabled`] and
//! raise a typed error when active. The injected errors are indistinguishable
//! from real faults to the surrounding code, so the same breaker and fail-open
//! paths get exercised. The injector itself never errors.
//!
//! TTL expiry is lazy: `is_enabled` compares elapsed time on each query; the
//! stored flag is not eagerly cleared by a timer.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::{Error, Result};

/// Parameter map attached to an injection point.
pub type FaultParams = serde_json::Map<String, serde_json::Value>;

/// The fixed set of injection points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPoint {
    /// Database calls time out
    DbTimeout,
    /// External tariff API returns 5xx
    External5xxBurst,
    /// Drill: toggle a kill switch through the fault API
    KillswitchToggle,
    /// Pre-charge rate-limit windows with synthetic attempts
    RateLimitSpike,
    /// The guard chain itself errors (exercises fail-open)
    GuardInternalError,
}

impl FaultPoint {
    /// All points, for bulk operations and admin listings.
    pub const ALL: [Self; 5] = [
        Self::DbTimeout,
        Self::External5xxBurst,
        Self::KillswitchToggle,
        Self::RateLimitSpike,
        Self::GuardInternalError,
    ];

    /// Snake-case name, matching the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DbTimeout => "db_timeout",
            Self::External5xxBurst => "external_5xx_burst",
            Self::KillswitchToggle => "killswitch_toggle",
            Self::RateLimitSpike => "rate_limit_spike",
            Self::GuardInternalError => "guard_internal_error",
        }
    }
}

impl FromStr for FaultPoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown fault point: {s}")))
    }
}

#[derive(Debug, Clone)]
struct PointState {
    enabled: bool,
    params: FaultParams,
    enabled_at: Instant,
    /// Zero means no auto-expiry.
    ttl: Duration,
}

/// Fault-injection registry, one per process.
///
/// Constructed once at startup and handed to consumers by reference; call
/// [`reset`](Self::reset) between tests rather than re-instantiating.
#[derive(Debug)]
pub struct FaultInjector {
    points: DashMap<FaultPoint, PointState>,
    clock: Arc<dyn Clock>,
}

impl FaultInjector {
    /// Create an injector with all points disabled.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            points: DashMap::new(),
            clock,
        }
    }

    /// Activate a point. A zero `ttl` means it never auto-expires.
    pub fn enable(&self, point: FaultPoint, params: FaultParams, ttl: Duration) {
        info!(
            point = point.as_str(),
            ttl_seconds = ttl.as_secs_f64(),
            "Fault injection enabled"
        );
        self.points.insert(
            point,
            PointState {
                enabled: true,
                params,
                enabled_at: self.clock.now(),
                ttl,
            },
        );
    }

    /// Whether the point is active: enabled, and within its TTL if one is set.
    #[must_use]
    pub fn is_enabled(&self, point: FaultPoint) -> bool {
        self.points.get(&point).is_some_and(|state| {
            state.enabled
                && (state.ttl.is_zero()
                    || self.clock.now().duration_since(state.enabled_at) < state.ttl)
        })
    }

    /// Deactivate a single point and clear its params.
    pub fn disable(&self, point: FaultPoint) {
        if let Some(mut state) = self.points.get_mut(&point) {
            state.enabled = false;
            state.params = FaultParams::new();
            debug!(point = point.as_str(), "Fault injection disabled");
        }
    }

    /// Deactivate every point.
    pub fn disable_all(&self) {
        for point in FaultPoint::ALL {
            self.disable(point);
        }
    }

    /// Stored parameters for a point, or an empty map.
    #[must_use]
    pub fn get_params(&self, point: FaultPoint) -> FaultParams {
        self.points
            .get(&point)
            .map(|state| state.params.clone())
            .unwrap_or_default()
    }

    /// Test-isolation hook: drop all state so no fault leaks across tests.
    pub fn reset(&self) {
        self.points.clear();
    }
}

// ── Hook call sites ──────────────────────────────────────────────────────────
//
// Placed next to the real operation they shadow; each is a single is_enabled
// check and a typed error.

/// Raise [`Error::Timeout`] when `DB_TIMEOUT` is active. Call before any
/// database operation under drill.
pub fn db_timeout_hook(injector: &FaultInjector) -> Result<()> {
    if injector.is_enabled(FaultPoint::DbTimeout) {
        return Err(Error::Timeout("injected database timeout".to_string()));
    }
    Ok(())
}

/// Raise [`Error::Upstream`] when `EXTERNAL_5XX_BURST` is active. Call before
/// any outbound tariff-API request under drill.
pub fn external_5xx_hook(injector: &FaultInjector) -> Result<()> {
    if injector.is_enabled(FaultPoint::External5xxBurst) {
        return Err(Error::Upstream(
            "injected upstream 5xx burst".to_string(),
        ));
    }
    Ok(())
}

/// Raise [`Error::GuardInternal`] when `GUARD_INTERNAL_ERROR` is active.
/// Called inside the orchestrator's evaluation chain to exercise fail-open.
pub fn guard_error_hook(injector: &FaultInjector) -> Result<()> {
    if injector.is_enabled(FaultPoint::GuardInternalError) {
        return Err(Error::GuardInternal(
            "injected guard evaluation failure".to_string(),
        ));
    }
    Ok(())
}
