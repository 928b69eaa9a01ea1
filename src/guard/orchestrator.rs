//! Guard orchestrator — sequences kill switches, rate limits, and circuit
//! breakers around every guarded request.
//!
//! Evaluation order: kill switches (import-global, tenant, degrade) → rate
//! limit → circuit breaker per declared dependency. The first denial wins.
//! If the chain itself errors, the error is caught at this boundary, logged,
//! counted, and the request is allowed through: a bug in the guards must never
//! reduce availability below what it would be without them. The one exception
//! is an internal rate-limiter error with `fail_closed` set, which denies.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::guard::circuit_breaker::{BreakerStatus, CircuitBreaker};
use crate::guard::fault_injection::{FaultInjector, FaultPoint, guard_error_hook};
use crate::guard::kill_switch::{DEGRADE_MODE, GLOBAL_IMPORT, KillSwitchManager, tenant_switch};
use crate::guard::rate_limit::{EndpointClass, RateDecision, RateLimitGuard};
use crate::metrics::{
    DENIALS_TOTAL, GUARD_INTERNAL_ERRORS_TOTAL, MetricsSink, RATE_LIMIT_TOTAL,
};
use crate::Result;

/// Dependencies an endpoint may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    /// Primary database (writes)
    DbPrimary,
    /// Read replica
    DbReplica,
    /// Cache cluster
    Cache,
    /// External tariff/OCR API
    ExternalApi,
    /// Background import worker pool
    ImportWorker,
}

impl Dependency {
    /// All dependencies, for admin listings.
    pub const ALL: [Self; 5] = [
        Self::DbPrimary,
        Self::DbReplica,
        Self::Cache,
        Self::ExternalApi,
        Self::ImportWorker,
    ];

    /// Snake-case name, matching the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DbPrimary => "db_primary",
            Self::DbReplica => "db_replica",
            Self::Cache => "cache",
            Self::ExternalApi => "external_api",
            Self::ImportWorker => "import_worker",
        }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    /// A kill switch is engaged
    KillSwitched,
    /// Over the endpoint's quota for the current window
    RateLimited,
    /// A declared dependency's circuit is open
    CircuitOpen,
}

impl DenyReason {
    /// SCREAMING_SNAKE name, matching the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KillSwitched => "KILL_SWITCHED",
            Self::RateLimited => "RATE_LIMITED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
        }
    }
}

/// A structured denial, returned as a value — never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    /// Why the request was denied
    pub reason: DenyReason,
    /// Seconds to wait before retrying, where known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl Denial {
    /// HTTP status for this denial: 429 for rate limiting, 503 otherwise.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self.reason {
            DenyReason::RateLimited => 429,
            DenyReason::KillSwitched | DenyReason::CircuitOpen => 503,
        }
    }
}

/// Identity of an inbound request, as the guards see it.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Request path
    pub endpoint: &'a str,
    /// HTTP method
    pub method: &'a str,
    /// Tenant id, when the caller supplied one
    pub tenant: Option<&'a str>,
}

/// Static endpoint-path → ordered-dependency mapping.
///
/// Unmapped endpoints get an empty list: no circuit-breaker checks apply.
#[derive(Debug, Clone, Default)]
pub struct EndpointDependencies {
    map: HashMap<String, Vec<Dependency>>,
}

impl EndpointDependencies {
    /// Build from a path → dependency-list map.
    #[must_use]
    pub fn new(map: HashMap<String, Vec<Dependency>>) -> Self {
        Self { map }
    }

    /// Declared dependencies for `endpoint`, in order.
    #[must_use]
    pub fn for_endpoint(&self, endpoint: &str) -> &[Dependency] {
        self.map.get(endpoint).map_or(&[], Vec::as_slice)
    }
}

/// Composes all guards for the request path.
#[derive(Debug)]
pub struct GuardOrchestrator {
    kill_switches: Arc<KillSwitchManager>,
    rate_limit: Arc<RateLimitGuard>,
    injector: Arc<FaultInjector>,
    breakers: DashMap<Dependency, Arc<CircuitBreaker>>,
    dependencies: EndpointDependencies,
    breaker_config: CircuitBreakerConfig,
    fail_closed: bool,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl GuardOrchestrator {
    /// Create an orchestrator over the given guard components.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kill_switches: Arc<KillSwitchManager>,
        rate_limit: Arc<RateLimitGuard>,
        injector: Arc<FaultInjector>,
        dependencies: EndpointDependencies,
        breaker_config: CircuitBreakerConfig,
        fail_closed: bool,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            kill_switches,
            rate_limit,
            injector,
            breakers: DashMap::new(),
            dependencies,
            breaker_config,
            fail_closed,
            clock,
            metrics,
        }
    }

    /// Evaluate the guard chain for one request.
    ///
    /// `None` means the request may proceed. Internal errors are caught here:
    /// logged, counted in `guard_internal_errors_total`, and treated as
    /// fail-open.
    pub fn check(&self, ctx: &RequestContext<'_>) -> Option<Denial> {
        match self.check_inner(ctx) {
            Ok(denial) => denial,
            Err(e) => {
                error!(
                    endpoint = ctx.endpoint,
                    method = ctx.method,
                    error = %e,
                    "Guard chain failed, failing open"
                );
                self.metrics.increment(
                    GUARD_INTERNAL_ERRORS_TOTAL,
                    &[("endpoint", ctx.endpoint.to_string())],
                );
                None
            }
        }
    }

    fn check_inner(&self, ctx: &RequestContext<'_>) -> Result<Option<Denial>> {
        // Injected chain fault, inside the fail-open boundary.
        guard_error_hook(&self.injector)?;

        // 1. Kill switches. Short-circuit before any counter is touched.
        if let Some(denial) = self.check_kill_switches(ctx) {
            return Ok(Some(denial));
        }

        // 2. Rate limit, with optional injected spike.
        self.apply_rate_limit_spike(ctx);
        match self.rate_limit.check_request(ctx.endpoint, ctx.method) {
            Ok(RateDecision::Allowed { .. }) => {
                self.record_rate_decision(ctx.endpoint, "allowed");
            }
            Ok(RateDecision::Denied {
                retry_after_seconds,
            }) => {
                self.record_rate_decision(ctx.endpoint, "denied");
                return Ok(Some(self.deny(
                    ctx,
                    DenyReason::RateLimited,
                    Some(retry_after_seconds),
                )));
            }
            Err(e) if self.fail_closed => {
                // Internal limiter error only; ordinary overflow is handled above.
                warn!(
                    endpoint = ctx.endpoint,
                    error = %e,
                    "Rate limiter errored, denying (fail_closed)"
                );
                self.record_rate_decision(ctx.endpoint, "denied");
                return Ok(Some(self.deny(ctx, DenyReason::RateLimited, None)));
            }
            Err(e) => return Err(e),
        }

        // 3. Circuit breaker per declared dependency, in order.
        for dependency in self.dependencies.for_endpoint(ctx.endpoint) {
            let breaker = self.breaker(*dependency);
            if !breaker.allow_request() {
                debug!(
                    endpoint = ctx.endpoint,
                    dependency = dependency.as_str(),
                    "Circuit open, denying"
                );
                return Ok(Some(self.deny(ctx, DenyReason::CircuitOpen, None)));
            }
        }

        Ok(None)
    }

    fn check_kill_switches(&self, ctx: &RequestContext<'_>) -> Option<Denial> {
        let class = self.rate_limit.classify(ctx.endpoint);

        if class == EndpointClass::Import && self.kill_switches.is_enabled(GLOBAL_IMPORT) {
            return Some(self.deny(ctx, DenyReason::KillSwitched, None));
        }
        if let Some(tenant) = ctx.tenant {
            if self.kill_switches.is_enabled(&tenant_switch(tenant)) {
                return Some(self.deny(ctx, DenyReason::KillSwitched, None));
            }
        }
        // Degrade mode sheds the expensive classes and lets default traffic pass.
        if class != EndpointClass::Default && self.kill_switches.is_enabled(DEGRADE_MODE) {
            return Some(self.deny(ctx, DenyReason::KillSwitched, None));
        }
        None
    }

    /// When `RATE_LIMIT_SPIKE` is active, pre-charge the endpoint's window
    /// with synthetic attempts (`extra_requests` param, default 10) so tests
    /// can exhaust quota without real traffic.
    fn apply_rate_limit_spike(&self, ctx: &RequestContext<'_>) {
        if !self.injector.is_enabled(FaultPoint::RateLimitSpike) {
            return;
        }
        let extra = self
            .injector
            .get_params(FaultPoint::RateLimitSpike)
            .get("extra_requests")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(10);
        debug!(endpoint = ctx.endpoint, extra, "Injecting rate-limit spike");
        for _ in 0..extra {
            // Synthetic attempts; decisions and errors are deliberately ignored.
            let _ = self.rate_limit.check_request(ctx.endpoint, ctx.method);
        }
    }

    /// Report the handler outcome into every breaker the endpoint declares.
    /// A 5xx response counts as a failure for each of them.
    pub fn record_outcome(&self, endpoint: &str, success: bool) {
        for dependency in self.dependencies.for_endpoint(endpoint) {
            let breaker = self.breaker(*dependency);
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    /// Breaker for `dependency`, created lazily on first use and kept for the
    /// process lifetime.
    pub fn breaker(&self, dependency: Dependency) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    dependency.as_str(),
                    &self.breaker_config,
                    Arc::clone(&self.clock),
                    Arc::clone(&self.metrics),
                ))
            })
            .clone()
    }

    /// Snapshots of all breakers created so far, sorted by dependency.
    #[must_use]
    pub fn breaker_statuses(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> = self
            .breakers
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        statuses.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        statuses
    }

    fn deny(&self, ctx: &RequestContext<'_>, reason: DenyReason, retry_after: Option<u64>) -> Denial {
        self.metrics.increment(
            DENIALS_TOTAL,
            &[
                ("endpoint", ctx.endpoint.to_string()),
                ("reason", reason.as_str().to_string()),
            ],
        );
        Denial { reason, retry_after }
    }

    fn record_rate_decision(&self, endpoint: &str, decision: &str) {
        self.metrics.increment(
            RATE_LIMIT_TOTAL,
            &[
                ("endpoint", endpoint.to_string()),
                ("decision", decision.to_string()),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Config, RateLimitConfig};
    use crate::guard::fault_injection::FaultParams;
    use crate::metrics::RecordingSink;

    struct Harness {
        orchestrator: GuardOrchestrator,
        kill_switches: Arc<KillSwitchManager>,
        injector: Arc<FaultInjector>,
        sink: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(rate_limit: RateLimitConfig, fail_closed: bool) -> Harness {
        let config = Config::default();
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::clone(&sink) as Arc<dyn MetricsSink>;
        let clock_dyn = Arc::clone(&clock) as Arc<dyn Clock>;

        let kill_switches = Arc::new(KillSwitchManager::new(
            [(GLOBAL_IMPORT, false), (DEGRADE_MODE, false)],
            Arc::clone(&metrics),
        ));
        let limiter = Arc::new(RateLimitGuard::new(rate_limit, Arc::clone(&clock_dyn)));
        let injector = Arc::new(FaultInjector::new(Arc::clone(&clock_dyn)));

        let orchestrator = GuardOrchestrator::new(
            Arc::clone(&kill_switches),
            limiter,
            Arc::clone(&injector),
            EndpointDependencies::new(config.dependencies),
            config.circuit_breaker,
            fail_closed,
            clock_dyn,
            metrics,
        );
        Harness {
            orchestrator,
            kill_switches,
            injector,
            sink,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(RateLimitConfig::default(), true)
    }

    const IMPORT: RequestContext<'static> = RequestContext {
        endpoint: "/admin/import/invoices",
        method: "POST",
        tenant: None,
    };

    // ── Ordering & short-circuit ─────────────────────────────────────────────

    #[test]
    fn clean_request_passes_all_guards() {
        let h = harness();
        assert_eq!(h.orchestrator.check(&IMPORT), None);
    }

    #[test]
    fn kill_switch_short_circuits_before_rate_counters() {
        let h = harness();
        h.kill_switches.set_switch(GLOBAL_IMPORT, true, "test");

        let denial = h.orchestrator.check(&IMPORT).expect("denied");
        assert_eq!(denial.reason, DenyReason::KillSwitched);
        assert_eq!(denial.status_code(), 503);
        // The rate-limit counter must not have been touched.
        assert_eq!(h.sink.increments(RATE_LIMIT_TOTAL, None), 0);
    }

    #[test]
    fn global_import_switch_only_affects_import_class() {
        let h = harness();
        h.kill_switches.set_switch(GLOBAL_IMPORT, true, "test");
        let ctx = RequestContext {
            endpoint: "/admin/kill-switches",
            method: "GET",
            tenant: None,
        };
        assert_eq!(h.orchestrator.check(&ctx), None);
    }

    #[test]
    fn tenant_switch_blocks_only_that_tenant() {
        let h = harness();
        h.kill_switches.set_switch(&tenant_switch("acme"), true, "test");

        let blocked = RequestContext {
            tenant: Some("acme"),
            ..IMPORT
        };
        let other = RequestContext {
            tenant: Some("globex"),
            ..IMPORT
        };
        assert_eq!(
            h.orchestrator.check(&blocked).map(|d| d.reason),
            Some(DenyReason::KillSwitched)
        );
        assert_eq!(h.orchestrator.check(&other), None);
    }

    #[test]
    fn degrade_mode_sheds_expensive_classes_only() {
        let h = harness();
        h.kill_switches.set_switch(DEGRADE_MODE, true, "test");

        assert_eq!(
            h.orchestrator.check(&IMPORT).map(|d| d.reason),
            Some(DenyReason::KillSwitched)
        );
        let heavy = RequestContext {
            endpoint: "/admin/invoices",
            method: "GET",
            tenant: None,
        };
        assert_eq!(
            h.orchestrator.check(&heavy).map(|d| d.reason),
            Some(DenyReason::KillSwitched)
        );
        let default_class = RequestContext {
            endpoint: "/admin/kill-switches",
            method: "GET",
            tenant: None,
        };
        assert_eq!(h.orchestrator.check(&default_class), None);
    }

    // ── Rate limiting ────────────────────────────────────────────────────────

    #[test]
    fn over_quota_denies_with_retry_after() {
        let config = RateLimitConfig {
            import_limit: 2,
            ..RateLimitConfig::default()
        };
        let h = harness_with(config, true);

        assert_eq!(h.orchestrator.check(&IMPORT), None);
        assert_eq!(h.orchestrator.check(&IMPORT), None);
        let denial = h.orchestrator.check(&IMPORT).expect("denied");
        assert_eq!(denial.reason, DenyReason::RateLimited);
        assert_eq!(denial.status_code(), 429);
        let retry_after = denial.retry_after.expect("retry_after present");
        assert!(retry_after <= 61);

        assert_eq!(h.sink.increments(RATE_LIMIT_TOTAL, Some(("decision", "allowed"))), 2);
        assert_eq!(h.sink.increments(RATE_LIMIT_TOTAL, Some(("decision", "denied"))), 1);
    }

    #[test]
    fn limiter_internal_error_denies_when_fail_closed() {
        let config = RateLimitConfig {
            import_limit: 0, // misconfiguration → internal error
            ..RateLimitConfig::default()
        };
        let h = harness_with(config, true);

        let denial = h.orchestrator.check(&IMPORT).expect("denied");
        assert_eq!(denial.reason, DenyReason::RateLimited);
        assert_eq!(denial.retry_after, None);
    }

    #[test]
    fn limiter_internal_error_fails_open_without_fail_closed() {
        let config = RateLimitConfig {
            import_limit: 0,
            ..RateLimitConfig::default()
        };
        let h = harness_with(config, false);

        assert_eq!(h.orchestrator.check(&IMPORT), None);
        assert_eq!(
            h.sink.increments(GUARD_INTERNAL_ERRORS_TOTAL, None),
            1,
            "fail-open path must count the internal error"
        );
    }

    // ── Circuit breaking ─────────────────────────────────────────────────────

    #[test]
    fn open_breaker_on_declared_dependency_denies() {
        let h = harness();
        let breaker = h.orchestrator.breaker(Dependency::DbPrimary);
        for _ in 0..10 {
            breaker.record_failure();
        }

        let denial = h.orchestrator.check(&IMPORT).expect("denied");
        assert_eq!(denial.reason, DenyReason::CircuitOpen);
        assert_eq!(denial.status_code(), 503);
    }

    #[test]
    fn unmapped_endpoint_skips_breaker_checks() {
        let h = harness();
        let breaker = h.orchestrator.breaker(Dependency::DbPrimary);
        for _ in 0..10 {
            breaker.record_failure();
        }
        let ctx = RequestContext {
            endpoint: "/admin/unmapped",
            method: "GET",
            tenant: None,
        };
        assert_eq!(h.orchestrator.check(&ctx), None);
    }

    #[test]
    fn record_outcome_feeds_all_declared_breakers() {
        let h = harness();
        for _ in 0..10 {
            h.orchestrator.record_outcome("/admin/import/invoices", false);
        }
        for dependency in [
            Dependency::DbPrimary,
            Dependency::ImportWorker,
            Dependency::ExternalApi,
        ] {
            assert!(
                !h.orchestrator.breaker(dependency).allow_request(),
                "{} breaker should be open",
                dependency.as_str()
            );
        }
        // A dependency the endpoint does not declare stays closed.
        assert!(h.orchestrator.breaker(Dependency::Cache).allow_request());
    }

    #[test]
    fn breaker_recovers_end_to_end() {
        let h = harness();
        for _ in 0..10 {
            h.orchestrator.record_outcome("/admin/import/invoices", false);
        }
        assert_eq!(
            h.orchestrator.check(&IMPORT).map(|d| d.reason),
            Some(DenyReason::CircuitOpen)
        );

        h.clock.advance(Duration::from_secs(31));
        // Half-open: probes flow again
        assert_eq!(h.orchestrator.check(&IMPORT), None);
        for _ in 0..3 {
            h.orchestrator.record_outcome("/admin/import/invoices", true);
        }
        assert_eq!(
            h.orchestrator.breaker(Dependency::DbPrimary).state(),
            crate::guard::circuit_breaker::CircuitState::Closed
        );
    }

    // ── Fail-open & injection ────────────────────────────────────────────────

    #[test]
    fn injected_guard_error_fails_open() {
        let h = harness();
        h.injector.enable(
            FaultPoint::GuardInternalError,
            FaultParams::new(),
            Duration::ZERO,
        );

        assert_eq!(h.orchestrator.check(&IMPORT), None, "must fail open");
        assert_eq!(h.sink.increments(GUARD_INTERNAL_ERRORS_TOTAL, None), 1);
    }

    #[test]
    fn rate_limit_spike_exhausts_quota() {
        let config = RateLimitConfig {
            import_limit: 5,
            ..RateLimitConfig::default()
        };
        let h = harness_with(config, true);
        let mut params = FaultParams::new();
        params.insert("extra_requests".to_string(), json!(5));
        h.injector
            .enable(FaultPoint::RateLimitSpike, params, Duration::ZERO);

        // The spike pre-charges the window, so the first real request is over quota.
        let denial = h.orchestrator.check(&IMPORT).expect("denied");
        assert_eq!(denial.reason, DenyReason::RateLimited);
    }

    // ── Denial metrics ───────────────────────────────────────────────────────

    #[test]
    fn denials_are_counted_by_reason() {
        let h = harness();
        h.kill_switches.set_switch(GLOBAL_IMPORT, true, "test");
        h.orchestrator.check(&IMPORT);
        assert_eq!(
            h.sink.increments(DENIALS_TOTAL, Some(("reason", "KILL_SWITCHED"))),
            1
        );
    }
}
