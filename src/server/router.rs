//! HTTP router and application state

use std::sync::Arc;

use axum::{
    Json, Router, middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::admin;
use super::middleware::guard_middleware;
use crate::clock::Clock;
use crate::config::Config;
use crate::guard::{
    EndpointDependencies, FaultInjector, GuardOrchestrator, KillSwitchManager, RateLimitGuard,
    db_timeout_hook, external_5xx_hook,
};
use crate::metrics::MetricsSink;

/// Shared application state, built once at startup and injected everywhere.
///
/// No component here is a global singleton; tests construct their own state
/// with a manual clock and a recording metrics sink.
#[derive(Debug)]
pub struct AppState {
    /// Effective configuration
    pub config: Config,
    /// The composed guard chain
    pub guards: Arc<GuardOrchestrator>,
    /// Kill switches (also reachable through the orchestrator; exposed for
    /// the admin API)
    pub kill_switches: Arc<KillSwitchManager>,
    /// Rate limiter (exposed for administrative reset)
    pub rate_limit: Arc<RateLimitGuard>,
    /// Fault-injection registry
    pub injector: Arc<FaultInjector>,
    /// Metrics sink
    pub metrics: Arc<dyn MetricsSink>,
}

impl AppState {
    /// Wire up all guard components from configuration.
    #[must_use]
    pub fn build(config: Config, clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        let kill_switches = Arc::new(KillSwitchManager::new(
            config
                .kill_switches
                .initial
                .iter()
                .map(|(name, enabled)| (name.as_str(), *enabled)),
            Arc::clone(&metrics),
        ));
        let rate_limit = Arc::new(RateLimitGuard::new(
            config.rate_limit.clone(),
            Arc::clone(&clock),
        ));
        let injector = Arc::new(FaultInjector::new(Arc::clone(&clock)));

        let guards = Arc::new(GuardOrchestrator::new(
            Arc::clone(&kill_switches),
            Arc::clone(&rate_limit),
            Arc::clone(&injector),
            EndpointDependencies::new(config.dependencies.clone()),
            config.circuit_breaker.clone(),
            config.rate_limit.fail_closed,
            clock,
            Arc::clone(&metrics),
        ));

        Arc::new(Self {
            config,
            guards,
            kill_switches,
            rate_limit,
            injector,
            metrics,
        })
    }

    /// Whether `path` bypasses the guard chain.
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.config
            .server
            .public_paths
            .iter()
            .any(|p| p == path)
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Guarded invoice routes; the domain handlers live elsewhere, these
        // stand in for them and exercise the fault-injection hooks.
        .route("/admin/import/invoices", post(import_invoices_handler))
        .route("/admin/invoices", get(list_invoices_handler))
        // Administrative guard control
        .route("/admin/kill-switches", get(admin::list_kill_switches))
        .route("/admin/kill-switches/{name}", put(admin::set_kill_switch))
        .route(
            "/admin/guards/circuit-breakers",
            get(admin::list_circuit_breakers),
        )
        .route("/admin/guards/rate-limits/reset", post(admin::reset_rate_limits))
        .route(
            "/admin/faults/{point}",
            put(admin::enable_fault).delete(admin::disable_fault),
        )
        .route("/admin/faults", delete(admin::disable_all_faults))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            guard_middleware,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - liveness probe, bypasses the guard chain
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// POST /admin/import/invoices - guarded import stub.
///
/// Runs the DB-timeout and external-5xx hooks so drills produce real 5xx
/// responses, which the middleware feeds back into the breakers.
async fn import_invoices_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> axum::response::Response {
    if let Err(e) = db_timeout_hook(&state.injector) {
        return (
            axum::http::StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response();
    }
    if let Err(e) = external_5xx_hook(&state.injector) {
        return (
            axum::http::StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response();
    }
    (
        axum::http::StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted" })),
    )
        .into_response()
}

/// GET /admin/invoices - guarded heavy-read stub
async fn list_invoices_handler() -> impl IntoResponse {
    Json(json!({ "invoices": [] }))
}
