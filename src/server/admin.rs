//! Administrative guard-control handlers
//!
//! Kill-switch toggles, breaker inspection, rate-limit reset, and fault
//! drills. The toggle endpoint returns the previous state so operators can
//! see idempotent toggles in their tooling.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::router::AppState;
use crate::guard::{FaultParams, FaultPoint};

/// Fallback actor when the caller sends no `x-actor` header.
const DEFAULT_ACTOR: &str = "admin-api";

fn actor_from(headers: &HeaderMap) -> String {
    headers
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

/// GET /admin/kill-switches
pub async fn list_kill_switches(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "switches": state.kill_switches.snapshot() }))
}

/// Request body for a kill-switch toggle.
#[derive(Debug, Deserialize)]
pub struct SetSwitchRequest {
    /// Desired state
    pub enabled: bool,
}

/// PUT /admin/kill-switches/{name}
pub async fn set_kill_switch(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SetSwitchRequest>,
) -> impl IntoResponse {
    let actor = actor_from(&headers);
    let previous = state.kill_switches.set_switch(&name, body.enabled, &actor);
    Json(json!({
        "switch": {
            "name": name,
            "enabled": body.enabled,
            "previous_enabled": previous,
        }
    }))
}

/// GET /admin/guards/circuit-breakers
pub async fn list_circuit_breakers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "circuit_breakers": state.guards.breaker_statuses() }))
}

/// POST /admin/guards/rate-limits/reset
pub async fn reset_rate_limits(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.rate_limit.reset();
    info!("Rate-limit windows reset via admin API");
    StatusCode::NO_CONTENT
}

/// Request body for enabling a fault point.
#[derive(Debug, Deserialize, Default)]
pub struct EnableFaultRequest {
    /// Parameters stored on the point
    #[serde(default)]
    pub params: FaultParams,
    /// Auto-expiry in seconds; zero or absent means no expiry
    #[serde(default)]
    pub ttl_seconds: f64,
}

/// PUT /admin/faults/{point}
///
/// Enables a fault point for a drill. `killswitch_toggle` additionally applies
/// the toggle named in its params (`{"switch": ..., "enabled": ...}`) so the
/// drill exercises the real kill-switch path.
pub async fn enable_fault(
    State(state): State<Arc<AppState>>,
    Path(point): Path<String>,
    body: Option<Json<EnableFaultRequest>>,
) -> Response {
    let Ok(point) = point.parse::<FaultPoint>() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown fault point: {point}") })),
        )
            .into_response();
    };
    let Json(body) = body.unwrap_or_default();

    state.injector.enable(
        point,
        body.params.clone(),
        Duration::from_secs_f64(body.ttl_seconds.max(0.0)),
    );

    if point == FaultPoint::KillswitchToggle {
        let switch = body
            .params
            .get("switch")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(crate::guard::DEGRADE_MODE);
        let enabled = body
            .params
            .get("enabled")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        state
            .kill_switches
            .set_switch(switch, enabled, "fault-injector");
    }

    (
        StatusCode::OK,
        Json(json!({ "fault": { "point": point.as_str(), "enabled": true } })),
    )
        .into_response()
}

/// DELETE /admin/faults/{point}
pub async fn disable_fault(
    State(state): State<Arc<AppState>>,
    Path(point): Path<String>,
) -> Response {
    let Ok(point) = point.parse::<FaultPoint>() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown fault point: {point}") })),
        )
            .into_response();
    };
    state.injector.disable(point);
    StatusCode::NO_CONTENT.into_response()
}

/// DELETE /admin/faults
pub async fn disable_all_faults(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.injector.disable_all();
    info!("All fault-injection points disabled via admin API");
    StatusCode::NO_CONTENT
}
