//! Guard middleware — the HTTP face of the orchestrator.
//!
//! Every request is checked against the guard chain before the handler runs.
//! Denials become structured JSON bodies (`{reason, retry_after?}`) with 429
//! or 503. After the handler, the outcome (5xx = failure) is reported into the
//! breakers and the API request counter is emitted with exactly the
//! `{endpoint, method, status_class}` label set.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::router::AppState;
use crate::guard::{Denial, DenyReason, RequestContext};
use crate::metrics::{API_REQUESTS_TOTAL, REQUEST_DURATION_SECONDS, ScopedTimer};

/// Guard chain evaluation, applied to every route.
pub async fn guard_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let endpoint = request.uri().path().to_string();
    let method = request.method().as_str().to_string();

    if state.is_public_path(&endpoint) {
        return next.run(request).await;
    }

    let tenant = request
        .headers()
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    // Records the duration histogram on every exit path.
    let _timer = ScopedTimer::start(
        Arc::clone(&state.metrics),
        REQUEST_DURATION_SECONDS,
        vec![
            ("endpoint", endpoint.clone()),
            ("method", method.clone()),
        ],
    );

    let ctx = RequestContext {
        endpoint: &endpoint,
        method: &method,
        tenant: tenant.as_deref(),
    };

    if let Some(denial) = state.guards.check(&ctx) {
        debug!(
            endpoint,
            method,
            reason = denial.reason.as_str(),
            "Request denied by guard chain"
        );
        let status = denial_status(&denial);
        record_api_request(&state, &endpoint, &method, status);
        return (status, Json(denial)).into_response();
    }

    let response = next.run(request).await;
    let status = response.status();

    // Handler outcome feeds the breakers of every declared dependency.
    state
        .guards
        .record_outcome(&endpoint, !status.is_server_error());
    record_api_request(&state, &endpoint, &method, status);

    response
}

fn denial_status(denial: &Denial) -> StatusCode {
    match denial.reason {
        DenyReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        DenyReason::KillSwitched | DenyReason::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn record_api_request(state: &AppState, endpoint: &str, method: &str, status: StatusCode) {
    // Closed label set: {endpoint, method, status_class}, nothing else.
    state.metrics.increment(
        API_REQUESTS_TOTAL,
        &[
            ("endpoint", endpoint.to_string()),
            ("method", method.to_string()),
            ("status_class", status_class(status).to_string()),
        ],
    );
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() / 100 {
        1 => "1xx",
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        _ => "5xx",
    }
}
