//! HTTP surface: scheduled trigger, health, read and admin endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::grading::RegradeAuthorization;
use crate::model::Period;
use crate::orchestrator::{RunResult, RunState};
use crate::store::SnapshotFilter;

pub const TRIGGER_SECRET_HEADER: &str = "x-trigger-secret";
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ingest/run", post(trigger_run))
        .route("/matches/:id/snapshots", get(match_snapshots))
        .route("/matches/:id/reclassify", post(reclassify_match))
        .route("/picks/:id/grade", post(grade_pick))
        .route("/picks/:id/regrade", post(regrade_pick))
        .route("/admin/reviews", get(pending_reviews))
        .route("/admin/teams/:id/verify", post(verify_team))
        .route("/admin/matches/:id/verify", post(verify_match))
        .with_state(AppState { engine })
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Auth(_) => StatusCode::UNAUTHORIZED,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidTransition { .. } | EngineError::RunInProgress => StatusCode::CONFLICT,
            EngineError::GradingDataMissing { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::UpstreamMalformed { .. } | EngineError::Http(_) => StatusCode::BAD_GATEWAY,
            EngineError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Compares a presented secret with the configured one in constant time.
/// Both sides are MACed first so neither length nor prefix leaks.
fn secret_matches(provided: &str, expected: &str) -> bool {
    const CONTEXT: &[u8] = b"market-ingestion secret check";
    if expected.is_empty() {
        return false;
    }
    let tag = |secret: &str| {
        HmacSha256::new_from_slice(secret.as_bytes()).map(|mut mac| {
            mac.update(CONTEXT);
            mac
        })
    };
    match (tag(provided), tag(expected)) {
        (Ok(provided), Ok(expected)) => provided.verify_slice(&expected.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}

fn ensure_trigger_authorized(engine: &Engine, headers: &HeaderMap) -> Result<(), EngineError> {
    let expected = engine.config().trigger_secret.as_str();
    match header(headers, TRIGGER_SECRET_HEADER) {
        Some(provided) if secret_matches(provided, expected) => Ok(()),
        _ => Err(EngineError::Auth("missing or invalid trigger secret".to_string())),
    }
}

fn ensure_admin_authorized(engine: &Engine, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = engine.config().admin_secret.as_deref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "admin endpoints are disabled (ADMIN_SECRET not configured)" })),
        )
            .into_response());
    };
    match header(headers, ADMIN_SECRET_HEADER) {
        Some(provided) if secret_matches(provided, expected) => Ok(()),
        _ => Err(EngineError::Auth("missing or invalid admin secret".to_string()).into_response()),
    }
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let health = state.engine.health();
    let last_run = *health.last_run_time.read().await;
    let last_state = *health.last_run_state.read().await;
    let last_snapshots = *health.last_run_snapshots.read().await;
    let failures = *health.consecutive_failures.read().await;

    let status = if failures > 2 { "degraded" } else { "ok" };
    let http_status = if failures > 5 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        http_status,
        Json(json!({
            "service": "market-ingestion",
            "version": env!("CARGO_PKG_VERSION"),
            "status": status,
            "last_run": last_run.map(|t| t.to_rfc3339()),
            "last_run_state": last_state.map(|s| s.as_str()),
            "last_run_snapshots": last_snapshots,
            "consecutive_failures": failures
        })),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub leagues: Vec<String>,
}

/// HTTP status for a finished run: 504 when the budget elapsed, 502 when
/// every league failed, 200 otherwise.
pub fn run_status(result: &RunResult) -> StatusCode {
    if result.timed_out {
        StatusCode::GATEWAY_TIMEOUT
    } else if result.state == RunState::Failed {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    }
}

async fn trigger_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<TriggerRequest>>,
) -> Result<(StatusCode, Json<RunResult>), EngineError> {
    // Auth before any work.
    ensure_trigger_authorized(&state.engine, &headers)?;

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let result = state.engine.run_ingestion(Some(&request.leagues)).await?;
    Ok((run_status(&result), Json(result)))
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    pub live: Option<bool>,
    pub provider: Option<String>,
    pub period: Option<String>,
}

async fn match_snapshots(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Response, EngineError> {
    let period = match query.period.as_deref() {
        None => None,
        Some(raw) => match Period::parse(raw) {
            Some(p) => Some(p),
            None => {
                return Ok((
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("unknown period {}", raw) })),
                )
                    .into_response())
            }
        },
    };
    let filter = SnapshotFilter {
        is_live: query.live,
        provider: query.provider,
        period,
        ..Default::default()
    };
    let snapshots = state.engine.snapshots().history(id, &filter).await?;
    Ok(Json(snapshots).into_response())
}

async fn reclassify_match(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, EngineError> {
    let report = state.engine.snapshots().reclassify(id).await?;
    Ok(Json(report))
}

async fn grade_pick(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, EngineError> {
    let pick = state.engine.grading().grade(id).await?;
    Ok(Json(pick))
}

async fn regrade_pick(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(authorization): Json<RegradeAuthorization>,
) -> Response {
    if let Err(denied) = ensure_admin_authorized(&state.engine, &headers) {
        return denied;
    }
    match state.engine.grading().regrade(id, &authorization).await {
        Ok(pick) => Json(pick).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn pending_reviews(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = ensure_admin_authorized(&state.engine, &headers) {
        return denied;
    }
    match state.engine.resolver().pending_reviews().await {
        Ok(records) => Json(records).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn verify_team(State(state): State<AppState>, Path(id): Path<Uuid>, headers: HeaderMap) -> Response {
    if let Err(denied) = ensure_admin_authorized(&state.engine, &headers) {
        return denied;
    }
    match state.engine.resolver().verify_team(id).await {
        Ok(true) => Json(json!({ "team_id": id, "verified": true })).into_response(),
        Ok(false) => EngineError::NotFound(format!("team {}", id)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn verify_match(State(state): State<AppState>, Path(id): Path<Uuid>, headers: HeaderMap) -> Response {
    if let Err(denied) = ensure_admin_authorized(&state.engine, &headers) {
        return denied;
    }
    match state.engine.resolver().verify_match(id).await {
        Ok(true) => Json(json!({ "match_id": id, "verified": true })).into_response(),
        Ok(false) => EngineError::NotFound(format!("match {}", id)).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_matches_only_the_exact_secret() {
        assert!(secret_matches("s3cret-value", "s3cret-value"));
        assert!(!secret_matches("s3cret-valu", "s3cret-value"));
        assert!(!secret_matches("s3cret-value-and-more", "s3cret-value"));
        assert!(!secret_matches("", "s3cret-value"));
        assert!(!secret_matches("", ""));
    }
}
