//! Control-surface route handlers.
//!
//! Every failure is answered with the same JSON body:
//!
//! ```json
//! { "error": "interlock_violation", "reason": "emergency_stop_active",
//!   "blocking": ["emergency_stop_active"], "hint": "..." }
//! ```
//!
//! `error` is the machine-readable [`MowError::reason`]; `reason` is the
//! first blocking name when there is one, otherwise the same code.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use mowguard_kernel::{BladeCommand, DriveCommand};
use mowguard_types::{MowError, SafetySnapshot, StopSource, TelemetryEnvelope};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::state::CockpitState;

pub type AppState = State<Arc<CockpitState>>;

const DEFAULT_AUDIT_LIMIT: usize = 50;
const MAX_AUDIT_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// A [`MowError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub MowError);

impl From<MowError> for ApiError {
    fn from(e: MowError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(MowError::Serialization(rejection.body_text()))
    }
}

fn status_for(err: &MowError) -> StatusCode {
    match err {
        MowError::InterlockViolation { .. } | MowError::InterlockStillActive { .. } => StatusCode::CONFLICT,
        MowError::ConfirmationRequired
        | MowError::Serialization(_)
        | MowError::InvalidTopic { .. }
        | MowError::InvalidReading { .. } => StatusCode::BAD_REQUEST,
        MowError::Channel(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let blocking = err.blocking().to_vec();
        let reason = blocking.first().cloned().unwrap_or_else(|| err.reason().to_string());
        let body = json!({
            "error": err.reason(),
            "reason": reason,
            "blocking": blocking,
            "hint": err.remediation(),
            "message": err.to_string(),
        });
        (status_for(&err), Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

pub async fn request_drive(
    State(state): AppState,
    payload: Result<Json<DriveCommand>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(cmd) = payload?;
    let snapshot = state.safety.snapshot();
    if let Err(e) = state.gate.request_drive(&snapshot, &cmd) {
        warn!(state = %snapshot.state, blocking = ?e.blocking(), "drive command rejected");
        return Err(e.into());
    }
    state.actuators.forward_drive(&cmd);
    Ok(Json(json!({ "status": "accepted" })))
}

pub async fn request_blade(
    State(state): AppState,
    payload: Result<Json<BladeCommand>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(cmd) = payload?;
    let snapshot = state.safety.snapshot();
    if let Err(e) = state.gate.request_blade(&snapshot, &cmd, state.drive_active()) {
        warn!(state = %snapshot.state, blocking = ?e.blocking(), "blade command rejected");
        return Err(e.into());
    }
    state.actuators.forward_blade(&cmd);
    Ok(Json(json!({ "status": "accepted", "blade": cmd.enable })))
}

// ---------------------------------------------------------------------------
// Emergency
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClearRequest {
    #[serde(default)]
    pub confirmation: bool,
}

/// Always accepted, even with a missing or malformed body.
pub async fn emergency_stop(
    State(state): AppState,
    payload: Result<Json<StopRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let reason = request.reason.unwrap_or_else(|| StopSource::RemoteCommand.as_reason().to_string());
    let change = state.safety.request_stop(StopSource::RemoteCommand, reason).await?;
    info!(changed = change.changed(), "remote emergency stop");
    Ok(Json(json!({
        "status": change.to,
        "changed": change.changed(),
        "stop": change.stop,
    })))
}

pub async fn emergency_clear(
    State(state): AppState,
    payload: Result<Json<ClearRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let outcome = state.safety.request_clear(request.confirmation).await?;
    Ok(Json(json!({ "status": outcome.as_str() })))
}

// ---------------------------------------------------------------------------
// Read-only
// ---------------------------------------------------------------------------

pub async fn safety_status(State(state): AppState) -> Json<SafetySnapshot> {
    Json(state.safety.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

pub async fn safety_audit(
    State(state): AppState,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).min(MAX_AUDIT_LIMIT);
    let transitions = {
        let journal = state
            .journal
            .lock()
            .map_err(|_| MowError::Storage("audit journal lock poisoned".to_string()))?;
        journal.recent(limit).map_err(MowError::from)?
    };
    Ok(Json(json!({ "transitions": transitions })))
}

pub async fn schema() -> Json<Value> {
    Json(json!({
        "safety_snapshot": schemars::schema_for!(SafetySnapshot),
        "telemetry_envelope": schemars::schema_for!(TelemetryEnvelope),
    }))
}

pub async fn health(State(state): AppState) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "mowguard",
        "safety_state": state.safety.snapshot().state,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
