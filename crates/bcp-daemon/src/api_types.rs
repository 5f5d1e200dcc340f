//! Wire types for the HTTP surface, plus the one place core and authz
//! errors become HTTP statuses.
//!
//! Everything derives both serde directions so the scenario suite can
//! decode what the handlers encode. No logic beyond the status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bcp_authz::AuthzError;
use bcp_core::CoreError;
use bcp_schemas::QueueEntryView;

// ---------------------------------------------------------------------------
// /api/v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Queue endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueListResponse {
    pub queue: Vec<QueueEntryView>,
}

/// Body for cancel and complete: both are idempotent, both always answer
/// 200 with a message describing what actually happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Concurrency endpoints
// ---------------------------------------------------------------------------

/// PUT body: absent or `null` means unlimited; `0` pauses new admissions
/// without touching in-flight work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConcurrencyRequest {
    #[serde(default)]
    pub max_concurrent_backups: Option<i32>,
}

// ---------------------------------------------------------------------------
// Manual run trigger
// ---------------------------------------------------------------------------

/// POST /api/v1/schedules/:id/run body. `entry_id` lets callers retry
/// idempotently (a duplicate is a 409, not a second queue entry);
/// `priority` overrides the schedule's priority for this entry only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunScheduleRequest {
    #[serde(default)]
    pub entry_id: Option<Uuid>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunScheduleResponse {
    pub entry_id: Uuid,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Wire shape of every failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Everything a handler can fail with. `IntoResponse` is the single
/// error→status mapping of the daemon.
#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    Authz(AuthzError),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

impl From<AuthzError> for ApiError {
    fn from(e: AuthzError) -> Self {
        ApiError::Authz(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Authz(AuthzError::Unauthorized) => {
                (StatusCode::UNAUTHORIZED, "authentication required".to_string())
            }
            ApiError::Authz(AuthzError::Forbidden) => {
                (StatusCode::FORBIDDEN, "permission denied".to_string())
            }
            // A foreign org answers exactly like a missing entity.
            ApiError::Authz(AuthzError::OutOfScope) => {
                (StatusCode::NOT_FOUND, "not found".to_string())
            }
            ApiError::Core(CoreError::Invalid(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Core(CoreError::NotFound(msg)) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Core(CoreError::Conflict(msg)) => (StatusCode::CONFLICT, msg.clone()),
            // Caller abandonment is a sentinel, not an error worth logging.
            ApiError::Core(CoreError::Canceled) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "request canceled".to_string())
            }
            // LimitViolated never escapes the scheduler; if it surfaces
            // here something routed it wrong; treat as internal.
            ApiError::Core(e @ CoreError::LimitViolated(_))
            | ApiError::Core(e @ CoreError::Timeout(_))
            | ApiError::Core(e @ CoreError::Store(_)) => {
                tracing::error!(error = %e, "internal error reached the HTTP surface");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
