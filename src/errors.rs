use crate::{
    models::file_record::FileStatus,
    services::{kv_store::KvError, object_keys::KeyError, object_storage::BackendError},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Which ceiling a quota rejection hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    Storage,
    FileSize,
    MonthlyDownload,
}

/// Numbers a caller needs to render an upgrade prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDetails {
    pub kind: QuotaKind,
    pub current_usage: i64,
    pub limit: i64,
    pub requested: i64,
    pub remaining: i64,
}

impl QuotaDetails {
    pub fn new(kind: QuotaKind, current_usage: i64, limit: i64, requested: i64) -> Self {
        Self {
            kind,
            current_usage,
            limit,
            requested,
            remaining: (limit - current_usage).max(0),
        }
    }
}

/// Errors surfaced by engine operations.
///
/// Quota and state conflicts are expected outcomes carrying enough structure
/// for a specific message. Backend errors are split by whether a retry can help.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("quota exceeded: {} of {} bytes used, {} requested", .0.current_usage, .0.limit, .0.requested)]
    QuotaExceeded(QuotaDetails),

    #[error("too many uploads in flight: {current} + {requested} exceeds {limit}")]
    ConcurrencyLimitExceeded {
        current: i64,
        requested: i64,
        limit: i64,
    },

    #[error("backend temporarily unavailable: {0}")]
    BackendTransient(String),

    #[error("backend rejected the request: {0}")]
    BackendPermanent(String),

    #[error("cannot {action} file {file_id} while it is {status}")]
    StateConflict {
        file_id: Uuid,
        action: &'static str,
        status: FileStatus,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Kv(#[from] KvError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Whether repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConcurrencyLimitExceeded { .. } | EngineError::BackendTransient(_)
        )
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::QuotaExceeded(_) => "quota_exceeded",
            EngineError::ConcurrencyLimitExceeded { .. } => "concurrency_limit_exceeded",
            EngineError::BackendTransient(_) => "backend_transient",
            EngineError::BackendPermanent(_) => "backend_permanent",
            EngineError::StateConflict { .. } => "state_conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Database(_) => "database",
            EngineError::Kv(_) => "kv_store",
        }
    }

    pub fn state_conflict(file_id: Uuid, action: &'static str, status: FileStatus) -> Self {
        EngineError::StateConflict {
            file_id,
            action,
            status,
        }
    }
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        if err.is_transient() {
            EngineError::BackendTransient(err.to_string())
        } else {
            EngineError::BackendPermanent(err.to_string())
        }
    }
}

impl From<KeyError> for EngineError {
    fn from(err: KeyError) -> Self {
        EngineError::InvalidInput(err.to_string())
    }
}

/// A lightweight wrapper for errors rendered at the HTTP edge.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub error_type: &'static str,
    pub details: Option<Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            error_type: "error",
            details: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16(),
            "error_type": self.error_type,
        });
        if let (Some(details), Some(map)) = (self.details, body.as_object_mut()) {
            map.insert("details".into(), details);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

/// Data-plane errors from the local object routes, where a missing object
/// is the client's problem rather than a gateway failure.
impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        let (status, error_type) = match &err {
            BackendError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            BackendError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "forbidden"),
            BackendError::Permanent(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            BackendError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "backend_transient"),
            BackendError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "object request failed");
        }
        Self {
            status,
            message: err.to_string(),
            error_type,
            details: None,
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::QuotaExceeded(_) => StatusCode::PAYMENT_REQUIRED,
            EngineError::ConcurrencyLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::BackendTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::BackendPermanent(_) => StatusCode::BAD_GATEWAY,
            EngineError::StateConflict { .. } => StatusCode::CONFLICT,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::Database(_) | EngineError::Kv(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let details = match &err {
            EngineError::QuotaExceeded(details) => serde_json::to_value(details).ok(),
            EngineError::ConcurrencyLimitExceeded {
                current,
                requested,
                limit,
            } => Some(json!({ "current": current, "requested": requested, "limit": limit })),
            EngineError::StateConflict {
                file_id, status, ..
            } => Some(json!({ "file_id": file_id, "status": status })),
            _ => None,
        };

        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }

        Self {
            status,
            message: err.to_string(),
            error_type: err.error_type(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_never_negative() {
        let over = QuotaDetails::new(QuotaKind::Storage, 20, 15, 1);
        assert_eq!(over.remaining, 0);
        let under = QuotaDetails::new(QuotaKind::Storage, 10, 15, 1);
        assert_eq!(under.remaining, 5);
    }

    #[test]
    fn backend_errors_split_by_transience() {
        let transient: EngineError = BackendError::Transient("timeout".into()).into();
        assert!(transient.is_retryable());
        let permanent: EngineError = BackendError::NotFound("k".into()).into();
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.error_type(), "backend_permanent");
    }

    #[test]
    fn quota_maps_to_payment_required() {
        let err = EngineError::QuotaExceeded(QuotaDetails::new(QuotaKind::Storage, 1, 2, 3));
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(app.details.unwrap()["remaining"], 1);
    }
}
