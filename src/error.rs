//! Error Taxonomy
//!
//! One enum for everything the pool engines can reject, mapped onto a small
//! set of machine-readable kinds so callers (HTTP handlers, schedulers) can
//! branch without string matching.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::store::StoreError;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Referenced pool or document does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A square (or other uniquely-owned resource) is already taken by
    /// someone else.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation is valid in general but not in the pool's current
    /// state, e.g. claiming on a locked pool.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Malformed input: out-of-range square ids, empty claimant, unknown
    /// round keys.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller is not allowed to perform this operation on this pool.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A per-player quota would be exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Storage-layer failure (sqlite, serialization, write contention).
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PoolError {
    /// Stable machine-readable kind, mirrored in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::NotFound(_) => "NOT_FOUND",
            PoolError::AlreadyExists(_) => "ALREADY_EXISTS",
            PoolError::FailedPrecondition(_) => "FAILED_PRECONDITION",
            PoolError::InvalidArgument(_) => "INVALID_ARGUMENT",
            PoolError::PermissionDenied(_) => "PERMISSION_DENIED",
            PoolError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            PoolError::Store(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PoolError::NotFound(_) => StatusCode::NOT_FOUND,
            PoolError::AlreadyExists(_) => StatusCode::CONFLICT,
            PoolError::FailedPrecondition(_) => StatusCode::CONFLICT,
            PoolError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            PoolError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            PoolError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            PoolError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
