//! Single HTTP-facing error type for the control plane (§7).
//!
//! Every component-local error converts into `ConductorError` via `From`.
//! The HTTP layer maps each variant to a status code; queue workers match on
//! `is_retryable()` to decide whether to propagate (retry) or park the job.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("authentication required")]
    AuthenticationRequired,

    /// Collapsed into `NotFound` at the HTTP boundary (§7 — "do not distinguish
    /// existence from permission" for project resources).
    #[error("permission denied")]
    PermissionDenied,

    #[error("transient external failure: {0}")]
    TransientExternal(String),

    #[error("permanent external failure: {0}")]
    PermanentExternal(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ConductorError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    pub fn validation(what: impl Into<String>) -> Self {
        Self::Validation(what.into())
    }

    /// Queue workers use this to decide retry (throw) vs. permanent-fail (update
    /// state and return) per §7's propagation rule.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExternal(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::PermissionDenied => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            Self::TransientExternal(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::PermanentExternal(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    details: Option<String>,
}

impl IntoResponse for ConductorError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(error = %self, status = %status, "request failed");
        let body = ErrorBody {
            error: self.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

pub type ConductorResult<T> = Result<T, ConductorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_collapses_to_not_found_status() {
        assert_eq!(ConductorError::PermissionDenied.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ConductorError::not_found("run").status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn only_transient_external_is_retryable() {
        assert!(ConductorError::TransientExternal("timeout".into()).is_retryable());
        assert!(!ConductorError::PermanentExternal("bad request".into()).is_retryable());
        assert!(!ConductorError::conflict("already terminal").is_retryable());
    }
}
