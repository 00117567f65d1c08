pub mod log;
pub mod predict;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fairlog_core::error::FairlogError;

use crate::types::ErrorResponse;

/// A failed request: a status plus `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<FairlogError> for ApiError {
    fn from(e: FairlogError) -> Self {
        let status = match &e {
            FairlogError::Malformed(_) | FairlogError::Protocol(_) => StatusCode::BAD_REQUEST,
            FairlogError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %e, "request failed");
            return Self::new(status, "internal server error");
        }
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let e: ApiError = FairlogError::Protocol("bad commit".into()).into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert!(e.message.contains("bad commit"));

        let e: ApiError = FairlogError::Timeout("slow".into()).into();
        assert_eq!(e.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn internal_errors_stay_internal() {
        let e: ApiError = FairlogError::Storage("disk /var/lib/x full".into()).into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!e.message.contains("/var/lib"));
        assert_eq!(e.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
