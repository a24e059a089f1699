use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::CallCenterError;

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// Engine error carried out of a handler
#[derive(Debug)]
pub struct ApiError(pub CallCenterError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<CallCenterError> for ApiError {
    fn from(err: CallCenterError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            CallCenterError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            CallCenterError::NotFound(_) => StatusCode::NOT_FOUND,
            CallCenterError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CallCenterError::Conflict(_) | CallCenterError::AlreadyExists(_) => StatusCode::CONFLICT,
            CallCenterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            CallCenterError::Database(_) => "database",
            CallCenterError::Agent(_) => "agent",
            CallCenterError::Queue(_) => "queue",
            CallCenterError::QueueFull(_) => "queue_full",
            CallCenterError::Routing(_) => "routing",
            CallCenterError::Orchestration(_) => "orchestration",
            CallCenterError::Reconciliation(_) => "reconciliation",
            CallCenterError::Inconsistency(_) => "inconsistency",
            CallCenterError::Conflict(_) => "conflict",
            CallCenterError::Configuration(_) => "configuration",
            CallCenterError::InvalidInput(_) => "invalid_input",
            CallCenterError::NotFound(_) => "not_found",
            CallCenterError::AlreadyExists(_) => "already_exists",
            CallCenterError::Timeout(_) => "timeout",
            CallCenterError::Serialization(_) => "serialization",
            CallCenterError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("❌ Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (CallCenterError::queue_full("cap"), StatusCode::SERVICE_UNAVAILABLE),
            (CallCenterError::not_found("call"), StatusCode::NOT_FOUND),
            (CallCenterError::invalid_input("x"), StatusCode::BAD_REQUEST),
            (CallCenterError::conflict("lost"), StatusCode::CONFLICT),
            (CallCenterError::AlreadyExists("call".into()), StatusCode::CONFLICT),
            (CallCenterError::database("locked"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_code(), expected);
        }
    }
}
