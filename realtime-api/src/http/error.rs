//! HTTP error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;

pub type AppResult<T> = Result<T, AppError>;

/// Error returned from a handler, rendered as `{"error": .., "status": ..}`
#[derive(Debug, Error)]
#[error("{status}: {message}")]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: &self.message,
            status: self.status.as_u16(),
        });
        (self.status, body).into_response()
    }
}

/// Handshake rejections: policy failures are 403, session failures 401
impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let status = match &err {
            AuthError::InvalidNamespace | AuthError::InvalidOrigin => StatusCode::FORBIDDEN,
            AuthError::MissingCredentials | AuthError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AuthError::Backend(detail) => {
                tracing::error!(error = %detail, "Authentication backend failed");
                return Self::new(StatusCode::BAD_GATEWAY, "Authentication backend unavailable");
            }
        };
        Self::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_status_mapping() {
        let cases = [
            (AuthError::InvalidNamespace, StatusCode::FORBIDDEN),
            (AuthError::InvalidOrigin, StatusCode::FORBIDDEN),
            (AuthError::MissingCredentials, StatusCode::UNAUTHORIZED),
            (AuthError::Unauthorized("403".to_string()), StatusCode::UNAUTHORIZED),
            (AuthError::Backend("connection refused".to_string()), StatusCode::BAD_GATEWAY),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn test_backend_details_are_not_leaked() {
        let err = AppError::from(AuthError::Backend("10.0.0.3:8000 refused".to_string()));
        assert!(!err.message.contains("10.0.0.3"));
    }

    #[tokio::test]
    async fn test_response_body_shape() {
        let response = AppError::from(AuthError::MissingCredentials).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error": "No authentication method used", "status": 401})
        );
    }
}
