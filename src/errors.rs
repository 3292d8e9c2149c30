use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub type AppResult<T> = Result<T, AppError>;

/// Failures raised by the role-scoping session core.
///
/// Everything else in the core is reported as a boolean or an outcome value;
/// this is the one error allowed to propagate out of a normal-path call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskingError {
    #[error("failed to switch to role {role}: {reason}")]
    RoleSwitchFailed { role: String, reason: String },
}

impl MaskingError {
    pub fn role_switch_failed(role: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RoleSwitchFailed {
            role: role.into(),
            reason: reason.into(),
        }
    }

    pub fn role(&self) -> &str {
        match self {
            MaskingError::RoleSwitchFailed { role, .. } => role,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("token error: {0}")]
    Token(String),
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("masked session unavailable")]
    Masking(#[from] MaskingError),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn token(err: impl Into<String>) -> Self {
        Self::Token(err.into())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Token(_) => StatusCode::UNAUTHORIZED,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Masking(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Display for Database and Masking stays generic so raw database
        // errors and role names never reach the client.
        let message = self.to_string();
        let error = match &self {
            AppError::Configuration(_) => "configuration",
            AppError::Token(_) => "token",
            AppError::Database(_) => "database",
            AppError::Masking(_) => "masking",
            AppError::Internal(_) => "internal",
        };

        let payload = ErrorResponse {
            error: error.to_string(),
            message,
        };

        (status, Json(payload)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}
