use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AppError {
    #[error("Missing required parameter(s): {}", .0.join(", "))]
    MissingParameters(Vec<String>),

    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unknown database: {0}")]
    UnknownDatabase(String),

    #[error("Unsupported driver: {0}")]
    UnsupportedDriver(String),

    #[error("Could not load driver `{driver}`: {reason}")]
    DriverLoad { driver: String, reason: String },

    #[error("No driver available for url `{url}`: {reason}")]
    DriverUnavailable { url: String, reason: String },

    #[error("Statement execution failed: {0}")]
    StatementExecution(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Resource release failed: {0}")]
    ResourceRelease(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingParameters(_)
            | AppError::InvalidCallback(_)
            | AppError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            AppError::UnknownDatabase(_) => StatusCode::NOT_FOUND,
            AppError::UnsupportedDriver(_)
            | AppError::DriverLoad { .. }
            | AppError::DriverUnavailable { .. }
            | AppError::StatementExecution(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::ResourceRelease(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingParameters(_) => "MISSING_PARAMETERS",
            AppError::InvalidCallback(_) => "INVALID_CALLBACK",
            AppError::InvalidQuery(_) => "INVALID_QUERY",
            AppError::UnknownDatabase(_) => "UNKNOWN_DATABASE",
            AppError::UnsupportedDriver(_) => "UNSUPPORTED_DRIVER",
            AppError::DriverLoad { .. } => "DRIVER_LOAD_ERROR",
            AppError::DriverUnavailable { .. } => "DRIVER_UNAVAILABLE",
            AppError::StatementExecution(_) => "STATEMENT_EXECUTION_ERROR",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::ResourceRelease(_) => "RESOURCE_RELEASE_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error response format, used when no usable JSONP callback is available
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut detail = ErrorDetail::new(self.code(), self.to_string());
        if let AppError::MissingParameters(names) = &self {
            detail = detail.with_details(names.join(","));
        }

        (status, Json(ErrorResponse { error: detail })).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::StatementExecution(err.to_string())
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(err: tokio_postgres::Error) -> Self {
        let details = if let Some(db_error) = err.as_db_error() {
            format!(
                "Code: {}, Message: {}",
                db_error.code().code(),
                db_error.message()
            )
        } else {
            err.to_string()
        };
        AppError::StatementExecution(details)
    }
}

impl From<mysql_async::Error> for AppError {
    fn from(err: mysql_async::Error) -> Self {
        AppError::StatementExecution(err.to_string())
    }
}
