use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::{InvoiceStatus, Rail};

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid webhook signature for {0}")]
    InvalidSignature(Rail),

    #[error("External error: {0}")]
    ExternalError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Settlement pipeline errors
///
/// A duplicate delivery is not an error; the gate reports it as an
/// `Admission::Duplicate` outcome instead.
#[derive(Error, Debug)]
pub enum SettlementError {
    /// Malformed invoice request or unparseable external reference. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Timeout or 5xx calling a rail. Retried by the poller on its next cycle.
    #[error("Rail {rail} unavailable: {message}")]
    TransientRail { rail: Rail, message: String },

    /// The atomic ledger unit of work did not commit. Redelivery or
    /// reconciliation re-applies the same event.
    #[error("Ledger write failed: {0}")]
    LedgerWriteFailed(String),

    /// The invoice already ended failed or expired on the rail side.
    #[error("Invoice {invoice_id} is terminal ({status})")]
    TerminalRailFailure {
        invoice_id: Uuid,
        status: InvoiceStatus,
    },
}

impl SettlementError {
    pub fn validation(message: impl Into<String>) -> Self {
        SettlementError::Validation(message.into())
    }

    pub fn transient(rail: Rail, message: impl Into<String>) -> Self {
        SettlementError::TransientRail {
            rail,
            message: message.into(),
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Settlement(SettlementError::Validation(msg)) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg,
                None,
            ),
            AppError::Settlement(SettlementError::TransientRail { rail, message }) => (
                StatusCode::BAD_GATEWAY,
                "RAIL_UNAVAILABLE",
                format!("Rail {} unavailable: {}", rail, message),
                Some(serde_json::json!({"rail": rail})),
            ),
            AppError::Settlement(SettlementError::LedgerWriteFailed(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "LEDGER_WRITE_FAILED",
                "Settlement could not be applied, retry delivery".to_string(),
                None,
            ),
            AppError::Settlement(SettlementError::TerminalRailFailure { invoice_id, status }) => (
                StatusCode::CONFLICT,
                "INVOICE_TERMINAL",
                format!("Invoice {} is already {}", invoice_id, status),
                Some(serde_json::json!({"invoice_id": invoice_id, "status": status})),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidSignature(rail) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_SIGNATURE",
                format!("Webhook signature rejected for {}", rail),
                None,
            ),
            AppError::ExternalError(_) => (
                StatusCode::BAD_GATEWAY,
                "EXTERNAL_ERROR",
                "An upstream service failed".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::BadRequest(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
