//! Unified error type for the HTTP surface.
//!
//! Payment failures keep their own taxonomy in [`crate::payments::error`];
//! this module adds storage failures and maps everything onto stable error
//! codes and HTTP statuses.

use crate::payments::error::PaymentError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error codes returned to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Payment errors
    #[serde(rename = "CRYPTO_CONFIGURATION_ERROR")]
    CryptoConfigurationError,
    #[serde(rename = "INVALID_PAYLOAD")]
    InvalidPayload,
    #[serde(rename = "GATEWAY_AUTH_ERROR")]
    GatewayAuthError,
    #[serde(rename = "GATEWAY_REJECTED")]
    GatewayRejected,
    #[serde(rename = "GATEWAY_UNAVAILABLE")]
    GatewayUnavailable,
    #[serde(rename = "STATE_CONFLICT")]
    StateConflict,
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,

    // Infrastructure errors
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,

    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CryptoConfigurationError => "CRYPTO_CONFIGURATION_ERROR",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::GatewayAuthError => "GATEWAY_AUTH_ERROR",
            ErrorCode::GatewayRejected => "GATEWAY_REJECTED",
            ErrorCode::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            ErrorCode::StateConflict => "STATE_CONFLICT",
            ErrorCode::PaymentNotFound => "PAYMENT_NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infrastructure-level errors
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Payment(PaymentError),
    Infrastructure(InfrastructureError),
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Payment(err) => err.http_status_code(),
            AppErrorKind::Infrastructure(_) => 500,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Payment(err) => err.error_code(),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
            },
        }
    }

    /// Message safe to show to API clients. Gateway and storage details stay in the logs.
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Payment(err) => err.user_message(),
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Payment(err) => err.is_retryable(),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
            },
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AppErrorKind::Payment(err) => write!(f, "{}", err),
            AppErrorKind::Infrastructure(InfrastructureError::Database { message, .. }) => {
                write!(f, "Database error: {}", message)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        AppError::new(AppErrorKind::Payment(err))
    }
}

// From<DatabaseError> lives in database/error.rs next to the type it converts.

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_errors_keep_their_status_and_code() {
        let error: AppError = PaymentError::StateConflict {
            reference: "PAY-1".to_string(),
            current: "COMPLETED".to_string(),
            message: "Payment is already completed".to_string(),
        }
        .into();

        assert_eq!(error.status_code(), 409);
        assert_eq!(error.error_code(), ErrorCode::StateConflict);
        assert_eq!(error.user_message(), "Payment is already completed");
        assert!(!error.is_retryable());
    }

    #[test]
    fn gateway_details_are_not_exposed() {
        let error: AppError = PaymentError::GatewayRejected {
            status: 400,
            message: "merchant 842217 has invalid terminal".to_string(),
        }
        .into();

        assert_eq!(error.status_code(), 502);
        assert!(!error.user_message().contains("842217"));
    }

    #[test]
    fn validation_errors_are_bad_requests() {
        let error: AppError =
            PaymentError::validation("order is already paid", Some("order_id")).into();
        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert!(!error.is_retryable());
    }

    #[test]
    fn database_errors_hide_their_message() {
        let error = AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: "relation \"payments\" does not exist".to_string(),
            is_retryable: false,
        }));
        assert_eq!(error.status_code(), 500);
        assert_eq!(error.error_code(), ErrorCode::DatabaseError);
        assert!(!error.user_message().contains("payments"));
        assert!(error.to_string().contains("payments"));
    }

    #[test]
    fn error_codes_serialize_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::GatewayUnavailable).unwrap(),
            "\"GATEWAY_UNAVAILABLE\""
        );
        assert_eq!(ErrorCode::PaymentNotFound.to_string(), "PAYMENT_NOT_FOUND");
    }
}
