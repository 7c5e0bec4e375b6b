use crate::error::ErrorCode;
use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Crypto configuration error: {message}")]
    CryptoConfigurationError { message: String },

    #[error("Invalid gateway payload: {message}")]
    InvalidPayload { message: String },

    #[error("Gateway authentication failed: {message}")]
    GatewayAuthError { message: String },

    #[error("Gateway rejected request: status={status}, message={message}")]
    GatewayRejected { status: u16, message: String },

    #[error("Gateway unavailable: {message}")]
    GatewayUnavailable { message: String },

    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("State conflict for payment {reference}: {message}")]
    StateConflict {
        reference: String,
        current: String,
        message: String,
    },

    #[error("Payment not found: {reference}")]
    NotFound { reference: String },

    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl PaymentError {
    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        PaymentError::ValidationError {
            message: message.into(),
            field: field.map(|f| f.to_string()),
        }
    }

    pub fn is_gateway_error(&self) -> bool {
        matches!(
            self,
            PaymentError::GatewayAuthError { .. }
                | PaymentError::GatewayRejected { .. }
                | PaymentError::GatewayUnavailable { .. }
        )
    }

    /// Gateway failures are never retried inline; this only tells the
    /// initiator whether trying again later is sensible.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::GatewayUnavailable { .. } => true,
            PaymentError::Storage { .. } => true,
            PaymentError::CryptoConfigurationError { .. }
            | PaymentError::InvalidPayload { .. }
            | PaymentError::GatewayAuthError { .. }
            | PaymentError::GatewayRejected { .. }
            | PaymentError::ValidationError { .. }
            | PaymentError::StateConflict { .. }
            | PaymentError::NotFound { .. } => false,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            PaymentError::CryptoConfigurationError { .. } => ErrorCode::CryptoConfigurationError,
            PaymentError::InvalidPayload { .. } => ErrorCode::InvalidPayload,
            PaymentError::GatewayAuthError { .. } => ErrorCode::GatewayAuthError,
            PaymentError::GatewayRejected { .. } => ErrorCode::GatewayRejected,
            PaymentError::GatewayUnavailable { .. } => ErrorCode::GatewayUnavailable,
            PaymentError::ValidationError { .. } => ErrorCode::ValidationError,
            PaymentError::StateConflict { .. } => ErrorCode::StateConflict,
            PaymentError::NotFound { .. } => ErrorCode::PaymentNotFound,
            PaymentError::Storage { .. } => ErrorCode::DatabaseError,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::InvalidPayload { .. } => 400,
            PaymentError::NotFound { .. } => 404,
            PaymentError::StateConflict { .. } => 409,
            PaymentError::GatewayAuthError { .. } => 502,
            PaymentError::GatewayRejected { .. } => 502,
            PaymentError::GatewayUnavailable { .. } => 503,
            PaymentError::CryptoConfigurationError { .. } => 500,
            PaymentError::Storage { .. } => 500,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::StateConflict { message, .. } => message.clone(),
            PaymentError::NotFound { reference } => format!("Payment '{}' not found", reference),
            PaymentError::InvalidPayload { .. } => {
                "Payment notification could not be verified".to_string()
            }
            PaymentError::GatewayAuthError { .. }
            | PaymentError::GatewayRejected { .. }
            | PaymentError::GatewayUnavailable { .. } => {
                "Payment gateway is currently unavailable. Please try again later".to_string()
            }
            PaymentError::CryptoConfigurationError { .. } | PaymentError::Storage { .. } => {
                "Payment service temporarily unavailable. Please try again later".to_string()
            }
        }
    }
}

impl From<crate::database::error::DatabaseError> for PaymentError {
    fn from(err: crate::database::error::DatabaseError) -> Self {
        PaymentError::Storage {
            message: err.to_string(),
        }
    }
}
