//! Services module for business logic and integrations

pub mod notification;
pub mod payment_orchestrator;
pub mod webhook_processor;

// Re-export orchestrator types
pub use crate::services::payment_orchestrator::{
    NotificationChannel, OrchestratorConfig, PaymentInitiationRequest, PaymentOrchestrator,
    PaymentOrderPaymentRequest, PaymentOrderRequest, RefundRequest,
};
pub use crate::services::notification::{
    LoggingNotificationSender, NotificationError, NotificationSender,
};
pub use crate::services::webhook_processor::{WebhookProcessor, WebhookProcessorError};
