use crate::logging::mask_email;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationType {
    OrderConfirmation,
    PaymentConfirmation,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("no destination available for {0:?}")]
    MissingDestination(NotificationType),

    #[error("notification delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Outbound customer notifications. Callers treat every failure as non-fatal.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_order_confirmation(
        &self,
        destination: &str,
        reference: &str,
        amount: &str,
    ) -> Result<(), NotificationError>;

    async fn send_payment_confirmation(
        &self,
        destination: &str,
        reference: &str,
        amount: &str,
    ) -> Result<(), NotificationError>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationSender;

impl LoggingNotificationSender {
    pub fn new() -> Self {
        Self
    }

    fn emit(&self, kind: NotificationType, destination: &str, reference: &str, amount: &str) {
        match kind {
            NotificationType::OrderConfirmation => info!(
                destination = %mask_email(destination),
                reference = %reference,
                amount = %amount,
                "🔔 NOTIFICATION: Order confirmed"
            ),
            NotificationType::PaymentConfirmation => info!(
                destination = %mask_email(destination),
                reference = %reference,
                amount = %amount,
                "🔔 NOTIFICATION: Payment received"
            ),
        }
    }
}

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send_order_confirmation(
        &self,
        destination: &str,
        reference: &str,
        amount: &str,
    ) -> Result<(), NotificationError> {
        if destination.trim().is_empty() {
            return Err(NotificationError::MissingDestination(
                NotificationType::OrderConfirmation,
            ));
        }
        self.emit(NotificationType::OrderConfirmation, destination, reference, amount);
        Ok(())
    }

    async fn send_payment_confirmation(
        &self,
        destination: &str,
        reference: &str,
        amount: &str,
    ) -> Result<(), NotificationError> {
        if destination.trim().is_empty() {
            return Err(NotificationError::MissingDestination(
                NotificationType::PaymentConfirmation,
            ));
        }
        self.emit(
            NotificationType::PaymentConfirmation,
            destination,
            reference,
            amount,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_sender_requires_destination() {
        let sender = LoggingNotificationSender::new();
        assert!(sender
            .send_order_confirmation("noor@example.com", "ORD-1", "10.500 KWD")
            .await
            .is_ok());
        assert!(matches!(
            sender.send_payment_confirmation(" ", "PAY-1", "10.500 KWD").await,
            Err(NotificationError::MissingDestination(
                NotificationType::PaymentConfirmation
            ))
        ));
    }
}
