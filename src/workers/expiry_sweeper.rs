use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::config::SweeperConfig;
use crate::payments::error::PaymentResult;
use crate::payments::types::ExpirySweepReport;
use crate::services::payment_orchestrator::PaymentOrchestrator;

/// Periodically expires stale pending payments and overdue payment orders.
pub struct ExpirySweeper {
    orchestrator: Arc<PaymentOrchestrator>,
    interval_secs: u64,
}

impl ExpirySweeper {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>, interval_secs: u64) -> Self {
        Self {
            orchestrator,
            interval_secs: interval_secs.max(1),
        }
    }

    pub fn from_config(orchestrator: Arc<PaymentOrchestrator>, config: &SweeperConfig) -> Self {
        Self::new(orchestrator, config.interval_secs)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.interval_secs,
            pending_ttl_secs = self.orchestrator.config().pending_ttl_secs,
            "Payment expiry sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Payment expiry sweeper stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // A failed cycle is retried on the next tick.
                    let _ = self.sweep_once().await;
                }
            }
        }

        info!("Payment expiry sweeper stopped");
    }

    pub async fn sweep_once(&self) -> PaymentResult<ExpirySweepReport> {
        match self.orchestrator.handle_expired_payments().await {
            Ok(report) => {
                if report.payments_expired > 0 || report.payment_orders_expired > 0 {
                    info!(
                        payments_expired = report.payments_expired,
                        payment_orders_expired = report.payment_orders_expired,
                        "⏰ Expired stale payments"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Payment expiry sweep failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{InMemoryOrderStore, InMemoryPaymentStore, PaymentStore};
    use crate::payments::crypto::CryptoEnvelope;
    use crate::payments::error::PaymentError;
    use crate::payments::gateway::{CheckoutOrder, CheckoutResponse};
    use crate::payments::provider::CheckoutGateway;
    use crate::payments::types::{Payment, PaymentMethod, PaymentStatus};
    use crate::services::notification::LoggingNotificationSender;
    use crate::services::payment_orchestrator::OrchestratorConfig;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct OfflineGateway;

    #[async_trait]
    impl CheckoutGateway for OfflineGateway {
        async fn checkout(&self, _order: CheckoutOrder) -> PaymentResult<CheckoutResponse> {
            Err(PaymentError::GatewayUnavailable {
                message: "offline".to_string(),
            })
        }

        fn currency(&self) -> &str {
            "KWD"
        }
    }

    fn sweeper(payments: Arc<InMemoryPaymentStore>) -> ExpirySweeper {
        let orders = Arc::new(InMemoryOrderStore::new());
        let envelope = CryptoEnvelope::from_config(
            Some("0123456789abcdef0123456789abcdef"),
            Some("fedcba9876543210"),
        )
        .unwrap();
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            payments,
            orders.clone(),
            orders,
            Arc::new(OfflineGateway),
            envelope,
            Arc::new(LoggingNotificationSender::new()),
            OrchestratorConfig::default(),
        ));
        ExpirySweeper::new(orchestrator, 1)
    }

    #[tokio::test]
    async fn sweep_once_reports_expired_payments() {
        let payments = Arc::new(InMemoryPaymentStore::new());
        let mut stale = Payment::new_pending(
            "PAY-OLD".to_string(),
            Some(Uuid::new_v4()),
            None,
            Uuid::new_v4(),
            PaymentMethod::Knet,
            dec!(1.000),
            1_000,
            "KWD",
        );
        stale.created_at = Utc::now() - chrono::Duration::hours(3);
        payments.put_payment(stale).await;

        let report = sweeper(payments.clone()).sweep_once().await.unwrap();
        assert_eq!(report.payments_expired, 1);

        let stored = payments.find_by_reference("PAY-OLD").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sweeper(Arc::new(InMemoryPaymentStore::new())).run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }

    #[test]
    fn zero_interval_is_clamped() {
        let sweeper = sweeper(Arc::new(InMemoryPaymentStore::new()));
        let clamped = ExpirySweeper::new(sweeper.orchestrator.clone(), 0);
        assert_eq!(clamped.interval_secs, 1);
    }
}
