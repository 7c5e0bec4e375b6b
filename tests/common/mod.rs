#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use rust_decimal::Decimal;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use storefront_payments::api;
use storefront_payments::database::{
    InMemoryOrderStore, InMemoryPaymentStore, OrderSnapshot, PayerContact, PaymentStore,
};
use storefront_payments::health::HealthChecker;
use storefront_payments::payments::error::{PaymentError, PaymentResult};
use storefront_payments::payments::{
    CheckoutGateway, CheckoutOrder, CheckoutResponse, CryptoEnvelope, GatewayConfig, OrderStatus,
};
use storefront_payments::services::notification::{NotificationError, NotificationSender};
use storefront_payments::services::{OrchestratorConfig, PaymentOrchestrator, WebhookProcessor};
use uuid::Uuid;

pub const KEY: &str = "0123456789abcdef0123456789abcdef";
pub const IV: &str = "fedcba9876543210";

pub fn envelope() -> CryptoEnvelope {
    CryptoEnvelope::from_config(Some(KEY), Some(IV)).unwrap()
}

/// Gateway double that counts calls and can be told to fail.
pub struct StubGateway {
    pub calls: AtomicUsize,
    pub failure: Mutex<Option<PaymentError>>,
    pub orders: Mutex<Vec<CheckoutOrder>>,
}

impl StubGateway {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
            orders: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: PaymentError) -> Self {
        let gateway = Self::new();
        *gateway.failure.lock().unwrap() = Some(err);
        gateway
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckoutGateway for StubGateway {
    async fn checkout(&self, order: CheckoutOrder) -> PaymentResult<CheckoutResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.orders.lock().unwrap().push(order.clone());
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(CheckoutResponse {
            success: true,
            checkout_token: format!("tok-{}", order.reference),
            checkout_url: format!("https://gateway.test/payment?data=tok-{}", order.reference),
            gateway_payment_id: Some("GW-1001".to_string()),
            message: None,
        })
    }

    fn currency(&self) -> &str {
        "KWD"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Order(String, String),
    Payment(String, String),
}

/// Records every notification; optionally fails each one.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Sent>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send_order_confirmation(
        &self,
        destination: &str,
        reference: &str,
        _amount: &str,
    ) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Order(destination.to_string(), reference.to_string()));
        if self.fail {
            return Err(NotificationError::DeliveryFailed("smtp down".to_string()));
        }
        Ok(())
    }

    async fn send_payment_confirmation(
        &self,
        destination: &str,
        reference: &str,
        _amount: &str,
    ) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Payment(destination.to_string(), reference.to_string()));
        if self.fail {
            return Err(NotificationError::DeliveryFailed("smtp down".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub payments: Arc<InMemoryPaymentStore>,
    pub orders: Arc<InMemoryOrderStore>,
    pub gateway: Arc<StubGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub payer_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(StubGateway::new(), RecordingNotifier::default())
    }

    pub fn build(gateway: StubGateway, notifier: RecordingNotifier) -> Self {
        let payments = Arc::new(InMemoryPaymentStore::new());
        Self::with_store(payments.clone(), payments, gateway, notifier)
    }

    /// `store` is what the orchestrator talks to; `payments` is kept for inspection.
    pub fn with_store(
        store: Arc<dyn PaymentStore>,
        payments: Arc<InMemoryPaymentStore>,
        gateway: StubGateway,
        notifier: RecordingNotifier,
    ) -> Self {
        let orders = Arc::new(InMemoryOrderStore::new());
        let gateway = Arc::new(gateway);
        let notifier = Arc::new(notifier);
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            store,
            orders.clone(),
            orders.clone(),
            gateway.clone(),
            envelope(),
            notifier.clone(),
            OrchestratorConfig::default(),
        ));
        Self {
            orchestrator,
            payments,
            orders,
            gateway,
            notifier,
            payer_id: Uuid::new_v4(),
        }
    }

    pub async fn add_payer(&self) {
        self.orders
            .insert_payer(
                self.payer_id,
                PayerContact {
                    name: Some("Noor Al-Sabah".to_string()),
                    email: Some("noor@example.com".to_string()),
                    mobile: Some("+96550000000".to_string()),
                },
            )
            .await;
    }

    pub async fn add_order(&self, number: &str, total: Decimal) -> Uuid {
        let id = Uuid::new_v4();
        self.orders
            .insert_order(OrderSnapshot {
                id,
                user_id: self.payer_id,
                order_number: number.to_string(),
                total_amount: total,
                payment_status: None,
                order_status: OrderStatus::Pending,
            })
            .await;
        id
    }

    pub async fn order(&self, id: Uuid) -> OrderSnapshot {
        self.orders.order(id).await.expect("order should exist")
    }
}

pub const ACCESS_CODE: &str = "c333729b-d060-4b74-a49d-7686a8353481";
pub const WEBHOOK_SECRET: &str = "whsec_test";

impl Harness {
    /// Full HTTP app over this harness; `signed` turns on webhook HMAC checks.
    pub fn app(&self, signed: bool) -> Router {
        let processor = Arc::new(WebhookProcessor::new(
            self.orchestrator.clone(),
            ACCESS_CODE,
            signed.then(|| WEBHOOK_SECRET.to_string()),
        ));
        let health = Arc::new(HealthChecker::new(None, GatewayConfig::default()));
        api::router(self.orchestrator.clone(), processor, health)
    }
}

pub fn seal(value: JsonValue) -> String {
    envelope().encrypt_json(&value).unwrap()
}

pub fn success_notification(reference: &str, amount: &str) -> String {
    seal(json!({
        "status": true,
        "response": {
            "resultCode": "CAPTURED",
            "orderReferenceNumber": reference,
            "amount": amount,
            "transactionId": "TX-778899",
            "authCode": "A1B2C3",
            "paymentId": "100202500001",
            "cardBrand": "VISA",
            "maskedCard": "411111******1111"
        }
    }))
}

pub fn failure_notification(reference: &str) -> String {
    seal(json!({
        "resultCode": "NOT CAPTURED",
        "orderReferenceNumber": reference,
        "message": "Insufficient funds"
    }))
}
