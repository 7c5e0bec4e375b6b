//! Payment Orchestrator Service
//!
//! Drives a payment from initiation to a terminal state. Every mutation is a
//! conditional write against the store, so the redirect callback, the
//! webhook and the expiry sweep can race on the same payment and only the
//! first one to arrive has any effect.

use crate::database::order_repository::{OrderSnapshot, OrderStore, PayerContact, PayerDirectory};
use crate::database::payment_repository::{PaymentChanges, PaymentStore};
use crate::logging::mask_card_number;
use crate::payments::crypto::CryptoEnvelope;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::gateway::{CheckoutOrder, CustomerContact, GatewayNotification};
use crate::payments::provider::CheckoutGateway;
use crate::payments::types::{
    CallbackOutcome, ExpirySweepReport, OrderStatus, Payment, PaymentInitiationResponse,
    PaymentMethod, PaymentOrder, PaymentStatus, PaymentStatusResponse,
};
use crate::payments::utils::{format_amount, generate_reference, normalize_amount, to_minor_units};
use crate::services::notification::NotificationSender;
use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const PAYMENT_REFERENCE_PREFIX: &str = "PAY";
pub const PAYMENT_ORDER_REFERENCE_PREFIX: &str = "PO";
pub const REFUND_REFERENCE_PREFIX: &str = "RFD";

/// Inserts retried with a fresh reference after a unique violation.
pub const MAX_REFERENCE_ATTEMPTS: u32 = 3;

/// Expired payments whose orders are updated at the same time.
const EXPIRY_CONCURRENCY: usize = 8;

const OPEN_STATES: &[PaymentStatus] = &[PaymentStatus::Pending, PaymentStatus::Processing];
const PAID_STATES: &[PaymentStatus] = &[PaymentStatus::Completed, PaymentStatus::Captured];

// ============================================================================
// Configuration & Request Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Age after which a `PENDING` payment is expired by the sweep
    pub pending_ttl_secs: u64,
    /// Lifetime of a payment order before it expires
    pub payment_order_ttl_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 3600,
            payment_order_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentInitiationRequest {
    pub order_id: Uuid,
    pub payer_id: Uuid,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentOrderRequest {
    pub order_ids: Vec<Uuid>,
    pub payer_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentOrderPaymentRequest {
    pub payer_id: Uuid,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundRequest {
    pub amount: Option<Decimal>,
    pub reason: Option<String>,
}

/// Channel a gateway notification arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationChannel {
    Callback,
    Webhook,
}

impl NotificationChannel {
    fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Callback => "callback",
            NotificationChannel::Webhook => "webhook",
        }
    }
}

// ============================================================================
// Main Payment Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    payments: Arc<dyn PaymentStore>,
    orders: Arc<dyn OrderStore>,
    payers: Arc<dyn PayerDirectory>,
    gateway: Arc<dyn CheckoutGateway>,
    envelope: CryptoEnvelope,
    notifier: Arc<dyn NotificationSender>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        orders: Arc<dyn OrderStore>,
        payers: Arc<dyn PayerDirectory>,
        gateway: Arc<dyn CheckoutGateway>,
        envelope: CryptoEnvelope,
        notifier: Arc<dyn NotificationSender>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            payments,
            orders,
            payers,
            gateway,
            envelope,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Initiation
    // =========================================================================

    pub async fn initiate_payment(
        &self,
        request: PaymentInitiationRequest,
    ) -> PaymentResult<PaymentInitiationResponse> {
        let order = self.payable_order(request.order_id, request.payer_id).await?;
        let amount = normalize_amount(order.total_amount);
        let minor_units = positive_minor_units(amount)?;
        let currency = self.gateway.currency().to_string();

        let payment = self
            .insert_payment(|reference| {
                Payment::new_pending(
                    reference,
                    Some(order.id),
                    None,
                    request.payer_id,
                    request.payment_method,
                    amount,
                    minor_units,
                    &currency,
                )
            })
            .await?;

        info!(
            payment_reference = %payment.reference,
            order_id = %order.id,
            method = %payment.payment_method,
            amount = %payment.amount,
            amount_minor_units = payment.amount_minor_units,
            "Payment created"
        );

        self.start_checkout(payment, vec![order], None).await
    }

    pub async fn create_payment_order(
        &self,
        request: PaymentOrderRequest,
    ) -> PaymentResult<PaymentOrder> {
        if request.order_ids.is_empty() {
            return Err(PaymentError::validation(
                "At least one order is required",
                Some("order_ids"),
            ));
        }
        let mut seen = HashSet::new();
        if !request.order_ids.iter().all(|id| seen.insert(*id)) {
            return Err(PaymentError::validation(
                "Order ids must be unique",
                Some("order_ids"),
            ));
        }

        let mut total = Decimal::ZERO;
        for order_id in &request.order_ids {
            let order = self.payable_order(*order_id, request.payer_id).await?;
            total += order.total_amount;
        }
        let total = normalize_amount(total);
        positive_minor_units(total)?;

        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.payment_order_ttl_secs as i64);
        let currency = self.gateway.currency().to_string();

        let mut attempt = 0;
        let payment_order = loop {
            attempt += 1;
            let candidate = PaymentOrder {
                id: Uuid::new_v4(),
                reference: generate_reference(PAYMENT_ORDER_REFERENCE_PREFIX),
                payer_id: request.payer_id,
                order_ids: request.order_ids.clone(),
                total_amount: total,
                currency: currency.clone(),
                status: PaymentStatus::Pending,
                payment_id: None,
                expires_at,
                created_at: now,
                updated_at: now,
            };
            match self.payments.insert_payment_order(&candidate).await {
                Ok(inserted) => break inserted,
                Err(e) if e.is_unique_violation() && attempt < MAX_REFERENCE_ATTEMPTS => {
                    warn!(
                        reference = %candidate.reference,
                        attempt,
                        "Payment order reference collision, regenerating"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(
            payment_order_reference = %payment_order.reference,
            orders = payment_order.order_ids.len(),
            total = %payment_order.total_amount,
            expires_at = %payment_order.expires_at,
            "Payment order created"
        );

        Ok(payment_order)
    }

    pub async fn initiate_payment_order_payment(
        &self,
        reference: &str,
        request: PaymentOrderPaymentRequest,
    ) -> PaymentResult<PaymentInitiationResponse> {
        let payment_order = self
            .payments
            .find_payment_order(reference)
            .await?
            .ok_or_else(|| PaymentError::NotFound {
                reference: reference.to_string(),
            })?;

        if payment_order.payer_id != request.payer_id {
            return Err(PaymentError::validation(
                "Payment order does not belong to this payer",
                Some("payer_id"),
            ));
        }
        if payment_order.status != PaymentStatus::Pending {
            return Err(PaymentError::StateConflict {
                reference: payment_order.reference.clone(),
                current: payment_order.status.to_string(),
                message: format!(
                    "Payment order is already {}",
                    payment_order.status.as_str().to_lowercase()
                ),
            });
        }
        if payment_order.expires_at <= Utc::now() {
            return Err(PaymentError::StateConflict {
                reference: payment_order.reference.clone(),
                current: payment_order.status.to_string(),
                message: "Payment order has expired".to_string(),
            });
        }

        let mut orders = Vec::with_capacity(payment_order.order_ids.len());
        for order_id in &payment_order.order_ids {
            orders.push(self.payable_order(*order_id, request.payer_id).await?);
        }

        let amount = payment_order.total_amount;
        let minor_units = positive_minor_units(amount)?;
        let payment = self
            .insert_payment(|reference| {
                Payment::new_pending(
                    reference,
                    None,
                    Some(payment_order.id),
                    request.payer_id,
                    request.payment_method,
                    amount,
                    minor_units,
                    &payment_order.currency,
                )
            })
            .await?;
        self.payments
            .attach_payment(payment_order.id, payment.id)
            .await?;

        info!(
            payment_reference = %payment.reference,
            payment_order_reference = %payment_order.reference,
            method = %payment.payment_method,
            amount = %payment.amount,
            "Payment created for payment order"
        );

        self.start_checkout(payment, orders, Some(payment_order.reference))
            .await
    }

    /// Cash on delivery confirms immediately; every other method opens a
    /// hosted checkout. Gateway failures fail the payment but are returned
    /// as an unsuccessful response rather than an error.
    async fn start_checkout(
        &self,
        payment: Payment,
        orders: Vec<OrderSnapshot>,
        payment_order_reference: Option<String>,
    ) -> PaymentResult<PaymentInitiationResponse> {
        let contact = self.payer_contact(payment.payer_id).await;

        if payment.payment_method.is_cash_on_delivery() {
            for order in &orders {
                self.update_order(order.id, PaymentStatus::Pending, Some(OrderStatus::Confirmed))
                    .await;
                self.notify_order_confirmed(&contact, order).await;
            }
            // A confirmed order must not be swept by the payment order deadline.
            if let Some(payment_order_id) = payment.payment_order_id {
                if let Err(e) = self
                    .payments
                    .transition_payment_order(
                        payment_order_id,
                        &[PaymentStatus::Pending],
                        PaymentStatus::Processing,
                    )
                    .await
                {
                    error!(
                        payment_reference = %payment.reference,
                        error = %e,
                        "Failed to update payment order status"
                    );
                }
            }
            info!(
                payment_reference = %payment.reference,
                "Cash on delivery payment recorded, orders confirmed"
            );
            return Ok(initiation_response(
                &payment,
                true,
                None,
                "Order confirmed. Payment will be collected on delivery".to_string(),
            ));
        }

        let description = match (&payment_order_reference, orders.as_slice()) {
            (Some(po_reference), _) => format!("Payment order {}", po_reference),
            (None, [order]) => format!("Order {}", order.order_number),
            (None, _) => format!("Payment {}", payment.reference),
        };
        let mut variables: Vec<String> = orders.iter().map(|o| o.id.to_string()).collect();
        if let Some(po_reference) = payment_order_reference {
            variables.insert(0, po_reference);
        }

        let checkout = CheckoutOrder {
            reference: payment.reference.clone(),
            amount_minor_units: payment.amount_minor_units,
            payment_method: payment.payment_method,
            customer: CustomerContact {
                name: contact.name.clone(),
                email: contact.email.clone(),
                mobile: contact.mobile.clone(),
            },
            variables,
            description: Some(description),
        };

        match self.gateway.checkout(checkout).await {
            Ok(response) => {
                let changes = PaymentChanges {
                    checkout_token: Some(response.checkout_token.clone())
                        .filter(|t| !t.is_empty()),
                    checkout_url: Some(response.checkout_url.clone()),
                    gateway_payment_id: response.gateway_payment_id.clone(),
                    ..PaymentChanges::default()
                };
                let updated = self
                    .payments
                    .transition(
                        &payment.reference,
                        &[PaymentStatus::Pending],
                        PaymentStatus::Processing,
                        changes,
                    )
                    .await?;

                match updated {
                    Some(updated) => {
                        self.mirror_status(&updated, PaymentStatus::Processing, None)
                            .await;
                        info!(
                            payment_reference = %updated.reference,
                            gateway_payment_id = ?updated.gateway_payment_id,
                            "Checkout session opened"
                        );
                        Ok(initiation_response(
                            &updated,
                            true,
                            None,
                            "Redirect the customer to the checkout URL".to_string(),
                        ))
                    }
                    None => {
                        let current = self.load_payment(&payment.reference).await?;
                        warn!(
                            payment_reference = %current.reference,
                            status = %current.status,
                            "Payment changed state while the checkout was being opened"
                        );
                        Ok(initiation_response(
                            &current,
                            false,
                            None,
                            format!("Payment is {}", current.status.as_str().to_lowercase()),
                        ))
                    }
                }
            }
            Err(err) => {
                if err.is_gateway_error() {
                    warn!(
                        payment_reference = %payment.reference,
                        error = %err,
                        "Gateway checkout failed"
                    );
                } else {
                    error!(
                        payment_reference = %payment.reference,
                        error = %err,
                        "Checkout could not be prepared"
                    );
                }

                let changes = PaymentChanges {
                    error_code: Some(err.error_code().as_str().to_string()),
                    error_message: Some(err.to_string()),
                    ..PaymentChanges::default()
                };
                let failed = self
                    .payments
                    .transition(
                        &payment.reference,
                        &[PaymentStatus::Pending],
                        PaymentStatus::Failed,
                        changes,
                    )
                    .await?;
                let current = match failed {
                    Some(failed) => {
                        self.mirror_status(&failed, PaymentStatus::Failed, None).await;
                        failed
                    }
                    None => self.load_payment(&payment.reference).await?,
                };

                Ok(initiation_response(
                    &current,
                    false,
                    Some(err.error_code()),
                    err.user_message(),
                ))
            }
        }
    }

    // =========================================================================
    // Gateway notifications
    // =========================================================================

    pub async fn process_callback(&self, encrypted: &str) -> PaymentResult<CallbackOutcome> {
        let notification = GatewayNotification::decrypt(&self.envelope, encrypted)?;
        self.apply_notification(notification, NotificationChannel::Callback)
            .await
    }

    pub async fn process_webhook(&self, encrypted: &str) -> PaymentResult<CallbackOutcome> {
        let notification = GatewayNotification::decrypt(&self.envelope, encrypted)?;
        self.apply_notification(notification, NotificationChannel::Webhook)
            .await
    }

    /// Shared success/failure branch for both notification channels.
    pub async fn apply_notification(
        &self,
        notification: GatewayNotification,
        channel: NotificationChannel,
    ) -> PaymentResult<CallbackOutcome> {
        let reference = notification
            .reference
            .clone()
            .ok_or_else(|| PaymentError::InvalidPayload {
                message: "notification carries no order reference".to_string(),
            })?;
        let mut payment = self.load_payment(&reference).await?;

        if channel == NotificationChannel::Webhook {
            if let Some(stamped) = self
                .payments
                .mark_webhook_received(&reference, Utc::now())
                .await?
            {
                payment = stamped;
            }
        }

        if payment.status.is_terminal() {
            info!(
                payment_reference = %reference,
                status = %payment.status,
                channel = channel.as_str(),
                "Duplicate notification for settled payment ignored"
            );
            return Ok(callback_outcome(&payment, "Payment already processed".to_string()));
        }

        let amount_matches = notification
            .amount_decimal()
            .map(|amount| amount_matches(&payment, amount))
            .unwrap_or(true);

        if notification.is_success() && amount_matches {
            self.complete_payment(&payment, &notification, channel).await
        } else {
            let message = if notification.is_success() {
                warn!(
                    payment_reference = %reference,
                    expected = %payment.amount,
                    received = ?notification.amount,
                    "Gateway reported a different amount"
                );
                "amount mismatch".to_string()
            } else {
                notification
                    .message
                    .clone()
                    .unwrap_or_else(|| "Payment was declined".to_string())
            };
            self.fail_payment(&payment, &notification, message, channel)
                .await
        }
    }

    async fn complete_payment(
        &self,
        payment: &Payment,
        notification: &GatewayNotification,
        channel: NotificationChannel,
    ) -> PaymentResult<CallbackOutcome> {
        let changes = PaymentChanges {
            transaction_id: notification.transaction_id.clone(),
            authorization_code: notification.authorization_code.clone(),
            gateway_status: notification.result_code.clone(),
            gateway_payment_id: notification.payment_id.clone(),
            card_brand: notification.card_brand.clone(),
            masked_card_number: notification
                .masked_card_number
                .as_deref()
                .map(mask_card_number),
            card_expiry: notification.card_expiry.clone(),
            knet_payment_id: notification.knet_payment_id.clone(),
            knet_transaction_id: notification.knet_transaction_id.clone(),
            knet_reference_id: notification.knet_reference_id.clone(),
            completed_at: Some(Utc::now()),
            ..PaymentChanges::default()
        };

        let Some(completed) = self
            .payments
            .transition(&payment.reference, OPEN_STATES, PaymentStatus::Completed, changes)
            .await?
        else {
            return self.lost_race(&payment.reference, channel).await;
        };

        let orders = self
            .mirror_status(&completed, PaymentStatus::Completed, Some(OrderStatus::Confirmed))
            .await;

        info!(
            payment_reference = %completed.reference,
            transaction_id = ?completed.transaction_id,
            channel = channel.as_str(),
            "Payment completed"
        );

        let contact = self.payer_contact(completed.payer_id).await;
        for order in &orders {
            self.notify_order_confirmed(&contact, order).await;
        }
        self.notify_payment_received(&contact, &completed).await;

        Ok(callback_outcome(&completed, "Payment completed successfully".to_string()))
    }

    async fn fail_payment(
        &self,
        payment: &Payment,
        notification: &GatewayNotification,
        message: String,
        channel: NotificationChannel,
    ) -> PaymentResult<CallbackOutcome> {
        let changes = PaymentChanges {
            transaction_id: notification.transaction_id.clone(),
            gateway_status: notification.result_code.clone(),
            gateway_payment_id: notification.payment_id.clone(),
            error_code: Some(
                notification
                    .result_code
                    .clone()
                    .unwrap_or_else(|| "DECLINED".to_string()),
            ),
            error_message: Some(message.clone()),
            ..PaymentChanges::default()
        };

        let Some(failed) = self
            .payments
            .transition(&payment.reference, OPEN_STATES, PaymentStatus::Failed, changes)
            .await?
        else {
            return self.lost_race(&payment.reference, channel).await;
        };

        self.mirror_status(&failed, PaymentStatus::Failed, None).await;

        warn!(
            payment_reference = %failed.reference,
            gateway_status = ?failed.gateway_status,
            reason = %message,
            channel = channel.as_str(),
            "Payment failed"
        );

        Ok(callback_outcome(&failed, message))
    }

    async fn lost_race(
        &self,
        reference: &str,
        channel: NotificationChannel,
    ) -> PaymentResult<CallbackOutcome> {
        let current = self.load_payment(reference).await?;
        info!(
            payment_reference = %reference,
            status = %current.status,
            channel = channel.as_str(),
            "Payment settled concurrently, notification ignored"
        );
        Ok(callback_outcome(&current, "Payment already processed".to_string()))
    }

    // =========================================================================
    // Status, cancellation & refunds
    // =========================================================================

    pub async fn check_payment_status(
        &self,
        reference: &str,
    ) -> PaymentResult<PaymentStatusResponse> {
        let payment = self.load_payment(reference).await?;
        Ok(PaymentStatusResponse::from(&payment))
    }

    pub async fn cancel_payment(&self, reference: &str) -> PaymentResult<PaymentStatusResponse> {
        let payment = self.load_payment(reference).await?;
        if !payment.status.can_transition_to(PaymentStatus::Cancelled) {
            return Err(cancel_conflict(&payment));
        }

        let cancelled = match self
            .payments
            .transition(
                reference,
                OPEN_STATES,
                PaymentStatus::Cancelled,
                PaymentChanges::default(),
            )
            .await?
        {
            Some(cancelled) => cancelled,
            None => return Err(cancel_conflict(&self.load_payment(reference).await?)),
        };

        // Cash on delivery confirmed the order up front; without the payment
        // there is nothing left to deliver against.
        let order_status = cancelled
            .payment_method
            .is_cash_on_delivery()
            .then_some(OrderStatus::Cancelled);
        self.mirror_status(&cancelled, PaymentStatus::Cancelled, order_status)
            .await;
        info!(payment_reference = %reference, "Payment cancelled");

        Ok(PaymentStatusResponse::from(&cancelled))
    }

    pub async fn initiate_refund(
        &self,
        reference: &str,
        request: RefundRequest,
    ) -> PaymentResult<PaymentStatusResponse> {
        let payment = self.load_payment(reference).await?;
        refund_precondition(&payment)?;

        let refund_amount = normalize_amount(request.amount.unwrap_or(payment.amount));
        if refund_amount <= Decimal::ZERO {
            return Err(PaymentError::validation(
                "Refund amount must be greater than zero",
                Some("amount"),
            ));
        }
        if refund_amount > payment.amount {
            return Err(PaymentError::validation(
                format!(
                    "Refund amount {} exceeds the payment amount {}",
                    refund_amount, payment.amount
                ),
                Some("amount"),
            ));
        }

        let target = if refund_amount == normalize_amount(payment.amount) {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        let changes = PaymentChanges {
            refund_amount: Some(refund_amount),
            refund_reason: request.reason.clone(),
            refund_reference: Some(generate_reference(REFUND_REFERENCE_PREFIX)),
            refunded_at: Some(Utc::now()),
            ..PaymentChanges::default()
        };

        let refunded = match self
            .payments
            .transition(reference, PAID_STATES, target, changes)
            .await?
        {
            Some(refunded) => refunded,
            None => {
                let current = self.load_payment(reference).await?;
                refund_precondition(&current)?;
                return Err(PaymentError::StateConflict {
                    reference: reference.to_string(),
                    current: current.status.to_string(),
                    message: "Payment changed state during the refund".to_string(),
                });
            }
        };

        self.mirror_status(&refunded, target, None).await;
        info!(
            payment_reference = %reference,
            refund_reference = ?refunded.refund_reference,
            refund_amount = %refund_amount,
            status = %target,
            "Refund recorded"
        );

        Ok(PaymentStatusResponse::from(&refunded))
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Expire stale `PENDING` payments and overdue payment orders. Payments in
    /// any other state are never touched.
    pub async fn handle_expired_payments(&self) -> PaymentResult<ExpirySweepReport> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(self.config.pending_ttl_secs as i64);
        let mut report = ExpirySweepReport::default();

        let expired = self.payments.expire_pending_before(cutoff).await?;
        report.payments_expired = expired.len();
        stream::iter(&expired)
            .for_each_concurrent(EXPIRY_CONCURRENCY, |payment| async move {
                self.mirror_status(payment, PaymentStatus::Expired, None)
                    .await;
                info!(payment_reference = %payment.reference, "Pending payment expired");
            })
            .await;

        let expired_orders = self.payments.expire_payment_orders_before(now).await?;
        for payment_order in &expired_orders {
            for order_id in &payment_order.order_ids {
                self.expire_order_payment(*order_id).await;
            }
            info!(
                payment_order_reference = %payment_order.reference,
                "Payment order expired"
            );
        }
        report.payment_orders_expired = expired_orders.len();

        Ok(report)
    }

    async fn expire_order_payment(&self, order_id: Uuid) {
        match self.orders.find_order(order_id).await {
            Ok(Some(order)) if !order.is_paid() => {
                self.update_order(order_id, PaymentStatus::Expired, None)
                    .await;
            }
            Ok(_) => {}
            Err(e) => error!(order_id = %order_id, error = %e, "Failed to load order for expiry"),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn load_payment(&self, reference: &str) -> PaymentResult<Payment> {
        self.payments
            .find_by_reference(reference)
            .await?
            .ok_or_else(|| PaymentError::NotFound {
                reference: reference.to_string(),
            })
    }

    /// Order exists, belongs to the payer and has not been paid yet.
    async fn payable_order(&self, order_id: Uuid, payer_id: Uuid) -> PaymentResult<OrderSnapshot> {
        let order = self.orders.find_order(order_id).await?.ok_or_else(|| {
            PaymentError::validation(format!("Order {} not found", order_id), Some("order_id"))
        })?;
        if order.user_id != payer_id {
            return Err(PaymentError::validation(
                "Order does not belong to this payer",
                Some("payer_id"),
            ));
        }
        if order.is_paid() {
            return Err(PaymentError::validation(
                format!("Order {} is already paid", order.order_number),
                Some("order_id"),
            ));
        }
        Ok(order)
    }

    async fn insert_payment<F>(&self, build: F) -> PaymentResult<Payment>
    where
        F: Fn(String) -> Payment,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let candidate = build(generate_reference(PAYMENT_REFERENCE_PREFIX));
            match self.payments.insert_payment(&candidate).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) if e.is_unique_violation() && attempt < MAX_REFERENCE_ATTEMPTS => {
                    warn!(
                        reference = %candidate.reference,
                        attempt,
                        "Payment reference collision, regenerating"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Copy a payment status onto every order it pays for, and onto its
    /// payment order. Returns the affected orders as they were before the update.
    async fn mirror_status(
        &self,
        payment: &Payment,
        status: PaymentStatus,
        order_status: Option<OrderStatus>,
    ) -> Vec<OrderSnapshot> {
        let mut order_ids = Vec::new();
        if let Some(order_id) = payment.order_id {
            order_ids.push(order_id);
        }

        if let Some(payment_order_id) = payment.payment_order_id {
            let from: Vec<PaymentStatus> = [
                PaymentStatus::Pending,
                PaymentStatus::Processing,
                PaymentStatus::Completed,
                PaymentStatus::Captured,
            ]
            .into_iter()
            .filter(|s| *s != status && s.can_transition_to(status))
            .collect();

            match self
                .payments
                .transition_payment_order(payment_order_id, &from, status)
                .await
            {
                Ok(_) => {}
                Err(e) => error!(
                    payment_reference = %payment.reference,
                    error = %e,
                    "Failed to update payment order status"
                ),
            }
            match self.payments.find_payment_order_by_id(payment_order_id).await {
                Ok(Some(payment_order)) => order_ids.extend(payment_order.order_ids),
                Ok(None) => warn!(
                    payment_reference = %payment.reference,
                    "Payment order referenced by payment is missing"
                ),
                Err(e) => error!(
                    payment_reference = %payment.reference,
                    error = %e,
                    "Failed to load payment order"
                ),
            }
        }

        let mut orders = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            match self.orders.find_order(order_id).await {
                Ok(Some(order)) => orders.push(order),
                Ok(None) => warn!(order_id = %order_id, "Order linked to payment is missing"),
                Err(e) => error!(order_id = %order_id, error = %e, "Failed to load order"),
            }
            self.update_order(order_id, status, order_status).await;
        }
        orders
    }

    /// The payment record is authoritative; order updates that fail are
    /// logged for reconciliation and do not undo the payment transition.
    /// An order settled by another payment attempt is left as it is.
    async fn update_order(
        &self,
        order_id: Uuid,
        status: PaymentStatus,
        order_status: Option<OrderStatus>,
    ) {
        match self
            .orders
            .set_payment_status(order_id, status, settled_order_states(status))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    order_id = %order_id,
                    payment_status = %status,
                    "Order already settled by another payment, left unchanged"
                );
                return;
            }
            Err(e) => error!(
                order_id = %order_id,
                payment_status = %status,
                error = %e,
                "Failed to update order payment status"
            ),
        }
        if let Some(order_status) = order_status {
            if let Err(e) = self.orders.set_order_status(order_id, order_status).await {
                error!(
                    order_id = %order_id,
                    order_status = order_status.as_str(),
                    error = %e,
                    "Failed to update order status"
                );
            }
        }
    }

    async fn payer_contact(&self, payer_id: Uuid) -> PayerContact {
        match self.payers.find_payer(payer_id).await {
            Ok(Some(contact)) => contact,
            Ok(None) => PayerContact::default(),
            Err(e) => {
                warn!(payer_id = %payer_id, error = %e, "Failed to load payer contact");
                PayerContact::default()
            }
        }
    }

    async fn notify_order_confirmed(&self, contact: &PayerContact, order: &OrderSnapshot) {
        let Some(destination) = destination(contact) else {
            warn!(order_id = %order.id, "No contact for order confirmation");
            return;
        };
        let amount = format_amount(order.total_amount, self.gateway.currency());
        if let Err(e) = self
            .notifier
            .send_order_confirmation(destination, &order.order_number, &amount)
            .await
        {
            warn!(order_id = %order.id, error = %e, "Order confirmation not sent");
        }
    }

    async fn notify_payment_received(&self, contact: &PayerContact, payment: &Payment) {
        let Some(destination) = destination(contact) else {
            warn!(payment_reference = %payment.reference, "No contact for payment confirmation");
            return;
        };
        let amount = format_amount(payment.amount, &payment.currency);
        if let Err(e) = self
            .notifier
            .send_payment_confirmation(destination, &payment.reference, &amount)
            .await
        {
            warn!(
                payment_reference = %payment.reference,
                error = %e,
                "Payment confirmation not sent"
            );
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn positive_minor_units(amount: Decimal) -> PaymentResult<i64> {
    let minor_units = to_minor_units(amount)?;
    if minor_units <= 0 {
        return Err(PaymentError::validation(
            "Amount must be greater than zero",
            Some("amount"),
        ));
    }
    Ok(minor_units)
}

/// The gateway may report either the decimal amount or minor units.
fn amount_matches(payment: &Payment, reported: Decimal) -> bool {
    normalize_amount(reported) == normalize_amount(payment.amount)
        || reported == Decimal::from(payment.amount_minor_units)
}

/// Order payment statuses that `status` must not overwrite. Only a refund
/// moves a paid order on, and a refunded order is never paid again.
fn settled_order_states(status: PaymentStatus) -> &'static [PaymentStatus] {
    match status {
        PaymentStatus::Refunded | PaymentStatus::PartiallyRefunded => &[],
        PaymentStatus::Completed | PaymentStatus::Captured => {
            &[PaymentStatus::Refunded, PaymentStatus::PartiallyRefunded]
        }
        _ => &[
            PaymentStatus::Completed,
            PaymentStatus::Captured,
            PaymentStatus::Refunded,
            PaymentStatus::PartiallyRefunded,
        ],
    }
}

fn destination(contact: &PayerContact) -> Option<&str> {
    let usable = |d: &&str| !d.trim().is_empty();
    contact
        .email
        .as_deref()
        .filter(usable)
        .or_else(|| contact.mobile.as_deref().filter(usable))
}

fn cancel_conflict(payment: &Payment) -> PaymentError {
    let message = if payment.status.is_paid() {
        "Payment is already completed; issue a refund instead".to_string()
    } else {
        format!(
            "Payment is already {} and cannot be cancelled",
            payment.status.as_str().to_lowercase()
        )
    };
    PaymentError::StateConflict {
        reference: payment.reference.clone(),
        current: payment.status.to_string(),
        message,
    }
}

fn refund_precondition(payment: &Payment) -> PaymentResult<()> {
    if payment.status.is_refunded() {
        return Err(PaymentError::StateConflict {
            reference: payment.reference.clone(),
            current: payment.status.to_string(),
            message: "Payment has already been refunded".to_string(),
        });
    }
    if !payment.status.is_paid() {
        return Err(PaymentError::StateConflict {
            reference: payment.reference.clone(),
            current: payment.status.to_string(),
            message: "Only completed payments can be refunded".to_string(),
        });
    }
    Ok(())
}

fn initiation_response(
    payment: &Payment,
    success: bool,
    error_code: Option<crate::error::ErrorCode>,
    message: String,
) -> PaymentInitiationResponse {
    PaymentInitiationResponse {
        success,
        payment_reference: payment.reference.clone(),
        status: payment.status,
        checkout_url: payment.checkout_url.clone(),
        amount: payment.amount,
        amount_minor_units: payment.amount_minor_units,
        currency: payment.currency.clone(),
        error_code,
        message,
    }
}

fn callback_outcome(payment: &Payment, message: String) -> CallbackOutcome {
    CallbackOutcome {
        success: payment.status.is_paid(),
        payment_reference: payment.reference.clone(),
        status: payment.status,
        gateway_status: payment.gateway_status.clone(),
        order_id: payment.order_id,
        payment_order_id: payment.payment_order_id,
        transaction_id: payment.transaction_id.clone(),
        message,
    }
}

// ============================================================================
// Tests
// ============================================================================
