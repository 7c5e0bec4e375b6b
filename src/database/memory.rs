//! In-memory stores used by `SKIP_EXTERNALS` mode and the test suite.
//!
//! Compare-and-set is done under a single write lock, which gives the same
//! race semantics as the conditional `UPDATE` of the Postgres store.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::order_repository::{OrderSnapshot, OrderStore, PayerContact, PayerDirectory};
use crate::database::payment_repository::{PaymentChanges, PaymentStore};
use crate::payments::types::{
    OrderStatus, Payment, PaymentMethod, PaymentOrder, PaymentStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryPaymentStore {
    payments: RwLock<HashMap<String, Payment>>,
    payment_orders: RwLock<HashMap<Uuid, PaymentOrder>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_payments(&self) -> Vec<Payment> {
        self.payments.read().await.values().cloned().collect()
    }

    /// Overwrites a stored payment wholesale; used to age records in tests.
    pub async fn put_payment(&self, payment: Payment) {
        self.payments
            .write()
            .await
            .insert(payment.reference.clone(), payment);
    }

    pub async fn put_payment_order(&self, order: PaymentOrder) {
        self.payment_orders.write().await.insert(order.id, order);
    }
}

fn unique_violation(constraint: &str) -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::UniqueViolation {
        constraint: Some(constraint.to_string()),
    })
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert_payment(&self, payment: &Payment) -> Result<Payment, DatabaseError> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&payment.reference) {
            return Err(unique_violation("payments_reference_key"));
        }
        payments.insert(payment.reference.clone(), payment.clone());
        Ok(payment.clone())
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Payment>, DatabaseError> {
        Ok(self.payments.read().await.get(reference).cloned())
    }

    async fn transition(
        &self,
        reference: &str,
        from: &[PaymentStatus],
        to: PaymentStatus,
        changes: PaymentChanges,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut payments = self.payments.write().await;
        match payments.get_mut(reference) {
            Some(payment) if from.contains(&payment.status) => {
                payment.status = to;
                changes.apply(payment);
                payment.updated_at = Utc::now();
                Ok(Some(payment.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_webhook_received(
        &self,
        reference: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut payments = self.payments.write().await;
        Ok(payments.get_mut(reference).map(|payment| {
            payment.webhook_received = true;
            payment.webhook_received_at = Some(received_at);
            payment.updated_at = Utc::now();
            payment.clone()
        }))
    }

    async fn expire_pending_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Payment>, DatabaseError> {
        let now = Utc::now();
        let mut payments = self.payments.write().await;
        Ok(payments
            .values_mut()
            .filter(|p| {
                p.status == PaymentStatus::Pending
                    && p.payment_method != PaymentMethod::CashOnDelivery
                    && p.created_at < cutoff
            })
            .map(|payment| {
                payment.status = PaymentStatus::Expired;
                payment.expired_at = Some(now);
                payment.updated_at = now;
                payment.clone()
            })
            .collect())
    }

    async fn insert_payment_order(
        &self,
        order: &PaymentOrder,
    ) -> Result<PaymentOrder, DatabaseError> {
        let mut orders = self.payment_orders.write().await;
        if orders.values().any(|o| o.reference == order.reference) {
            return Err(unique_violation("payment_orders_reference_key"));
        }
        orders.insert(order.id, order.clone());
        Ok(order.clone())
    }

    async fn find_payment_order(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        Ok(self
            .payment_orders
            .read()
            .await
            .values()
            .find(|o| o.reference == reference)
            .cloned())
    }

    async fn find_payment_order_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        Ok(self.payment_orders.read().await.get(&id).cloned())
    }

    async fn attach_payment(
        &self,
        payment_order_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        let mut orders = self.payment_orders.write().await;
        Ok(orders.get_mut(&payment_order_id).map(|order| {
            order.payment_id = Some(payment_id);
            order.updated_at = Utc::now();
            order.clone()
        }))
    }

    async fn transition_payment_order(
        &self,
        id: Uuid,
        from: &[PaymentStatus],
        to: PaymentStatus,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        let mut orders = self.payment_orders.write().await;
        match orders.get_mut(&id) {
            Some(order) if from.contains(&order.status) => {
                order.status = to;
                order.updated_at = Utc::now();
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expire_payment_orders_before(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PaymentOrder>, DatabaseError> {
        let mut orders = self.payment_orders.write().await;
        Ok(orders
            .values_mut()
            .filter(|o| o.status == PaymentStatus::Pending && o.expires_at < now)
            .map(|order| {
                order.status = PaymentStatus::Expired;
                order.updated_at = Utc::now();
                order.clone()
            })
            .collect())
    }
}

/// Orders and payers kept in memory.
#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<Uuid, OrderSnapshot>>,
    payers: RwLock<HashMap<Uuid, PayerContact>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_order(&self, order: OrderSnapshot) {
        self.orders.write().await.insert(order.id, order);
    }

    pub async fn insert_payer(&self, payer_id: Uuid, contact: PayerContact) {
        self.payers.write().await.insert(payer_id, contact);
    }

    pub async fn order(&self, order_id: Uuid) -> Option<OrderSnapshot> {
        self.orders.read().await.get(&order_id).cloned()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<OrderSnapshot>, DatabaseError> {
        Ok(self.orders.read().await.get(&order_id).cloned())
    }

    async fn set_payment_status(
        &self,
        order_id: Uuid,
        status: PaymentStatus,
        unless: &[PaymentStatus],
    ) -> Result<bool, DatabaseError> {
        match self.orders.write().await.get_mut(&order_id) {
            Some(order) => {
                if order.payment_status.is_some_and(|current| unless.contains(&current)) {
                    return Ok(false);
                }
                order.payment_status = Some(status);
                Ok(true)
            }
            None => Err(DatabaseError::new(DatabaseErrorKind::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            })),
        }
    }

    async fn set_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<(), DatabaseError> {
        match self.orders.write().await.get_mut(&order_id) {
            Some(order) => {
                order.order_status = status;
                Ok(())
            }
            None => Err(DatabaseError::new(DatabaseErrorKind::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            })),
        }
    }
}

#[async_trait]
impl PayerDirectory for InMemoryOrderStore {
    async fn find_payer(&self, payer_id: Uuid) -> Result<Option<PayerContact>, DatabaseError> {
        Ok(self.payers.read().await.get(&payer_id).cloned())
    }
}
