use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::types::{Payment, PaymentMethod, PaymentOrder, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

/// Field updates applied together with a status transition. `None` leaves
/// the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentChanges {
    pub checkout_token: Option<String>,
    pub checkout_url: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub transaction_id: Option<String>,
    pub authorization_code: Option<String>,
    pub gateway_status: Option<String>,
    pub card_brand: Option<String>,
    pub masked_card_number: Option<String>,
    pub card_expiry: Option<String>,
    pub knet_payment_id: Option<String>,
    pub knet_transaction_id: Option<String>,
    pub knet_reference_id: Option<String>,
    pub refund_amount: Option<Decimal>,
    pub refund_reason: Option<String>,
    pub refund_reference: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl PaymentChanges {
    pub fn apply(&self, payment: &mut Payment) {
        fn set<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *target = value.clone();
            }
        }

        set(&mut payment.checkout_token, &self.checkout_token);
        set(&mut payment.checkout_url, &self.checkout_url);
        set(&mut payment.gateway_payment_id, &self.gateway_payment_id);
        set(&mut payment.transaction_id, &self.transaction_id);
        set(&mut payment.authorization_code, &self.authorization_code);
        set(&mut payment.gateway_status, &self.gateway_status);
        set(&mut payment.card_brand, &self.card_brand);
        set(&mut payment.masked_card_number, &self.masked_card_number);
        set(&mut payment.card_expiry, &self.card_expiry);
        set(&mut payment.knet_payment_id, &self.knet_payment_id);
        set(&mut payment.knet_transaction_id, &self.knet_transaction_id);
        set(&mut payment.knet_reference_id, &self.knet_reference_id);
        set(&mut payment.refund_amount, &self.refund_amount);
        set(&mut payment.refund_reason, &self.refund_reason);
        set(&mut payment.refund_reference, &self.refund_reference);
        set(&mut payment.refunded_at, &self.refunded_at);
        set(&mut payment.error_code, &self.error_code);
        set(&mut payment.error_message, &self.error_message);
        set(&mut payment.completed_at, &self.completed_at);
        set(&mut payment.expired_at, &self.expired_at);
    }
}

/// Persistence seam for payments and payment orders.
///
/// Every status change is a compare-and-set: the write only happens when the
/// stored status is one of `from`, and `Ok(None)` tells the caller it lost.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Fails with `UniqueViolation` when the reference is already taken.
    async fn insert_payment(&self, payment: &Payment) -> Result<Payment, DatabaseError>;

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Payment>, DatabaseError>;

    async fn transition(
        &self,
        reference: &str,
        from: &[PaymentStatus],
        to: PaymentStatus,
        changes: PaymentChanges,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// Audit stamp only, status is never touched.
    async fn mark_webhook_received(
        &self,
        reference: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// `PENDING`, non cash-on-delivery payments created before `cutoff` become `EXPIRED`.
    async fn expire_pending_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Payment>, DatabaseError>;

    async fn insert_payment_order(
        &self,
        order: &PaymentOrder,
    ) -> Result<PaymentOrder, DatabaseError>;

    async fn find_payment_order(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentOrder>, DatabaseError>;

    async fn find_payment_order_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<PaymentOrder>, DatabaseError>;

    async fn attach_payment(
        &self,
        payment_order_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentOrder>, DatabaseError>;

    async fn transition_payment_order(
        &self,
        id: Uuid,
        from: &[PaymentStatus],
        to: PaymentStatus,
    ) -> Result<Option<PaymentOrder>, DatabaseError>;

    /// `PENDING` payment orders whose deadline passed before `now` become `EXPIRED`.
    async fn expire_payment_orders_before(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PaymentOrder>, DatabaseError>;
}

const PAYMENT_COLUMNS: &str = "id, reference, order_id, payment_order_id, payer_id, payment_method, status, \
     amount, amount_minor_units, currency, checkout_token, checkout_url, gateway_payment_id, \
     transaction_id, authorization_code, gateway_status, card_brand, masked_card_number, card_expiry, \
     knet_payment_id, knet_transaction_id, knet_reference_id, refund_amount, refund_reason, \
     refund_reference, refunded_at, webhook_received, webhook_received_at, error_code, error_message, \
     created_at, updated_at, completed_at, expired_at";

const PAYMENT_ORDER_COLUMNS: &str = "id, reference, payer_id, order_ids, total_amount, currency, status, payment_id, \
     expires_at, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct PaymentRow {
    id: Uuid,
    reference: String,
    order_id: Option<Uuid>,
    payment_order_id: Option<Uuid>,
    payer_id: Uuid,
    payment_method: String,
    status: String,
    amount: Decimal,
    amount_minor_units: i64,
    currency: String,
    checkout_token: Option<String>,
    checkout_url: Option<String>,
    gateway_payment_id: Option<String>,
    transaction_id: Option<String>,
    authorization_code: Option<String>,
    gateway_status: Option<String>,
    card_brand: Option<String>,
    masked_card_number: Option<String>,
    card_expiry: Option<String>,
    knet_payment_id: Option<String>,
    knet_transaction_id: Option<String>,
    knet_reference_id: Option<String>,
    refund_amount: Option<Decimal>,
    refund_reason: Option<String>,
    refund_reference: Option<String>,
    refunded_at: Option<DateTime<Utc>>,
    webhook_received: bool,
    webhook_received_at: Option<DateTime<Utc>>,
    error_code: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
}

fn decode_error(message: String) -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::Decode { message })
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let payment_method = PaymentMethod::from_str(&row.payment_method)
            .map_err(|e| decode_error(e.to_string()))?;
        let status =
            PaymentStatus::from_str(&row.status).map_err(|e| decode_error(e.to_string()))?;

        Ok(Payment {
            id: row.id,
            reference: row.reference,
            order_id: row.order_id,
            payment_order_id: row.payment_order_id,
            payer_id: row.payer_id,
            payment_method,
            status,
            amount: row.amount,
            amount_minor_units: row.amount_minor_units,
            currency: row.currency,
            checkout_token: row.checkout_token,
            checkout_url: row.checkout_url,
            gateway_payment_id: row.gateway_payment_id,
            transaction_id: row.transaction_id,
            authorization_code: row.authorization_code,
            gateway_status: row.gateway_status,
            card_brand: row.card_brand,
            masked_card_number: row.masked_card_number,
            card_expiry: row.card_expiry,
            knet_payment_id: row.knet_payment_id,
            knet_transaction_id: row.knet_transaction_id,
            knet_reference_id: row.knet_reference_id,
            refund_amount: row.refund_amount,
            refund_reason: row.refund_reason,
            refund_reference: row.refund_reference,
            refunded_at: row.refunded_at,
            webhook_received: row.webhook_received,
            webhook_received_at: row.webhook_received_at,
            error_code: row.error_code,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            expired_at: row.expired_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct PaymentOrderRow {
    id: Uuid,
    reference: String,
    payer_id: Uuid,
    order_ids: Vec<Uuid>,
    total_amount: Decimal,
    currency: String,
    status: String,
    payment_id: Option<Uuid>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentOrderRow> for PaymentOrder {
    type Error = DatabaseError;

    fn try_from(row: PaymentOrderRow) -> Result<Self, Self::Error> {
        Ok(PaymentOrder {
            id: row.id,
            reference: row.reference,
            payer_id: row.payer_id,
            order_ids: row.order_ids,
            total_amount: row.total_amount,
            currency: row.currency,
            status: PaymentStatus::from_str(&row.status)
                .map_err(|e| decode_error(e.to_string()))?,
            payment_id: row.payment_id,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_strings(statuses: &[PaymentStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Postgres-backed payment store
pub struct PgPaymentRepository {
    pool: PgPool,
}

impl PgPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_payment(
        &self,
        clause: &str,
        bind: PaymentKey<'_>,
    ) -> Result<Option<Payment>, DatabaseError> {
        let sql = format!("SELECT {} FROM payments WHERE {}", PAYMENT_COLUMNS, clause);
        let query = sqlx::query_as::<_, PaymentRow>(&sql);
        let query = match bind {
            PaymentKey::Reference(reference) => query.bind(reference.to_string()),
            PaymentKey::Id(id) => query.bind(id),
        };
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn fetch_payment_order(
        &self,
        clause: &str,
        bind: PaymentKey<'_>,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM payment_orders WHERE {}",
            PAYMENT_ORDER_COLUMNS, clause
        );
        let query = sqlx::query_as::<_, PaymentOrderRow>(&sql);
        let query = match bind {
            PaymentKey::Reference(reference) => query.bind(reference.to_string()),
            PaymentKey::Id(id) => query.bind(id),
        };
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentOrder::try_from)
            .transpose()
    }
}

enum PaymentKey<'a> {
    Reference(&'a str),
    Id(Uuid),
}

#[async_trait]
impl PaymentStore for PgPaymentRepository {
    async fn insert_payment(&self, payment: &Payment) -> Result<Payment, DatabaseError> {
        let sql = format!(
            "INSERT INTO payments (id, reference, order_id, payment_order_id, payer_id, payment_method, \
             status, amount, amount_minor_units, currency, webhook_received, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, false, $11, $11) \
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(payment.id)
            .bind(&payment.reference)
            .bind(payment.order_id)
            .bind(payment.payment_order_id)
            .bind(payment.payer_id)
            .bind(payment.payment_method.as_str())
            .bind(payment.status.as_str())
            .bind(payment.amount)
            .bind(payment.amount_minor_units)
            .bind(&payment.currency)
            .bind(payment.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Payment::try_from(row)
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Payment>, DatabaseError> {
        self.fetch_payment("reference = $1", PaymentKey::Reference(reference))
            .await
    }

    async fn transition(
        &self,
        reference: &str,
        from: &[PaymentStatus],
        to: PaymentStatus,
        changes: PaymentChanges,
    ) -> Result<Option<Payment>, DatabaseError> {
        let sql = format!(
            "UPDATE payments SET status = $3, \
             checkout_token = COALESCE($4, checkout_token), \
             checkout_url = COALESCE($5, checkout_url), \
             gateway_payment_id = COALESCE($6, gateway_payment_id), \
             transaction_id = COALESCE($7, transaction_id), \
             authorization_code = COALESCE($8, authorization_code), \
             gateway_status = COALESCE($9, gateway_status), \
             card_brand = COALESCE($10, card_brand), \
             masked_card_number = COALESCE($11, masked_card_number), \
             card_expiry = COALESCE($12, card_expiry), \
             knet_payment_id = COALESCE($13, knet_payment_id), \
             knet_transaction_id = COALESCE($14, knet_transaction_id), \
             knet_reference_id = COALESCE($15, knet_reference_id), \
             refund_amount = COALESCE($16, refund_amount), \
             refund_reason = COALESCE($17, refund_reason), \
             refund_reference = COALESCE($18, refund_reference), \
             refunded_at = COALESCE($19, refunded_at), \
             error_code = COALESCE($20, error_code), \
             error_message = COALESCE($21, error_message), \
             completed_at = COALESCE($22, completed_at), \
             expired_at = COALESCE($23, expired_at), \
             updated_at = NOW() \
             WHERE reference = $1 AND status = ANY($2) \
             RETURNING {}",
            PAYMENT_COLUMNS
        );

        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(reference)
            .bind(status_strings(from))
            .bind(to.as_str())
            .bind(changes.checkout_token)
            .bind(changes.checkout_url)
            .bind(changes.gateway_payment_id)
            .bind(changes.transaction_id)
            .bind(changes.authorization_code)
            .bind(changes.gateway_status)
            .bind(changes.card_brand)
            .bind(changes.masked_card_number)
            .bind(changes.card_expiry)
            .bind(changes.knet_payment_id)
            .bind(changes.knet_transaction_id)
            .bind(changes.knet_reference_id)
            .bind(changes.refund_amount)
            .bind(changes.refund_reason)
            .bind(changes.refund_reference)
            .bind(changes.refunded_at)
            .bind(changes.error_code)
            .bind(changes.error_message)
            .bind(changes.completed_at)
            .bind(changes.expired_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn mark_webhook_received(
        &self,
        reference: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Option<Payment>, DatabaseError> {
        let sql = format!(
            "UPDATE payments SET webhook_received = true, webhook_received_at = $2, updated_at = NOW() \
             WHERE reference = $1 RETURNING {}",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(reference)
            .bind(received_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn expire_pending_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Payment>, DatabaseError> {
        let sql = format!(
            "UPDATE payments SET status = 'EXPIRED', expired_at = NOW(), updated_at = NOW() \
             WHERE status = 'PENDING' AND payment_method <> $2 AND created_at < $1 \
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(cutoff)
            .bind(PaymentMethod::CashOnDelivery.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(Payment::try_from)
            .collect()
    }

    async fn insert_payment_order(
        &self,
        order: &PaymentOrder,
    ) -> Result<PaymentOrder, DatabaseError> {
        let sql = format!(
            "INSERT INTO payment_orders (id, reference, payer_id, order_ids, total_amount, currency, \
             status, payment_id, expires_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) \
             RETURNING {}",
            PAYMENT_ORDER_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentOrderRow>(&sql)
            .bind(order.id)
            .bind(&order.reference)
            .bind(order.payer_id)
            .bind(&order.order_ids)
            .bind(order.total_amount)
            .bind(&order.currency)
            .bind(order.status.as_str())
            .bind(order.payment_id)
            .bind(order.expires_at)
            .bind(order.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        PaymentOrder::try_from(row)
    }

    async fn find_payment_order(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        self.fetch_payment_order("reference = $1", PaymentKey::Reference(reference))
            .await
    }

    async fn find_payment_order_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        self.fetch_payment_order("id = $1", PaymentKey::Id(id)).await
    }

    async fn attach_payment(
        &self,
        payment_order_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        let sql = format!(
            "UPDATE payment_orders SET payment_id = $2, updated_at = NOW() \
             WHERE id = $1 RETURNING {}",
            PAYMENT_ORDER_COLUMNS
        );
        sqlx::query_as::<_, PaymentOrderRow>(&sql)
            .bind(payment_order_id)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentOrder::try_from)
            .transpose()
    }

    async fn transition_payment_order(
        &self,
        id: Uuid,
        from: &[PaymentStatus],
        to: PaymentStatus,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        let sql = format!(
            "UPDATE payment_orders SET status = $3, updated_at = NOW() \
             WHERE id = $1 AND status = ANY($2) RETURNING {}",
            PAYMENT_ORDER_COLUMNS
        );
        sqlx::query_as::<_, PaymentOrderRow>(&sql)
            .bind(id)
            .bind(status_strings(from))
            .bind(to.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentOrder::try_from)
            .transpose()
    }

    async fn expire_payment_orders_before(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PaymentOrder>, DatabaseError> {
        let sql = format!(
            "UPDATE payment_orders SET status = 'EXPIRED', updated_at = NOW() \
             WHERE status = 'PENDING' AND expires_at < $1 RETURNING {}",
            PAYMENT_ORDER_COLUMNS
        );
        sqlx::query_as::<_, PaymentOrderRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(PaymentOrder::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn changes_only_overwrite_provided_fields() {
        let mut payment = Payment::new_pending(
            "PAY-1".to_string(),
            Some(Uuid::new_v4()),
            None,
            Uuid::new_v4(),
            PaymentMethod::Knet,
            dec!(10.500),
            10_500,
            "KWD",
        );
        payment.checkout_token = Some("tok".to_string());

        PaymentChanges {
            transaction_id: Some("TX-1".to_string()),
            ..PaymentChanges::default()
        }
        .apply(&mut payment);

        assert_eq!(payment.checkout_token.as_deref(), Some("tok"));
        assert_eq!(payment.transaction_id.as_deref(), Some("TX-1"));
    }

    #[test]
    fn row_with_unknown_status_fails_to_decode() {
        let now = Utc::now();
        let row = PaymentOrderRow {
            id: Uuid::new_v4(),
            reference: "PO-1".to_string(),
            payer_id: Uuid::new_v4(),
            order_ids: vec![],
            total_amount: dec!(1),
            currency: "KWD".to_string(),
            status: "SETTLED".to_string(),
            payment_id: None,
            expires_at: now,
            created_at: now,
            updated_at: now,
        };
        let err = PaymentOrder::try_from(row).unwrap_err();
        assert!(matches!(err.kind, DatabaseErrorKind::Decode { .. }));
    }
}
