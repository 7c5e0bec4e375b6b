//! Narrow views onto the storefront's order and user tables.
//!
//! The payment core only reads order totals and ownership, mirrors payment
//! status onto orders and reads payer contact details for notifications.

use crate::database::error::DatabaseError;
use crate::payments::types::{OrderStatus, PaymentStatus};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_number: String,
    pub total_amount: Decimal,
    pub payment_status: Option<PaymentStatus>,
    pub order_status: OrderStatus,
}

impl OrderSnapshot {
    pub fn is_paid(&self) -> bool {
        self.payment_status.map(|s| s.is_paid()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayerContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub mobile: Option<String>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<OrderSnapshot>, DatabaseError>;

    /// Writes `status` unless the order's current payment status is one of
    /// `unless`. Returns whether the order was updated.
    async fn set_payment_status(
        &self,
        order_id: Uuid,
        status: PaymentStatus,
        unless: &[PaymentStatus],
    ) -> Result<bool, DatabaseError>;

    async fn set_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait PayerDirectory: Send + Sync {
    async fn find_payer(&self, payer_id: Uuid) -> Result<Option<PayerContact>, DatabaseError>;
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    order_number: String,
    total_amount: Decimal,
    payment_status: Option<String>,
    status: String,
}

#[derive(Debug, FromRow)]
struct PayerRow {
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
}

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderRepository {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<OrderSnapshot>, DatabaseError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, user_id, order_number, total_amount, payment_status, status \
             FROM orders WHERE id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        row.map(|row| {
            Ok(OrderSnapshot {
                id: row.id,
                user_id: row.user_id,
                order_number: row.order_number,
                total_amount: row.total_amount,
                // Orders that never saw a payment carry NULL or an unknown legacy value.
                payment_status: row
                    .payment_status
                    .as_deref()
                    .and_then(|s| PaymentStatus::from_str(s).ok()),
                order_status: OrderStatus::from_str(&row.status)
                    .map_err(|e| DatabaseError::unknown(e.to_string()))?,
            })
        })
        .transpose()
    }

    async fn set_payment_status(
        &self,
        order_id: Uuid,
        status: PaymentStatus,
        unless: &[PaymentStatus],
    ) -> Result<bool, DatabaseError> {
        let guarded: Vec<&str> = unless.iter().map(|s| s.as_str()).collect();
        let result = sqlx::query(
            "UPDATE orders SET payment_status = $2, updated_at = NOW() \
             WHERE id = $1 AND (payment_status IS NULL OR NOT (payment_status = ANY($3)))",
        )
        .bind(order_id)
        .bind(status.as_str())
        .bind(&guarded)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(order_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl PayerDirectory for PgOrderRepository {
    async fn find_payer(&self, payer_id: Uuid) -> Result<Option<PayerContact>, DatabaseError> {
        let row = sqlx::query_as::<_, PayerRow>(
            "SELECT first_name, last_name, email, phone FROM users WHERE id = $1",
        )
        .bind(payer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(row.map(|row| {
            let name = [row.first_name, row.last_name]
                .into_iter()
                .flatten()
                .filter(|part| !part.trim().is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            PayerContact {
                name: if name.is_empty() { None } else { Some(name) },
                email: row.email,
                mobile: row.phone,
            }
        }))
    }
}
