use crate::error::ErrorCode;
use crate::payments::error::PaymentError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// National debit card scheme.
    Knet,
    Visa,
    Mastercard,
    Amex,
    ApplePay,
    GooglePay,
    CashOnDelivery,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Knet => "knet",
            PaymentMethod::Visa => "visa",
            PaymentMethod::Mastercard => "mastercard",
            PaymentMethod::Amex => "amex",
            PaymentMethod::ApplePay => "apple_pay",
            PaymentMethod::GooglePay => "google_pay",
            PaymentMethod::CashOnDelivery => "cash_on_delivery",
        }
    }

    /// Payment-type code understood by the hosted gateway. Cash on delivery
    /// never reaches the gateway.
    pub fn gateway_code(&self) -> Option<u8> {
        match self {
            PaymentMethod::Knet => Some(1),
            PaymentMethod::Visa | PaymentMethod::Mastercard => Some(2),
            PaymentMethod::Amex => Some(7),
            PaymentMethod::ApplePay => Some(9),
            PaymentMethod::GooglePay => Some(10),
            PaymentMethod::CashOnDelivery => None,
        }
    }

    pub fn is_cash_on_delivery(&self) -> bool {
        matches!(self, PaymentMethod::CashOnDelivery)
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "knet" => Ok(PaymentMethod::Knet),
            "visa" => Ok(PaymentMethod::Visa),
            "mastercard" | "master_card" => Ok(PaymentMethod::Mastercard),
            "amex" | "american_express" => Ok(PaymentMethod::Amex),
            "apple_pay" | "applepay" => Ok(PaymentMethod::ApplePay),
            "google_pay" | "googlepay" => Ok(PaymentMethod::GooglePay),
            "cash_on_delivery" | "cod" => Ok(PaymentMethod::CashOnDelivery),
            _ => Err(PaymentError::validation(
                format!("unsupported payment method: {}", value),
                Some("payment_method"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Captured,
    Failed,
    Cancelled,
    Expired,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Captured => "CAPTURED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
        }
    }

    /// Only pending and processing payments can still move forward.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Captured)
    }

    pub fn is_refunded(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Refunded | PaymentStatus::PartiallyRefunded
        )
    }

    pub fn valid_transitions(&self) -> &'static [PaymentStatus] {
        match self {
            PaymentStatus::Pending => &[
                PaymentStatus::Processing,
                PaymentStatus::Completed,
                PaymentStatus::Captured,
                PaymentStatus::Failed,
                PaymentStatus::Cancelled,
                PaymentStatus::Expired,
            ],
            PaymentStatus::Processing => &[
                PaymentStatus::Completed,
                PaymentStatus::Captured,
                PaymentStatus::Failed,
                PaymentStatus::Cancelled,
                PaymentStatus::Expired,
            ],
            PaymentStatus::Completed | PaymentStatus::Captured => &[
                PaymentStatus::Refunded,
                PaymentStatus::PartiallyRefunded,
            ],
            PaymentStatus::Failed
            | PaymentStatus::Cancelled
            | PaymentStatus::Expired
            | PaymentStatus::Refunded
            | PaymentStatus::PartiallyRefunded => &[],
        }
    }

    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PROCESSING" => Ok(PaymentStatus::Processing),
            "COMPLETED" => Ok(PaymentStatus::Completed),
            "CAPTURED" => Ok(PaymentStatus::Captured),
            "FAILED" => Ok(PaymentStatus::Failed),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            "EXPIRED" => Ok(PaymentStatus::Expired),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            "PARTIALLY_REFUNDED" => Ok(PaymentStatus::PartiallyRefunded),
            _ => Err(PaymentError::validation(
                format!("unknown payment status: {}", value),
                Some("status"),
            )),
        }
    }
}

/// Fulfilment status of an order, owned by the order aggregate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "PENDING" => Ok(OrderStatus::Pending),
            "CONFIRMED" => Ok(OrderStatus::Confirmed),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "SHIPPED" => Ok(OrderStatus::Shipped),
            "DELIVERED" => Ok(OrderStatus::Delivered),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            _ => Err(PaymentError::validation(
                format!("unknown order status: {}", value),
                Some("order_status"),
            )),
        }
    }
}

/// One attempt to pay for one order (or for one payment order).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub reference: String,
    pub order_id: Option<Uuid>,
    pub payment_order_id: Option<Uuid>,
    pub payer_id: Uuid,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub amount_minor_units: i64,
    pub currency: String,

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

    pub webhook_received: bool,
    pub webhook_received_at: Option<DateTime<Utc>>,

    pub error_code: Option<String>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Fresh `PENDING` payment with no gateway data attached yet.
    pub fn new_pending(
        reference: String,
        order_id: Option<Uuid>,
        payment_order_id: Option<Uuid>,
        payer_id: Uuid,
        payment_method: PaymentMethod,
        amount: Decimal,
        amount_minor_units: i64,
        currency: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            reference,
            order_id,
            payment_order_id,
            payer_id,
            payment_method,
            status: PaymentStatus::Pending,
            amount,
            amount_minor_units,
            currency: currency.to_string(),
            checkout_token: None,
            checkout_url: None,
            gateway_payment_id: None,
            transaction_id: None,
            authorization_code: None,
            gateway_status: None,
            card_brand: None,
            masked_card_number: None,
            card_expiry: None,
            knet_payment_id: None,
            knet_transaction_id: None,
            knet_reference_id: None,
            refund_amount: None,
            refund_reason: None,
            refund_reference: None,
            refunded_at: None,
            webhook_received: false,
            webhook_received_at: None,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expired_at: None,
        }
    }
}

/// A single checkout covering several orders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentOrder {
    pub id: Uuid,
    pub reference: String,
    pub payer_id: Uuid,
    pub order_ids: Vec<Uuid>,
    pub total_amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInitiationResponse {
    pub success: bool,
    pub payment_reference: String,
    pub status: PaymentStatus,
    pub checkout_url: Option<String>,
    pub amount: Decimal,
    pub amount_minor_units: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub message: String,
}

/// Caller-facing projection of a payment, shared by status, cancel and refund.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentStatusResponse {
    pub success: bool,
    pub payment_reference: String,
    pub order_id: Option<Uuid>,
    pub payment_order_id: Option<Uuid>,
    pub status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub amount: Decimal,
    pub amount_minor_units: i64,
    pub currency: String,
    pub transaction_id: Option<String>,
    pub gateway_status: Option<String>,
    pub refund_amount: Option<Decimal>,
    pub refund_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&Payment> for PaymentStatusResponse {
    fn from(payment: &Payment) -> Self {
        Self {
            success: !matches!(
                payment.status,
                PaymentStatus::Failed | PaymentStatus::Expired
            ),
            payment_reference: payment.reference.clone(),
            order_id: payment.order_id,
            payment_order_id: payment.payment_order_id,
            status: payment.status,
            payment_method: payment.payment_method,
            amount: payment.amount,
            amount_minor_units: payment.amount_minor_units,
            currency: payment.currency.clone(),
            transaction_id: payment.transaction_id.clone(),
            gateway_status: payment.gateway_status.clone(),
            refund_amount: payment.refund_amount,
            refund_reference: payment.refund_reference.clone(),
            created_at: payment.created_at,
            completed_at: payment.completed_at,
            error_code: payment.error_code.clone(),
            message: payment.error_message.clone(),
        }
    }
}

/// Body returned to the browser after a gateway redirect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackOutcome {
    pub success: bool,
    pub payment_reference: String,
    pub status: PaymentStatus,
    pub gateway_status: Option<String>,
    pub order_id: Option<Uuid>,
    pub payment_order_id: Option<Uuid>,
    pub transaction_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpirySweepReport {
    pub payments_expired: usize,
    pub payment_orders_expired: usize,
}
