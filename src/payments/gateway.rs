//! HTTP client for the hosted payment gateway.
//!
//! Checkout payloads are serialized to JSON, sealed with [`CryptoEnvelope`]
//! and posted with the merchant access code. Failures are classified once
//! here and never retried inline.

use crate::middleware::logging::log_external_call;
use crate::payments::crypto::CryptoEnvelope;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::CheckoutGateway;
use crate::payments::types::PaymentMethod;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const ACCESS_CODE_HEADER: &str = "accessCode";

/// Result codes the gateway uses for a successful payment.
pub const SUCCESS_RESULT_CODES: &[&str] = &["CAPTURED", "SUCCESS", "ACCEPT", "APPROVED"];

pub fn is_success_result_code(code: &str) -> bool {
    let normalized = code.trim().to_uppercase();
    SUCCESS_RESULT_CODES.contains(&normalized.as_str())
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub checkout_path: String,
    pub merchant_code: String,
    pub access_code: String,
    pub secret_key: Option<String>,
    pub iv: Option<String>,
    pub response_url: String,
    pub failure_url: String,
    pub currency: String,
    pub version: String,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
    pub webhook_secret: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sandbox.gateway.example.com".to_string(),
            checkout_path: "/checkout".to_string(),
            merchant_code: String::new(),
            access_code: String::new(),
            secret_key: None,
            iv: None,
            response_url: "http://localhost:8000/api/payments/callback".to_string(),
            failure_url: "http://localhost:8000/api/payments/callback".to_string(),
            currency: "KWD".to_string(),
            version: "2.0".to_string(),
            connect_timeout_secs: 10,
            timeout_secs: 30,
            webhook_secret: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        let required = |name: &str| {
            std::env::var(name).map_err(|_| {
                PaymentError::validation(
                    format!("{} environment variable is required", name),
                    Some(name),
                )
            })
        };

        Ok(Self {
            base_url: std::env::var("GATEWAY_BASE_URL").unwrap_or(defaults.base_url),
            checkout_path: std::env::var("GATEWAY_CHECKOUT_PATH")
                .unwrap_or(defaults.checkout_path),
            merchant_code: required("GATEWAY_MERCHANT_CODE")?,
            access_code: required("GATEWAY_ACCESS_CODE")?,
            secret_key: std::env::var("GATEWAY_SECRET_KEY").ok(),
            iv: std::env::var("GATEWAY_IV").ok(),
            response_url: std::env::var("GATEWAY_RESPONSE_URL").unwrap_or(defaults.response_url),
            failure_url: std::env::var("GATEWAY_FAILURE_URL").unwrap_or(defaults.failure_url),
            currency: std::env::var("GATEWAY_CURRENCY").unwrap_or(defaults.currency),
            version: std::env::var("GATEWAY_VERSION").unwrap_or(defaults.version),
            connect_timeout_secs: std::env::var("GATEWAY_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.connect_timeout_secs),
            timeout_secs: std::env::var("GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.timeout_secs),
            webhook_secret: std::env::var("GATEWAY_WEBHOOK_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }

    /// Eager check run at start-up. Key material problems come back as
    /// `CryptoConfigurationError`.
    pub fn validate(&self) -> PaymentResult<()> {
        CryptoEnvelope::from_config(self.secret_key.as_deref(), self.iv.as_deref())?;

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(PaymentError::validation(
                "GATEWAY_BASE_URL must be a valid URL",
                Some("GATEWAY_BASE_URL"),
            ));
        }
        if self.merchant_code.trim().is_empty() {
            return Err(PaymentError::validation(
                "GATEWAY_MERCHANT_CODE cannot be empty",
                Some("GATEWAY_MERCHANT_CODE"),
            ));
        }
        if self.access_code.trim().is_empty() {
            return Err(PaymentError::validation(
                "GATEWAY_ACCESS_CODE cannot be empty",
                Some("GATEWAY_ACCESS_CODE"),
            ));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(PaymentError::validation(
                "GATEWAY_CURRENCY must be a three-letter code",
                Some("GATEWAY_CURRENCY"),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(PaymentError::validation(
                "GATEWAY_TIMEOUT_SECS must be greater than zero",
                Some("GATEWAY_TIMEOUT_SECS"),
            ));
        }
        Ok(())
    }

    pub fn crypto_envelope(&self) -> PaymentResult<CryptoEnvelope> {
        CryptoEnvelope::from_config(self.secret_key.as_deref(), self.iv.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub mobile: Option<String>,
}

/// Domain-side description of a checkout; merchant settings are added by the client.
#[derive(Debug, Clone)]
pub struct CheckoutOrder {
    pub reference: String,
    pub amount_minor_units: i64,
    pub payment_method: PaymentMethod,
    pub customer: CustomerContact,
    /// Free-form correlation values, at most five are forwarded.
    pub variables: Vec<String>,
    pub description: Option<String>,
}

/// Wire payload sealed and posted to the checkout endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub merchant_code: String,
    pub amount: i64,
    pub payment_type: u8,
    pub order_reference_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable3: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable5: Option<String>,
    pub response_url: String,
    pub failure_url: String,
    pub version: String,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub success: bool,
    pub checkout_token: String,
    pub checkout_url: String,
    pub gateway_payment_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayEnvelope {
    #[serde(default)]
    status: Option<JsonValue>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    response: Option<CheckoutResponseData>,
}

impl GatewayEnvelope {
    fn is_success(&self) -> bool {
        let status_ok = match &self.status {
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::Number(n)) => matches!(n.as_i64(), Some(1) | Some(200)),
            Some(JsonValue::String(s)) => {
                matches!(s.trim().to_lowercase().as_str(), "true" | "success" | "ok")
            }
            _ => false,
        };
        status_ok || matches!(self.code, Some(1) | Some(200))
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutResponseData {
    #[serde(default, alias = "token", deserialize_with = "opt_string")]
    data: Option<String>,
    #[serde(
        default,
        rename = "checkoutUrl",
        alias = "checkout_url",
        alias = "paymentUrl",
        deserialize_with = "opt_string"
    )]
    checkout_url: Option<String>,
    #[serde(
        default,
        rename = "paymentId",
        alias = "payment_id",
        deserialize_with = "opt_string"
    )]
    payment_id: Option<String>,
}

/// Decrypted body of a callback or webhook notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayNotification {
    #[serde(
        default,
        rename = "resultCode",
        alias = "result_code",
        alias = "result",
        deserialize_with = "opt_string"
    )]
    pub result_code: Option<String>,
    #[serde(
        default,
        rename = "orderReferenceNumber",
        alias = "order_reference_number",
        alias = "reference",
        deserialize_with = "opt_string"
    )]
    pub reference: Option<String>,
    #[serde(default, deserialize_with = "opt_string")]
    pub amount: Option<String>,
    #[serde(
        default,
        rename = "transactionId",
        alias = "transaction_id",
        deserialize_with = "opt_string"
    )]
    pub transaction_id: Option<String>,
    #[serde(
        default,
        rename = "authCode",
        alias = "auth_code",
        alias = "authorizationCode",
        deserialize_with = "opt_string"
    )]
    pub authorization_code: Option<String>,
    #[serde(
        default,
        rename = "paymentId",
        alias = "payment_id",
        deserialize_with = "opt_string"
    )]
    pub payment_id: Option<String>,
    #[serde(
        default,
        rename = "knetPaymentId",
        alias = "knet_payment_id",
        deserialize_with = "opt_string"
    )]
    pub knet_payment_id: Option<String>,
    #[serde(
        default,
        rename = "knetTransactionId",
        alias = "knet_transaction_id",
        deserialize_with = "opt_string"
    )]
    pub knet_transaction_id: Option<String>,
    #[serde(
        default,
        rename = "knetRefId",
        alias = "knet_ref_id",
        deserialize_with = "opt_string"
    )]
    pub knet_reference_id: Option<String>,
    #[serde(
        default,
        rename = "cardBrand",
        alias = "card_brand",
        deserialize_with = "opt_string"
    )]
    pub card_brand: Option<String>,
    #[serde(
        default,
        rename = "maskedCard",
        alias = "masked_card",
        alias = "cardNumber",
        deserialize_with = "opt_string"
    )]
    pub masked_card_number: Option<String>,
    #[serde(
        default,
        rename = "cardExpiry",
        alias = "card_expiry",
        deserialize_with = "opt_string"
    )]
    pub card_expiry: Option<String>,
    #[serde(
        default,
        alias = "errorMessage",
        alias = "error_message",
        deserialize_with = "opt_string"
    )]
    pub message: Option<String>,
}

impl GatewayNotification {
    /// Accepts both the enveloped form (`{status, message, response: {...}}`)
    /// and a bare notification object.
    pub fn from_json(value: JsonValue) -> PaymentResult<Self> {
        let envelope_message = value
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string());
        let body = match value.get("response") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => value,
        };
        if !body.is_object() {
            return Err(PaymentError::InvalidPayload {
                message: "notification body is not a JSON object".to_string(),
            });
        }

        let mut notification: GatewayNotification =
            serde_json::from_value(body).map_err(|e| PaymentError::InvalidPayload {
                message: format!("notification has unexpected shape: {}", e),
            })?;
        if notification.message.is_none() {
            notification.message = envelope_message;
        }
        Ok(notification)
    }

    pub fn decrypt(envelope: &CryptoEnvelope, ciphertext: &str) -> PaymentResult<Self> {
        let value: JsonValue = envelope.decrypt_json(ciphertext)?;
        Self::from_json(value)
    }

    pub fn is_success(&self) -> bool {
        self.result_code
            .as_deref()
            .map(is_success_result_code)
            .unwrap_or(false)
    }

    pub fn amount_decimal(&self) -> Option<Decimal> {
        self.amount
            .as_deref()
            .and_then(|a| Decimal::from_str(a.trim()).ok())
    }
}

fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<JsonValue> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

pub struct GatewayClient {
    config: GatewayConfig,
    envelope: CryptoEnvelope,
    http: Client,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> PaymentResult<Self> {
        let envelope = config.crypto_envelope()?;
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PaymentError::GatewayUnavailable {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self {
            config,
            envelope,
            http,
        })
    }

    pub fn envelope(&self) -> &CryptoEnvelope {
        &self.envelope
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub fn checkout_url_for_token(&self, token: &str) -> String {
        format!("{}?data={}", self.endpoint("/payment"), token)
    }

    pub fn build_request(&self, order: &CheckoutOrder) -> PaymentResult<CheckoutRequest> {
        let payment_type =
            order
                .payment_method
                .gateway_code()
                .ok_or_else(|| {
                    PaymentError::validation(
                        format!("{} is not processed by the gateway", order.payment_method),
                        Some("payment_method"),
                    )
                })?;
        if order.amount_minor_units <= 0 {
            return Err(PaymentError::validation(
                "amount must be greater than zero",
                Some("amount"),
            ));
        }

        let mut variables = order.variables.iter().take(5).cloned().map(Some);
        Ok(CheckoutRequest {
            merchant_code: self.config.merchant_code.clone(),
            amount: order.amount_minor_units,
            payment_type,
            order_reference_number: order.reference.clone(),
            variable1: variables.next().flatten(),
            variable2: variables.next().flatten(),
            variable3: variables.next().flatten(),
            variable4: variables.next().flatten(),
            variable5: variables.next().flatten(),
            response_url: self.config.response_url.clone(),
            failure_url: self.config.failure_url.clone(),
            version: self.config.version.clone(),
            currency: self.config.currency.clone(),
            name: order.customer.name.clone(),
            email: order.customer.email.clone(),
            mobile_number: order.customer.mobile.clone(),
            order_description: order.description.clone(),
        })
    }

    fn parse_response_body(&self, body: &str) -> PaymentResult<GatewayEnvelope> {
        if let Ok(envelope) = serde_json::from_str::<GatewayEnvelope>(body) {
            return Ok(envelope);
        }
        // Some gateway deployments seal the response body as well.
        let plaintext = self.envelope.decrypt_to_string(body)?;
        serde_json::from_str::<GatewayEnvelope>(&plaintext).map_err(|e| {
            PaymentError::InvalidPayload {
                message: format!("invalid gateway JSON response: {}", e),
            }
        })
    }

    fn classify_status(status: StatusCode, body: &str) -> PaymentError {
        let message = format!("HTTP {}: {}", status, truncate(body, 256));
        if status == StatusCode::UNAUTHORIZED {
            PaymentError::GatewayAuthError { message }
        } else if status.is_server_error() {
            PaymentError::GatewayUnavailable { message }
        } else {
            PaymentError::GatewayRejected {
                status: status.as_u16(),
                message,
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[async_trait]
impl CheckoutGateway for GatewayClient {
    async fn checkout(&self, order: CheckoutOrder) -> PaymentResult<CheckoutResponse> {
        let request = self.build_request(&order)?;
        let sealed = self.envelope.encrypt_json(&request)?;
        let started = Instant::now();

        let response = self
            .http
            .post(self.endpoint(&self.config.checkout_path))
            .header(ACCESS_CODE_HEADER, &self.config.access_code)
            .header("Accept", "application/json")
            .json(&serde_json::json!({ "data": sealed }))
            .send()
            .await
            .map_err(|e| {
                log_external_call("payment_gateway", "checkout", elapsed_ms(started), false);
                PaymentError::GatewayUnavailable {
                    message: if e.is_timeout() {
                        format!("gateway request timed out: {}", e)
                    } else {
                        format!("gateway request failed: {}", e)
                    },
                }
            })?;

        let status = response.status();
        log_external_call(
            "payment_gateway",
            "checkout",
            elapsed_ms(started),
            status.is_success(),
        );
        let body = response
            .text()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable {
                message: format!("failed to read gateway response: {}", e),
            })?;

        if !status.is_success() {
            let err = Self::classify_status(status, &body);
            warn!(
                reference = %order.reference,
                status = status.as_u16(),
                error = %err,
                "gateway checkout request failed"
            );
            return Err(err);
        }

        let envelope = self.parse_response_body(&body)?;
        if !envelope.is_success() {
            return Err(PaymentError::GatewayRejected {
                status: status.as_u16(),
                message: envelope
                    .message
                    .unwrap_or_else(|| "gateway declined checkout".to_string()),
            });
        }

        let data = envelope.response.ok_or_else(|| PaymentError::InvalidPayload {
            message: "gateway response is missing the checkout data".to_string(),
        })?;
        let token = data.data.unwrap_or_default();
        let checkout_url = match data.checkout_url {
            Some(url) => url,
            None if !token.is_empty() => self.checkout_url_for_token(&token),
            None => {
                return Err(PaymentError::InvalidPayload {
                    message: "gateway response has neither token nor checkout URL".to_string(),
                })
            }
        };

        info!(
            reference = %order.reference,
            gateway_payment_id = ?data.payment_id,
            "gateway checkout session created"
        );

        Ok(CheckoutResponse {
            success: true,
            checkout_token: token,
            checkout_url,
            gateway_payment_id: data.payment_id,
            message: envelope.message,
        })
    }

    fn currency(&self) -> &str {
        &self.config.currency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_config() -> GatewayConfig {
        GatewayConfig {
            base_url: "https://gateway.example.com".to_string(),
            merchant_code: "842217".to_string(),
            access_code: "c333729b-d060-4b74-a49d-7686a8353481".to_string(),
            secret_key: Some("0123456789abcdef0123456789abcdef".to_string()),
            iv: Some("fedcba9876543210".to_string()),
            ..GatewayConfig::default()
        }
    }

    fn order(method: PaymentMethod) -> CheckoutOrder {
        CheckoutOrder {
            reference: "PAY-20260101000000-ABCDEF12".to_string(),
            amount_minor_units: 10_500,
            payment_method: method,
            customer: CustomerContact {
                name: Some("Noor".to_string()),
                email: Some("noor@example.com".to_string()),
                mobile: None,
            },
            variables: (1..=7).map(|i| format!("v{}", i)).collect(),
            description: Some("Order #1001".to_string()),
        }
    }

    #[test]
    fn result_codes_are_matched_case_insensitively() {
        assert!(is_success_result_code("CAPTURED"));
        assert!(is_success_result_code("  captured "));
        assert!(is_success_result_code("Approved"));
        assert!(!is_success_result_code("NOT CAPTURED"));
        assert!(!is_success_result_code("CANCELED"));
    }

    #[test]
    fn build_request_fills_merchant_fields_and_caps_variables() {
        let client = GatewayClient::new(test_config()).expect("client should build");
        let request = client
            .build_request(&order(PaymentMethod::Visa))
            .expect("request should build");
        assert_eq!(request.merchant_code, "842217");
        assert_eq!(request.amount, 10_500);
        assert_eq!(request.payment_type, 2);
        assert_eq!(request.variable1.as_deref(), Some("v1"));
        assert_eq!(request.variable5.as_deref(), Some("v5"));
        assert_eq!(request.currency, "KWD");

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["orderReferenceNumber"], "PAY-20260101000000-ABCDEF12");
        assert!(json.get("mobileNumber").is_none());
    }

    #[test]
    fn cash_on_delivery_never_builds_a_gateway_request() {
        let client = GatewayClient::new(test_config()).expect("client should build");
        assert!(matches!(
            client.build_request(&order(PaymentMethod::CashOnDelivery)),
            Err(PaymentError::ValidationError { .. })
        ));
    }

    #[test]
    fn client_refuses_missing_key_material() {
        let mut config = test_config();
        config.iv = None;
        assert!(matches!(
            GatewayClient::new(config),
            Err(PaymentError::CryptoConfigurationError { .. })
        ));
    }

    #[test]
    fn fallback_checkout_url_uses_token() {
        let client = GatewayClient::new(test_config()).expect("client should build");
        assert_eq!(
            client.checkout_url_for_token("abc"),
            "https://gateway.example.com/payment?data=abc"
        );
    }

    #[test]
    fn notification_parses_enveloped_and_bare_forms() {
        let enveloped = serde_json::json!({
            "status": true,
            "message": "Transaction Success",
            "response": {
                "resultCode": "CAPTURED",
                "amount": 10.5,
                "paymentId": 100202312345u64,
                "orderReferenceNumber": "PAY-1",
                "transactionId": "TX-9",
                "authCode": "A123"
            }
        });
        let parsed = GatewayNotification::from_json(enveloped).unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed.reference.as_deref(), Some("PAY-1"));
        assert_eq!(parsed.payment_id.as_deref(), Some("100202312345"));
        assert_eq!(parsed.amount_decimal(), Some(Decimal::new(105, 1)));
        assert_eq!(parsed.message.as_deref(), Some("Transaction Success"));

        let bare = serde_json::json!({"result_code": "NOT CAPTURED", "reference": "PAY-2"});
        let parsed = GatewayNotification::from_json(bare).unwrap();
        assert!(!parsed.is_success());
        assert_eq!(parsed.reference.as_deref(), Some("PAY-2"));

        assert!(GatewayNotification::from_json(serde_json::json!("oops")).is_err());
    }
}
