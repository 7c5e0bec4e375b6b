use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::payments::types::CallbackOutcome;
use crate::payments::utils::{secure_eq, verify_hmac_sha256_hex};
use crate::services::payment_orchestrator::PaymentOrchestrator;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid webhook body: {0}")]
    InvalidBody(String),
    #[error("Processing error: {0}")]
    ProcessingError(String),
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    data: Option<String>,
}

/// Authenticates gateway webhooks and hands the encrypted payload to the
/// orchestrator. Processing failures are reported to the caller so they can
/// be logged, never to the gateway.
pub struct WebhookProcessor {
    orchestrator: Arc<PaymentOrchestrator>,
    access_code: String,
    signing_secret: Option<String>,
}

impl WebhookProcessor {
    pub fn new(
        orchestrator: Arc<PaymentOrchestrator>,
        access_code: impl Into<String>,
        signing_secret: Option<String>,
    ) -> Self {
        Self {
            orchestrator,
            access_code: access_code.into(),
            signing_secret: signing_secret.filter(|s| !s.trim().is_empty()),
        }
    }

    /// Access code must match; the HMAC signature is only required when a
    /// signing secret is configured.
    pub fn authenticate(
        &self,
        access_code: Option<&str>,
        signature: Option<&str>,
        raw_body: &[u8],
    ) -> Result<(), WebhookProcessorError> {
        let provided = access_code.ok_or_else(|| {
            warn!("Webhook rejected: missing access code");
            WebhookProcessorError::InvalidSignature
        })?;
        if self.access_code.is_empty()
            || !secure_eq(provided.trim().as_bytes(), self.access_code.as_bytes())
        {
            warn!("Webhook rejected: access code mismatch");
            return Err(WebhookProcessorError::InvalidSignature);
        }

        if let Some(secret) = &self.signing_secret {
            let signature = signature.ok_or_else(|| {
                warn!("Webhook rejected: missing signature");
                WebhookProcessorError::InvalidSignature
            })?;
            if !verify_hmac_sha256_hex(raw_body, secret, signature) {
                error!("Invalid webhook signature");
                return Err(WebhookProcessorError::InvalidSignature);
            }
        }

        Ok(())
    }

    pub async fn process(&self, raw_body: &[u8]) -> Result<CallbackOutcome, WebhookProcessorError> {
        let body: WebhookBody = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookProcessorError::InvalidBody(e.to_string()))?;
        let data = body
            .data
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| WebhookProcessorError::InvalidBody("missing data field".to_string()))?;

        match self.orchestrator.process_webhook(&data).await {
            Ok(outcome) => {
                info!(
                    payment_reference = %outcome.payment_reference,
                    status = %outcome.status,
                    "Webhook processed successfully"
                );
                Ok(outcome)
            }
            Err(e) => Err(WebhookProcessorError::ProcessingError(e.to_string())),
        }
    }

    /// Authenticate, then process. Any processing failure is logged here with
    /// whatever reference can be recovered from the body.
    pub async fn handle(
        &self,
        access_code: Option<&str>,
        signature: Option<&str>,
        raw_body: &[u8],
    ) -> Result<Option<CallbackOutcome>, WebhookProcessorError> {
        self.authenticate(access_code, signature, raw_body)?;

        match self.process(raw_body).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                error!(
                    reference = %body_reference(raw_body).unwrap_or_else(|| "unknown".to_string()),
                    error = %e,
                    "Webhook processing failed, acknowledged for manual reconciliation"
                );
                Ok(None)
            }
        }
    }
}

/// Plain-text reference some gateways send next to the encrypted payload.
fn body_reference(raw_body: &[u8]) -> Option<String> {
    let value: JsonValue = serde_json::from_slice(raw_body).ok()?;
    ["trackId", "orderReferenceNumber", "reference"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()).map(str::to_string))
}
