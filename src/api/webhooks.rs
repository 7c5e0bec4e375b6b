use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::payments::gateway::ACCESS_CODE_HEADER;
use crate::services::webhook_processor::{
    WebhookProcessor, WebhookProcessorError, SIGNATURE_HEADER,
};

#[derive(Clone)]
pub struct WebhookState {
    pub processor: Arc<WebhookProcessor>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /api/payments/webhook
///
/// Only authentication failures are refused. Everything else is acknowledged
/// so the gateway does not keep redelivering.
pub async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    info!(bytes = body.len(), "Received gateway webhook");

    match state
        .processor
        .handle(
            header(&headers, ACCESS_CODE_HEADER),
            header(&headers, SIGNATURE_HEADER),
            &body,
        )
        .await
    {
        Err(WebhookProcessorError::InvalidSignature) => {
            warn!("Webhook authentication failed");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"status": "unauthorized"})),
            )
                .into_response()
        }
        Ok(_) | Err(_) => {
            (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
        }
    }
}
