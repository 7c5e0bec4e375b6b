//! Payment endpoints: initiation, payment orders, the gateway redirect
//! callback, status, cancellation and refunds.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::error::PaymentError;
use crate::payments::types::{
    CallbackOutcome, PaymentInitiationResponse, PaymentOrder, PaymentStatusResponse,
};
use crate::services::payment_orchestrator::{
    PaymentInitiationRequest, PaymentOrchestrator, PaymentOrderPaymentRequest,
    PaymentOrderRequest, RefundRequest,
};

#[derive(Clone)]
pub struct PaymentsState {
    pub orchestrator: Arc<PaymentOrchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub data: Option<String>,
}

fn api_error(headers: &HeaderMap, err: PaymentError) -> AppError {
    let error = AppError::from(err);
    match get_request_id_from_headers(headers) {
        Some(request_id) => error.with_request_id(request_id),
        None => error,
    }
}

/// POST /api/payments/initiate
pub async fn initiate_payment(
    State(state): State<PaymentsState>,
    headers: HeaderMap,
    Json(request): Json<PaymentInitiationRequest>,
) -> AppResult<Json<PaymentInitiationResponse>> {
    info!(
        order_id = %request.order_id,
        method = %request.payment_method,
        "Payment initiation requested"
    );
    state
        .orchestrator
        .initiate_payment(request)
        .await
        .map(Json)
        .map_err(|e| api_error(&headers, e))
}

/// POST /api/payment-orders
pub async fn create_payment_order(
    State(state): State<PaymentsState>,
    headers: HeaderMap,
    Json(request): Json<PaymentOrderRequest>,
) -> AppResult<(StatusCode, Json<PaymentOrder>)> {
    let payment_order = state
        .orchestrator
        .create_payment_order(request)
        .await
        .map_err(|e| api_error(&headers, e))?;
    Ok((StatusCode::CREATED, Json(payment_order)))
}

/// POST /api/payment-orders/{reference}/pay
pub async fn pay_payment_order(
    State(state): State<PaymentsState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PaymentOrderPaymentRequest>,
) -> AppResult<Json<PaymentInitiationResponse>> {
    state
        .orchestrator
        .initiate_payment_order_payment(&reference, request)
        .await
        .map(Json)
        .map_err(|e| api_error(&headers, e))
}

/// GET /api/payments/callback?data=...
pub async fn payment_callback(
    State(state): State<PaymentsState>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> AppResult<Json<CallbackOutcome>> {
    let data = query
        .data
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| {
            api_error(
                &headers,
                PaymentError::validation("data parameter is required", Some("data")),
            )
        })?;

    match state.orchestrator.process_callback(&data).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            warn!(error = %e, "Payment callback could not be processed");
            Err(api_error(&headers, e))
        }
    }
}

/// GET /api/payments/{reference}
pub async fn payment_status(
    State(state): State<PaymentsState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<PaymentStatusResponse>> {
    state
        .orchestrator
        .check_payment_status(&reference)
        .await
        .map(Json)
        .map_err(|e| api_error(&headers, e))
}

/// POST /api/payments/{reference}/cancel
pub async fn cancel_payment(
    State(state): State<PaymentsState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<PaymentStatusResponse>> {
    state
        .orchestrator
        .cancel_payment(&reference)
        .await
        .map(Json)
        .map_err(|e| api_error(&headers, e))
}

/// POST /api/payments/{reference}/refund
pub async fn refund_payment(
    State(state): State<PaymentsState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
    request: Option<Json<RefundRequest>>,
) -> AppResult<Json<PaymentStatusResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    state
        .orchestrator
        .initiate_refund(&reference, request)
        .await
        .map(Json)
        .map_err(|e| api_error(&headers, e))
}
