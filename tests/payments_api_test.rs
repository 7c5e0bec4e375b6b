mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::{success_notification, Harness};
use rust_decimal_macros::dec;
use serde_json::{json, Value as JsonValue};
use tower::ServiceExt;

async fn send(h: &Harness, request: Request<Body>) -> (StatusCode, JsonValue) {
    let response = h.app(false).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str, body: Option<JsonValue>) -> Request<Body> {
    let builder = Request::builder().method("POST").uri(uri);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn initiate_then_query_status() {
    let h = Harness::new();
    h.add_payer().await;
    let order_id = h.add_order("ORD-8001", dec!(10.500)).await;

    let (status, body) = send(
        &h,
        post(
            "/api/payments/initiate",
            Some(json!({
                "order_id": order_id,
                "payer_id": h.payer_id,
                "payment_method": "visa"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "PROCESSING");
    assert_eq!(body["amount_minor_units"], 10_500);
    let reference = body["payment_reference"].as_str().unwrap().to_string();

    let (status, body) = send(&h, get(&format!("/api/payments/{}", reference))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["payment_reference"], reference.as_str());
    assert_eq!(body["status"], "PROCESSING");
}

#[tokio::test]
async fn unknown_payment_is_not_found() {
    let h = Harness::new();
    let request = Request::builder()
        .method("GET")
        .uri("/api/payments/PAY-MISSING")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "PAYMENT_NOT_FOUND");
    assert_eq!(body["request_id"], "req-123");
}

#[tokio::test]
async fn callback_redirect_settles_payment() {
    let h = Harness::new();
    let order_id = h.add_order("ORD-8002", dec!(6)).await;
    let reference = h
        .orchestrator
        .initiate_payment(storefront_payments::services::PaymentInitiationRequest {
            order_id,
            payer_id: h.payer_id,
            payment_method: storefront_payments::payments::PaymentMethod::Knet,
        })
        .await
        .unwrap()
        .payment_reference;

    let data = success_notification(&reference, "6.000");
    let uri = format!(
        "/api/payments/callback?data={}",
        data.replace('+', "%2B").replace('/', "%2F").replace('=', "%3D")
    );
    let (status, body) = send(&h, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["success"], true);

    let (status, body) = send(&h, get("/api/payments/callback")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");

    let (status, body) = send(&h, get("/api/payments/callback?data=tampered")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn cancel_and_refund_over_http() {
    let h = Harness::new();
    let order_id = h.add_order("ORD-8003", dec!(9)).await;
    let reference = h
        .orchestrator
        .initiate_payment(storefront_payments::services::PaymentInitiationRequest {
            order_id,
            payer_id: h.payer_id,
            payment_method: storefront_payments::payments::PaymentMethod::Visa,
        })
        .await
        .unwrap()
        .payment_reference;
    h.orchestrator
        .process_callback(&success_notification(&reference, "9.000"))
        .await
        .unwrap();

    let (status, body) = send(&h, post(&format!("/api/payments/{}/cancel", reference), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "STATE_CONFLICT");

    let (status, body) = send(&h, post(&format!("/api/payments/{}/refund", reference), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "REFUNDED");

    let (status, _) = send(
        &h,
        post(
            &format!("/api/payments/{}/refund", reference),
            Some(json!({ "amount": "1.000" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn payment_order_over_http() {
    let h = Harness::new();
    let a = h.add_order("ORD-8101", dec!(1.250)).await;
    let b = h.add_order("ORD-8102", dec!(2.750)).await;

    let (status, body) = send(
        &h,
        post(
            "/api/payment-orders",
            Some(json!({ "order_ids": [a, b], "payer_id": h.payer_id })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "PENDING");
    let reference = body["reference"].as_str().unwrap().to_string();

    let (status, body) = send(
        &h,
        post(
            &format!("/api/payment-orders/{}/pay", reference),
            Some(json!({ "payer_id": h.payer_id, "payment_method": "knet" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PROCESSING");
    assert_eq!(body["amount_minor_units"], 4_000);
}

#[tokio::test]
async fn health_reports_degraded_without_database() {
    let h = Harness::new();
    let (status, body) = send(&h, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
}
