mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::{failure_notification, success_notification, Harness, Sent, ACCESS_CODE, WEBHOOK_SECRET};
use rust_decimal_macros::dec;
use serde_json::{json, Value as JsonValue};
use storefront_payments::database::PaymentStore;
use storefront_payments::payments::utils::sign_hmac_sha256_hex;
use storefront_payments::payments::{PaymentMethod, PaymentStatus};
use storefront_payments::services::{PaymentInitiationRequest, WebhookProcessorError};
use tower::ServiceExt;

fn webhook_request(access_code: Option<&str>, signature: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/payments/webhook")
        .header("content-type", "application/json");
    if let Some(code) = access_code {
        builder = builder.header("accessCode", code);
    }
    if let Some(signature) = signature {
        builder = builder.header("x-gateway-signature", signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: axum::response::Response) -> JsonValue {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn processing_payment(h: &Harness) -> String {
    h.add_payer().await;
    let order_id = h.add_order("ORD-9001", dec!(12.750)).await;
    h.orchestrator
        .initiate_payment(PaymentInitiationRequest {
            order_id,
            payer_id: h.payer_id,
            payment_method: PaymentMethod::Knet,
        })
        .await
        .unwrap()
        .payment_reference
}

#[tokio::test]
async fn valid_webhook_completes_payment() {
    let h = Harness::new();
    let reference = processing_payment(&h).await;
    let body = json!({ "data": success_notification(&reference, "12.750") }).to_string();

    let response = h
        .app(false)
        .oneshot(webhook_request(Some(ACCESS_CODE), None, &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
    let payment = h.payments.find_by_reference(&reference).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert!(payment.webhook_received);
}

#[tokio::test]
async fn wrong_access_code_is_unauthorized() {
    let h = Harness::new();
    let reference = processing_payment(&h).await;
    let body = json!({ "data": success_notification(&reference, "12.750") }).to_string();

    for access_code in [None, Some("not-the-code")] {
        let response = h
            .app(false)
            .oneshot(webhook_request(access_code, None, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["status"], "unauthorized");
    }

    let payment = h.payments.find_by_reference(&reference).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Processing);
    assert!(!payment.webhook_received);
}

#[tokio::test]
async fn signature_is_checked_when_secret_configured() {
    let h = Harness::new();
    let reference = processing_payment(&h).await;
    let body = json!({ "data": success_notification(&reference, "12.750") }).to_string();

    let unsigned = h
        .app(true)
        .oneshot(webhook_request(Some(ACCESS_CODE), None, &body))
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let forged = h
        .app(true)
        .oneshot(webhook_request(Some(ACCESS_CODE), Some("deadbeef"), &body))
        .await
        .unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

    let signature = sign_hmac_sha256_hex(body.as_bytes(), WEBHOOK_SECRET).unwrap();
    let signed = h
        .app(true)
        .oneshot(webhook_request(Some(ACCESS_CODE), Some(&signature), &body))
        .await
        .unwrap();
    assert_eq!(signed.status(), StatusCode::OK);
    assert_eq!(
        h.payments.find_by_reference(&reference).await.unwrap().unwrap().status,
        PaymentStatus::Completed
    );
}

#[tokio::test]
async fn processing_failures_are_still_acknowledged() {
    let h = Harness::new();
    let bodies = [
        "not json".to_string(),
        json!({}).to_string(),
        json!({ "data": "garbage" }).to_string(),
        json!({ "data": success_notification("PAY-UNKNOWN", "1.000"), "trackId": "PAY-UNKNOWN" })
            .to_string(),
    ];

    for body in bodies {
        let response = h
            .app(false)
            .oneshot(webhook_request(Some(ACCESS_CODE), None, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "body {} should be acknowledged", body);
    }
}

#[tokio::test]
async fn duplicate_delivery_is_a_no_op() {
    let h = Harness::new();
    let reference = processing_payment(&h).await;
    let body = json!({ "data": success_notification(&reference, "12.750") }).to_string();

    for _ in 0..3 {
        let response = h
            .app(false)
            .oneshot(webhook_request(Some(ACCESS_CODE), None, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let payment_confirmations = h
        .notifier
        .sent()
        .into_iter()
        .filter(|s| matches!(s, Sent::Payment(..)))
        .count();
    assert_eq!(payment_confirmations, 1);
}

#[tokio::test]
async fn late_failure_webhook_does_not_override_completion() {
    let h = Harness::new();
    let reference = processing_payment(&h).await;
    h.orchestrator
        .process_callback(&success_notification(&reference, "12.750"))
        .await
        .unwrap();

    let body = json!({ "data": failure_notification(&reference) }).to_string();
    let response = h
        .app(false)
        .oneshot(webhook_request(Some(ACCESS_CODE), None, &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let payment = h.payments.find_by_reference(&reference).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert!(payment.webhook_received_at.is_some());
}

#[test]
fn webhook_error_display() {
    assert_eq!(WebhookProcessorError::InvalidSignature.to_string(), "Invalid signature");
    assert_eq!(
        WebhookProcessorError::InvalidBody("missing data field".to_string()).to_string(),
        "Invalid webhook body: missing data field"
    );
}
