pub mod payments;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::health::{health_handler, HealthChecker};
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::payment_orchestrator::PaymentOrchestrator;
use crate::services::webhook_processor::WebhookProcessor;

use self::payments::PaymentsState;
use self::webhooks::WebhookState;

/// Full HTTP surface with request-id and request logging layers.
pub fn router(
    orchestrator: Arc<PaymentOrchestrator>,
    webhook_processor: Arc<WebhookProcessor>,
    health_checker: Arc<HealthChecker>,
) -> Router {
    let payment_routes = Router::new()
        .route("/api/payments/initiate", post(payments::initiate_payment))
        .route("/api/payments/callback", get(payments::payment_callback))
        .route("/api/payments/{reference}", get(payments::payment_status))
        .route(
            "/api/payments/{reference}/cancel",
            post(payments::cancel_payment),
        )
        .route(
            "/api/payments/{reference}/refund",
            post(payments::refund_payment),
        )
        .route("/api/payment-orders", post(payments::create_payment_order))
        .route(
            "/api/payment-orders/{reference}/pay",
            post(payments::pay_payment_order),
        )
        .with_state(PaymentsState { orchestrator });

    let webhook_routes = Router::new()
        .route("/api/payments/webhook", post(webhooks::handle_webhook))
        .with_state(WebhookState {
            processor: webhook_processor,
        });

    let health_routes = Router::new()
        .route("/health", get(health_handler))
        .with_state(health_checker);

    Router::new()
        .merge(payment_routes)
        .merge(webhook_routes)
        .merge(health_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
