use crate::payments::error::PaymentResult;
use crate::payments::gateway::{CheckoutOrder, CheckoutResponse};
use async_trait::async_trait;

/// Seam between the orchestrator and the hosted payment gateway.
#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    /// Open a hosted checkout session for one payment.
    async fn checkout(&self, order: CheckoutOrder) -> PaymentResult<CheckoutResponse>;

    /// Currency the merchant account settles in.
    fn currency(&self) -> &str;
}
