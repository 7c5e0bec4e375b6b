//! Hosted-gateway payments: wire types, the AES envelope, the HTTP client
//! and the money helpers shared by the orchestrator.

pub mod crypto;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod types;
pub mod utils;

pub use crypto::CryptoEnvelope;
pub use error::{PaymentError, PaymentResult};
pub use gateway::{
    CheckoutOrder, CheckoutResponse, CustomerContact, GatewayClient, GatewayConfig,
    GatewayNotification,
};
pub use provider::CheckoutGateway;
pub use types::{
    CallbackOutcome, ExpirySweepReport, OrderStatus, Payment, PaymentInitiationResponse,
    PaymentMethod, PaymentOrder, PaymentStatus, PaymentStatusResponse,
};
