use crate::payments::error::{PaymentError, PaymentResult};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

/// The gateway settles in a three-decimal currency.
pub const MINOR_UNITS_PER_MAJOR: i64 = 1000;
pub const CURRENCY_SCALE: u32 = 3;

/// Decimal amount to integer minor units, rounding half-up.
pub fn to_minor_units(amount: Decimal) -> PaymentResult<i64> {
    amount
        .checked_mul(Decimal::from(MINOR_UNITS_PER_MAJOR))
        .map(|scaled| scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|rounded| rounded.to_i64())
        .ok_or_else(|| {
            PaymentError::validation(
                format!("amount {} cannot be represented in minor units", amount),
                Some("amount"),
            )
        })
}

pub fn from_minor_units(minor_units: i64) -> Decimal {
    Decimal::new(minor_units, CURRENCY_SCALE)
}

/// Amount normalised to the currency scale, e.g. `10.5` -> `10.500`.
pub fn normalize_amount(amount: Decimal) -> Decimal {
    let mut rounded =
        amount.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(CURRENCY_SCALE);
    rounded
}

pub fn format_amount(amount: Decimal, currency: &str) -> String {
    format!("{} {}", normalize_amount(amount), currency)
}

/// Time-ordered reference with a random suffix, e.g. `PAY-20260101120000-3F9A1C2B`.
pub fn generate_reference(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!(
        "{}-{}-{}",
        prefix,
        Utc::now().format("%Y%m%d%H%M%S"),
        suffix
    )
}

pub fn sign_hmac_sha256_hex(payload: &[u8], secret: &str) -> Option<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    match sign_hmac_sha256_hex(payload, secret) {
        Some(computed) => secure_eq(
            computed.as_bytes(),
            signature.trim().to_lowercase().as_bytes(),
        ),
        None => false,
    }
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
