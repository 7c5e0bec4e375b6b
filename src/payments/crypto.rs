//! Symmetric envelope for payloads exchanged with the hosted gateway.
//!
//! AES-256-CBC with PKCS#7 padding, base64 on the wire. Key and IV come from
//! configuration and are checked when the envelope is built, so a bad key is
//! reported as a configuration problem instead of a cipher failure.

use crate::payments::error::{PaymentError, PaymentResult};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::de::DeserializeOwned;
use serde::Serialize;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 16;
const BLOCK_SIZE: usize = 16;

#[derive(Clone)]
pub struct CryptoEnvelope {
    key: [u8; KEY_LENGTH],
    iv: [u8; IV_LENGTH],
}

impl std::fmt::Debug for CryptoEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEnvelope")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

impl CryptoEnvelope {
    pub fn new(key: &[u8], iv: &[u8]) -> PaymentResult<Self> {
        if key.is_empty() {
            return Err(PaymentError::CryptoConfigurationError {
                message: "encryption key is missing".to_string(),
            });
        }
        if iv.is_empty() {
            return Err(PaymentError::CryptoConfigurationError {
                message: "initialization vector is missing".to_string(),
            });
        }
        let key: [u8; KEY_LENGTH] =
            key.try_into()
                .map_err(|_| PaymentError::CryptoConfigurationError {
                    message: format!(
                        "encryption key must be {} bytes, got {}",
                        KEY_LENGTH,
                        key.len()
                    ),
                })?;
        let iv: [u8; IV_LENGTH] =
            iv.try_into()
                .map_err(|_| PaymentError::CryptoConfigurationError {
                    message: format!(
                        "initialization vector must be {} bytes, got {}",
                        IV_LENGTH,
                        iv.len()
                    ),
                })?;
        Ok(Self { key, iv })
    }

    /// Build from optional configuration values; absence is a configuration error.
    pub fn from_config(key: Option<&str>, iv: Option<&str>) -> PaymentResult<Self> {
        let key = key
            .filter(|k| !k.is_empty())
            .ok_or(PaymentError::CryptoConfigurationError {
                message: "GATEWAY_SECRET_KEY is not configured".to_string(),
            })?;
        let iv = iv
            .filter(|v| !v.is_empty())
            .ok_or(PaymentError::CryptoConfigurationError {
                message: "GATEWAY_IV is not configured".to_string(),
            })?;
        Self::new(key.as_bytes(), iv.as_bytes())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> PaymentResult<String> {
        let mut buffer = vec![0u8; plaintext.len() + BLOCK_SIZE];
        buffer[..plaintext.len()].copy_from_slice(plaintext);

        let ciphertext = Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| PaymentError::CryptoConfigurationError {
                message: format!("cipher initialisation failed: {}", e),
            })?
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .map_err(|_| PaymentError::InvalidPayload {
                message: "payload encryption failed".to_string(),
            })?;

        Ok(STANDARD.encode(ciphertext))
    }

    pub fn decrypt(&self, ciphertext: &str) -> PaymentResult<Vec<u8>> {
        // Query-string decoding turns an unescaped '+' into a space.
        let normalized: String = ciphertext
            .trim()
            .chars()
            .map(|c| if c == ' ' { '+' } else { c })
            .collect();

        let mut buffer =
            STANDARD
                .decode(normalized.as_bytes())
                .map_err(|e| PaymentError::InvalidPayload {
                    message: format!("payload is not valid base64: {}", e),
                })?;
        if buffer.is_empty() || buffer.len() % BLOCK_SIZE != 0 {
            return Err(PaymentError::InvalidPayload {
                message: format!("ciphertext length {} is not block aligned", buffer.len()),
            });
        }

        let plaintext = Aes256CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| PaymentError::CryptoConfigurationError {
                message: format!("cipher initialisation failed: {}", e),
            })?
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|_| PaymentError::InvalidPayload {
                message: "payload padding is invalid".to_string(),
            })?;

        Ok(plaintext.to_vec())
    }

    pub fn decrypt_to_string(&self, ciphertext: &str) -> PaymentResult<String> {
        String::from_utf8(self.decrypt(ciphertext)?).map_err(|_| PaymentError::InvalidPayload {
            message: "decrypted payload is not valid UTF-8".to_string(),
        })
    }

    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> PaymentResult<String> {
        let json = serde_json::to_vec(value).map_err(|e| PaymentError::InvalidPayload {
            message: format!("payload serialization failed: {}", e),
        })?;
        self.encrypt(&json)
    }

    pub fn decrypt_json<T: DeserializeOwned>(&self, ciphertext: &str) -> PaymentResult<T> {
        let plaintext = self.decrypt_to_string(ciphertext)?;
        serde_json::from_str(&plaintext).map_err(|e| PaymentError::InvalidPayload {
            message: format!("decrypted payload is not valid JSON: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";
    const IV: &str = "fedcba9876543210";

    fn envelope() -> CryptoEnvelope {
        CryptoEnvelope::new(KEY.as_bytes(), IV.as_bytes()).expect("valid key material")
    }

    #[test]
    fn round_trips_utf8_payloads() {
        let envelope = envelope();
        for text in ["", "a", "exactly sixteen!", "{\"amount\":10500}", "دينار كويتي ✓"] {
            let ciphertext = envelope.encrypt(text.as_bytes()).unwrap();
            assert_eq!(envelope.decrypt_to_string(&ciphertext).unwrap(), text);
        }
    }

    #[test]
    fn rejects_missing_or_short_key_material() {
        assert!(matches!(
            CryptoEnvelope::from_config(None, Some(IV)),
            Err(PaymentError::CryptoConfigurationError { .. })
        ));
        assert!(matches!(
            CryptoEnvelope::from_config(Some(KEY), Some("")),
            Err(PaymentError::CryptoConfigurationError { .. })
        ));
        assert!(matches!(
            CryptoEnvelope::new(b"short", IV.as_bytes()),
            Err(PaymentError::CryptoConfigurationError { .. })
        ));
        assert!(matches!(
            CryptoEnvelope::new(KEY.as_bytes(), b"0123456789abcdef0"),
            Err(PaymentError::CryptoConfigurationError { .. })
        ));
    }

    #[test]
    fn tampered_ciphertext_is_not_accepted_as_json() {
        let envelope = envelope();
        let ciphertext = envelope
            .encrypt_json(&serde_json::json!({"resultCode": "CAPTURED", "amount": 10.5}))
            .unwrap();
        let mut raw = STANDARD.decode(&ciphertext).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x5a;
        let tampered = STANDARD.encode(&raw);

        let result = envelope.decrypt_json::<serde_json::Value>(&tampered);
        assert!(matches!(result, Err(PaymentError::InvalidPayload { .. })));
    }

    #[test]
    fn rejects_garbage_input() {
        let envelope = envelope();
        assert!(envelope.decrypt("not base64 !!").is_err());
        assert!(envelope.decrypt(&STANDARD.encode(b"short")).is_err());
    }

    #[test]
    fn spaces_from_query_decoding_are_restored() {
        let envelope = envelope();
        let mut found = None;
        for i in 0..64 {
            let text = format!("payload-{}", i);
            let ciphertext = envelope.encrypt(text.as_bytes()).unwrap();
            if ciphertext.contains('+') {
                found = Some((text, ciphertext));
                break;
            }
        }
        if let Some((text, ciphertext)) = found {
            let mangled = ciphertext.replace('+', " ");
            assert_eq!(envelope.decrypt_to_string(&mangled).unwrap(), text);
        }
    }

    #[test]
    fn debug_output_redacts_key() {
        let rendered = format!("{:?}", envelope());
        assert!(!rendered.contains(KEY));
    }
}
