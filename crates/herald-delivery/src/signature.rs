//! Webhook authenticity checks.
//!
//! Each provider signs callbacks with its own construction:
//!
//! * `hmac_timestamped`: `v1,<base64(HMAC-SHA256(secret, id.timestamp.body))>`,
//!   rejected outside a freshness window.
//! * `hmac_url_body`: `base64(HMAC-SHA256(secret, url || body))`.
//! * `ed25519`: `base64(signature)` over `timestamp || body`, same window.
//!
//! HMAC schemes try the current secret, then the previous one while a
//! rotation is in progress. Comparisons are constant-time.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use herald_core::{constant_time_eq, Timestamp};

use crate::error::{DeliveryError, DeliveryResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed clock skew for timestamped schemes (5 minutes).
pub const TIMESTAMP_TOLERANCE_SECONDS: u64 = 300;

const SIGNATURE_PREFIX: &str = "v1,";

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WebhookSecret(Zeroizing<Vec<u8>>);

impl WebhookSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> DeliveryResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(DeliveryError::Configuration);
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(..)")
    }
}

/// Parse an Ed25519 public key given as hex or base64.
pub fn parse_public_key(value: &str) -> DeliveryResult<VerifyingKey> {
    let value = value.trim();
    let bytes = hex::decode(value)
        .ok()
        .filter(|b| b.len() == 32)
        .or_else(|| STANDARD.decode(value).ok())
        .ok_or(DeliveryError::Configuration)?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| DeliveryError::Configuration)?;
    VerifyingKey::from_bytes(&array).map_err(|_| DeliveryError::Configuration)
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Signature-related request headers, already extracted by the receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub id: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerdict {
    Valid,
    Invalid(&'static str),
}

impl SignatureVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureVerdict::Valid)
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            SignatureVerdict::Valid => None,
            SignatureVerdict::Invalid(reason) => Some((*reason).to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WebhookVerifier {
    HmacTimestamped {
        current: WebhookSecret,
        previous: Option<WebhookSecret>,
    },
    HmacUrlBody {
        url: String,
        current: WebhookSecret,
        previous: Option<WebhookSecret>,
    },
    Ed25519 {
        current: VerifyingKey,
        previous: Option<VerifyingKey>,
    },
}

impl WebhookVerifier {
    pub fn scheme(&self) -> &'static str {
        match self {
            WebhookVerifier::HmacTimestamped { .. } => "hmac_timestamped",
            WebhookVerifier::HmacUrlBody { .. } => "hmac_url_body",
            WebhookVerifier::Ed25519 { .. } => "ed25519",
        }
    }

    pub fn verify(
        &self,
        headers: &SignatureHeaders,
        body: &[u8],
        now: Timestamp,
    ) -> SignatureVerdict {
        let Some(signature) = headers.signature.as_deref() else {
            return SignatureVerdict::Invalid("signature header missing");
        };
        match self {
            WebhookVerifier::HmacTimestamped { current, previous } => {
                let (Some(id), Some(ts)) = (headers.id.as_deref(), headers.timestamp.as_deref())
                else {
                    return SignatureVerdict::Invalid("id or timestamp header missing");
                };
                if !is_fresh(ts, now) {
                    return SignatureVerdict::Invalid("timestamp outside tolerance");
                }
                let candidates: Vec<Vec<u8>> = signature
                    .split_whitespace()
                    .filter_map(|s| s.strip_prefix(SIGNATURE_PREFIX))
                    .filter_map(|s| STANDARD.decode(s).ok())
                    .collect();
                if candidates.is_empty() {
                    return SignatureVerdict::Invalid("signature header malformed");
                }
                let matches = |secret: &WebhookSecret| {
                    timestamped_mac(secret.key_bytes(), id, ts, body)
                        .map(|expected| candidates.iter().any(|c| constant_time_eq(&expected, c)))
                        .unwrap_or(false)
                };
                if matches(current) || previous.as_ref().is_some_and(|p| matches(p)) {
                    SignatureVerdict::Valid
                } else {
                    SignatureVerdict::Invalid("signature mismatch")
                }
            }
            WebhookVerifier::HmacUrlBody {
                url,
                current,
                previous,
            } => {
                let Ok(given) = STANDARD.decode(signature.trim()) else {
                    return SignatureVerdict::Invalid("signature header malformed");
                };
                let matches = |secret: &WebhookSecret| {
                    url_body_mac(secret.key_bytes(), url, body)
                        .map(|expected| constant_time_eq(&expected, &given))
                        .unwrap_or(false)
                };
                if matches(current) || previous.as_ref().is_some_and(|p| matches(p)) {
                    SignatureVerdict::Valid
                } else {
                    SignatureVerdict::Invalid("signature mismatch")
                }
            }
            WebhookVerifier::Ed25519 { current, previous } => {
                let Some(ts) = headers.timestamp.as_deref() else {
                    return SignatureVerdict::Invalid("timestamp header missing");
                };
                if !is_fresh(ts, now) {
                    return SignatureVerdict::Invalid("timestamp outside tolerance");
                }
                let Some(sig) = STANDARD
                    .decode(signature.trim())
                    .ok()
                    .and_then(|b| <[u8; 64]>::try_from(b).ok())
                    .map(|b| Signature::from_bytes(&b))
                else {
                    return SignatureVerdict::Invalid("signature header malformed");
                };
                let message = [ts.as_bytes(), body].concat();
                let matches = |key: &VerifyingKey| key.verify(&message, &sig).is_ok();
                if matches(current) || previous.as_ref().is_some_and(|p| matches(p)) {
                    SignatureVerdict::Valid
                } else {
                    SignatureVerdict::Invalid("signature mismatch")
                }
            }
        }
    }
}

fn is_fresh(timestamp: &str, now: Timestamp) -> bool {
    let parsed = timestamp
        .trim()
        .parse::<u64>()
        .ok()
        .map(Timestamp::from_seconds)
        .or_else(|| Timestamp::parse_rfc3339(timestamp));
    match parsed {
        Some(ts) => {
            now.seconds_since(&ts) <= TIMESTAMP_TOLERANCE_SECONDS
                && ts.seconds_since(&now) <= TIMESTAMP_TOLERANCE_SECONDS
        }
        None => false,
    }
}

fn timestamped_mac(key: &[u8], id: &str, timestamp: &str, body: &[u8]) -> DeliveryResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| DeliveryError::Internal)?;
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn url_body_mac(key: &[u8], url: &str, body: &[u8]) -> DeliveryResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| DeliveryError::Internal)?;
    mac.update(url.as_bytes());
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

// ---------------------------------------------------------------------------
// Signing (sandbox providers and tests)
// ---------------------------------------------------------------------------

pub fn sign_timestamped(
    secret: &WebhookSecret,
    id: &str,
    timestamp: &str,
    body: &[u8],
) -> DeliveryResult<String> {
    let mac = timestamped_mac(secret.key_bytes(), id, timestamp, body)?;
    Ok(format!("{}{}", SIGNATURE_PREFIX, STANDARD.encode(mac)))
}

pub fn sign_url_body(secret: &WebhookSecret, url: &str, body: &[u8]) -> DeliveryResult<String> {
    Ok(STANDARD.encode(url_body_mac(secret.key_bytes(), url, body)?))
}

pub fn sign_ed25519(key: &SigningKey, timestamp: &str, body: &[u8]) -> String {
    let message = [timestamp.as_bytes(), body].concat();
    STANDARD.encode(key.sign(&message).to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"[{"event":"open","sg_message_id":"m-1","timestamp":1000}]"#;

    fn secret(tag: u8) -> WebhookSecret {
        WebhookSecret::new(vec![tag; 32]).unwrap()
    }

    fn timestamped_headers(secret: &WebhookSecret, ts: u64) -> SignatureHeaders {
        let ts = ts.to_string();
        SignatureHeaders {
            id: Some("msg_1".into()),
            signature: Some(sign_timestamped(secret, "msg_1", &ts, BODY).unwrap()),
            timestamp: Some(ts),
        }
    }

    #[test]
    fn test_timestamped_valid_and_tampered() {
        let verifier = WebhookVerifier::HmacTimestamped {
            current: secret(1),
            previous: None,
        };
        let now = Timestamp::from_seconds(10_000);
        let headers = timestamped_headers(&secret(1), 10_000);
        assert_eq!(verifier.verify(&headers, BODY, now), SignatureVerdict::Valid);
        assert_eq!(
            verifier.verify(&headers, b"[]", now),
            SignatureVerdict::Invalid("signature mismatch")
        );
    }

    #[test]
    fn test_timestamped_freshness_window() {
        let verifier = WebhookVerifier::HmacTimestamped {
            current: secret(1),
            previous: None,
        };
        let headers = timestamped_headers(&secret(1), 10_000);
        assert!(verifier
            .verify(&headers, BODY, Timestamp::from_seconds(10_300))
            .is_valid());
        assert_eq!(
            verifier.verify(&headers, BODY, Timestamp::from_seconds(10_301)),
            SignatureVerdict::Invalid("timestamp outside tolerance")
        );
        assert!(!verifier
            .verify(&headers, BODY, Timestamp::from_seconds(9_699))
            .is_valid());
    }

    #[test]
    fn test_rotation_accepts_previous_secret() {
        let verifier = WebhookVerifier::HmacTimestamped {
            current: secret(2),
            previous: Some(secret(1)),
        };
        let headers = timestamped_headers(&secret(1), 500);
        assert!(verifier
            .verify(&headers, BODY, Timestamp::from_seconds(500))
            .is_valid());

        let rotated_out = WebhookVerifier::HmacTimestamped {
            current: secret(3),
            previous: Some(secret(2)),
        };
        assert!(!rotated_out
            .verify(&headers, BODY, Timestamp::from_seconds(500))
            .is_valid());
    }

    #[test]
    fn test_url_body_scheme() {
        let url = "https://herald.example/webhooks/sms";
        let verifier = WebhookVerifier::HmacUrlBody {
            url: url.into(),
            current: secret(7),
            previous: None,
        };
        let headers = SignatureHeaders {
            signature: Some(sign_url_body(&secret(7), url, BODY).unwrap()),
            ..Default::default()
        };
        assert!(verifier.verify(&headers, BODY, Timestamp::from_seconds(1)).is_valid());

        let other_url = SignatureHeaders {
            signature: Some(sign_url_body(&secret(7), "https://evil", BODY).unwrap()),
            ..Default::default()
        };
        assert!(!verifier
            .verify(&other_url, BODY, Timestamp::from_seconds(1))
            .is_valid());
    }

    #[test]
    fn test_ed25519_scheme() {
        let key = SigningKey::from_bytes(&[5; 32]);
        let verifier = WebhookVerifier::Ed25519 {
            current: key.verifying_key(),
            previous: None,
        };
        let headers = SignatureHeaders {
            timestamp: Some("2000".into()),
            signature: Some(sign_ed25519(&key, "2000", BODY)),
            ..Default::default()
        };
        assert!(verifier.verify(&headers, BODY, Timestamp::from_seconds(2_010)).is_valid());

        let forged = SigningKey::from_bytes(&[6; 32]);
        let headers = SignatureHeaders {
            timestamp: Some("2000".into()),
            signature: Some(sign_ed25519(&forged, "2000", BODY)),
            ..Default::default()
        };
        assert!(!verifier.verify(&headers, BODY, Timestamp::from_seconds(2_010)).is_valid());
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        let verifier = WebhookVerifier::HmacTimestamped {
            current: secret(1),
            previous: None,
        };
        let now = Timestamp::from_seconds(1);
        assert_eq!(
            verifier.verify(&SignatureHeaders::default(), BODY, now),
            SignatureVerdict::Invalid("signature header missing")
        );
        let headers = SignatureHeaders {
            id: Some("x".into()),
            timestamp: Some("1".into()),
            signature: Some("v2,abc".into()),
        };
        assert_eq!(
            verifier.verify(&headers, BODY, now),
            SignatureVerdict::Invalid("signature header malformed")
        );
    }

    #[test]
    fn test_public_key_parsing() {
        let key = SigningKey::from_bytes(&[5; 32]).verifying_key();
        assert_eq!(parse_public_key(&hex::encode(key.as_bytes())).unwrap(), key);
        assert_eq!(parse_public_key(&STANDARD.encode(key.as_bytes())).unwrap(), key);
        assert!(parse_public_key("not-a-key").is_err());
        assert!(WebhookSecret::new(Vec::new()).is_err());
    }
}
