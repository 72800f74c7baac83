//! Accessor session tokens.
//!
//! A token binds one notice, its issuing company and an expiry, MACed with
//! HMAC-SHA256 under a process key. Gate endpoints check it before any gate
//! logic runs.
//!
//! Format: `hrld1.<hex(payload)>.<hex(mac)>` with payload
//! `notice_id|company_id|expiry_seconds`.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use herald_core::{CompanyId, NoticeId, Timestamp};

use crate::error::{GateError, GateResult};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "hrld1.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    pub notice_id: NoticeId,
    pub company_id: CompanyId,
    pub expires_at: Timestamp,
}

pub struct AccessKey(Zeroizing<[u8; 32]>);

impl AccessKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Derive the key from a configured secret string.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self::from_bytes(key)
    }

    fn mac(&self) -> GateResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.0[..]).map_err(|_| GateError::Internal)
    }

    pub fn issue(
        &self,
        notice_id: &NoticeId,
        company_id: &CompanyId,
        expires_at: Timestamp,
    ) -> GateResult<String> {
        if notice_id.as_str().contains('|') || company_id.as_str().contains('|') {
            return Err(GateError::InvalidInput);
        }
        let payload = format!(
            "{}|{}|{}",
            notice_id.as_str(),
            company_id.as_str(),
            expires_at.seconds_since_epoch
        );
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let tag = mac.finalize().into_bytes();
        Ok(format!(
            "{}{}.{}",
            TOKEN_PREFIX,
            hex::encode(payload.as_bytes()),
            hex::encode(tag)
        ))
    }

    /// Check MAC, expiry and that the token was issued for `notice_id`.
    pub fn verify(
        &self,
        token: &str,
        notice_id: &NoticeId,
        now: Timestamp,
    ) -> GateResult<AccessClaims> {
        let body = token
            .trim()
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(GateError::Unauthorized)?;
        let (payload_hex, tag_hex) = body.split_once('.').ok_or(GateError::Unauthorized)?;
        let payload = hex::decode(payload_hex).map_err(|_| GateError::Unauthorized)?;
        let tag = hex::decode(tag_hex).map_err(|_| GateError::Unauthorized)?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&tag).map_err(|_| GateError::Unauthorized)?;

        let payload = String::from_utf8(payload).map_err(|_| GateError::Unauthorized)?;
        let mut parts = payload.split('|');
        let (Some(notice), Some(company), Some(expiry), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(GateError::Unauthorized);
        };
        let expiry: u64 = expiry.parse().map_err(|_| GateError::Unauthorized)?;

        if notice != notice_id.as_str() {
            return Err(GateError::Unauthorized);
        }
        let expires_at = Timestamp::from_seconds(expiry);
        if expires_at.is_expired_at(&now) {
            return Err(GateError::Unauthorized);
        }
        Ok(AccessClaims {
            notice_id: NoticeId::new(notice),
            company_id: CompanyId::new(company),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AccessKey {
        AccessKey::from_secret("test-access-secret")
    }

    #[test]
    fn test_issue_and_verify() {
        let token = key()
            .issue(
                &NoticeId::new("n-1"),
                &CompanyId::new("acme"),
                Timestamp::from_seconds(1_000),
            )
            .unwrap();
        assert!(token.starts_with("hrld1."));
        let claims = key()
            .verify(&token, &NoticeId::new("n-1"), Timestamp::from_seconds(999))
            .unwrap();
        assert_eq!(claims.company_id, CompanyId::new("acme"));
    }

    #[test]
    fn test_wrong_notice_expired_and_foreign_key_rejected() {
        let token = key()
            .issue(
                &NoticeId::new("n-1"),
                &CompanyId::new("acme"),
                Timestamp::from_seconds(1_000),
            )
            .unwrap();
        let now = Timestamp::from_seconds(10);
        assert_eq!(
            key().verify(&token, &NoticeId::new("n-2"), now),
            Err(GateError::Unauthorized)
        );
        assert_eq!(
            key().verify(&token, &NoticeId::new("n-1"), Timestamp::from_seconds(1_000)),
            Err(GateError::Unauthorized)
        );
        assert_eq!(
            AccessKey::from_secret("other").verify(&token, &NoticeId::new("n-1"), now),
            Err(GateError::Unauthorized)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let token = key()
            .issue(
                &NoticeId::new("n-1"),
                &CompanyId::new("acme"),
                Timestamp::from_seconds(1_000),
            )
            .unwrap();
        let (_, tag) = token.rsplit_once('.').unwrap();
        let forged = format!(
            "hrld1.{}.{}",
            hex::encode("n-1|acme|9999999999"),
            tag
        );
        assert_eq!(
            key().verify(&forged, &NoticeId::new("n-1"), Timestamp::from_seconds(10)),
            Err(GateError::Unauthorized)
        );
        assert_eq!(
            key().verify("garbage", &NoticeId::new("n-1"), Timestamp::from_seconds(10)),
            Err(GateError::Unauthorized)
        );
    }

    #[test]
    fn test_separator_in_ids_refused() {
        assert_eq!(
            key().issue(
                &NoticeId::new("n|1"),
                &CompanyId::new("acme"),
                Timestamp::from_seconds(1)
            ),
            Err(GateError::InvalidInput)
        );
    }
}
