//! Gate B: six-digit one-time codes.
//!
//! Codes are stored as SHA-256(salt || code) and compared in constant time.
//! Issuing a code invalidates every unconsumed code for the same subject in
//! one atomic step, so at most one code is ever outstanding.

use std::time::Duration;

use herald_core::{
    constant_time_eq, random_bytes, random_digits, salted_hash, Channel, CodeAttemptOutcome,
    CodeId, CodeRepository, CodeSubject, DeliveryProvider, OneTimeCode, ProviderMessageId,
    Timestamp,
};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

pub const CODE_LENGTH: usize = 6;

/// Allowed range for the per-code attempt ceiling.
pub const MIN_CODE_ATTEMPTS: u32 = 3;
pub const MAX_CODE_ATTEMPTS: u32 = 5;

pub const DEFAULT_CODE_TTL_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePolicy {
    pub max_attempts: u32,
    pub ttl_secs: u64,
}

impl Default for CodePolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CODE_ATTEMPTS,
            ttl_secs: DEFAULT_CODE_TTL_SECS,
        }
    }
}

impl CodePolicy {
    /// Clamp the ceiling into the allowed range.
    pub fn new(max_attempts: u32, ttl_secs: u64) -> Self {
        Self {
            max_attempts: max_attempts.clamp(MIN_CODE_ATTEMPTS, MAX_CODE_ATTEMPTS),
            ttl_secs,
        }
    }
}

/// What the accessor learns about an issued code. Never the code itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCode {
    pub code_id: CodeId,
    pub channel: Channel,
    pub expires_at: Timestamp,
    pub max_attempts: u32,
    pub superseded: u32,
    pub message_id: ProviderMessageId,
}

fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_digit())
}

/// Generate, store, then deliver a fresh code. Storage happens first so a
/// concurrent issuance can never leave two live codes; a delivery failure
/// leaves an undeliverable code that the next issuance supersedes.
pub async fn issue_code(
    codes: &dyn CodeRepository,
    provider: &dyn DeliveryProvider,
    destination: &str,
    subject: CodeSubject,
    policy: CodePolicy,
    timeout: Duration,
    now: Timestamp,
) -> GateResult<IssuedCode> {
    let plaintext = random_digits(CODE_LENGTH);
    let salt: [u8; 16] = random_bytes();
    let record = OneTimeCode {
        id: CodeId::generate(),
        subject,
        channel: provider.channel(),
        salt: hex::encode(salt),
        code_hash: salted_hash(&salt, plaintext.as_bytes()),
        issued_at: now,
        expires_at: now.plus_seconds(policy.ttl_secs),
        attempts: 0,
        max_attempts: policy.max_attempts,
        consumed_at: None,
        invalidated_at: None,
    };
    let superseded = codes.issue_code(&record, now)?;

    let message_id = match tokio::time::timeout(timeout, provider.send_code(destination, &plaintext))
        .await
    {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            tracing::warn!(subject = %record.subject, channel = %record.channel, error = %e, "code delivery failed");
            return Err(GateError::ProviderUnavailable);
        }
        Err(_) => {
            tracing::warn!(subject = %record.subject, channel = %record.channel, "code delivery timed out");
            return Err(GateError::ProviderUnavailable);
        }
    };

    tracing::info!(subject = %record.subject, channel = %record.channel, superseded, "one-time code issued");
    Ok(IssuedCode {
        code_id: record.id,
        channel: record.channel,
        expires_at: record.expires_at,
        max_attempts: record.max_attempts,
        superseded,
        message_id,
    })
}

/// Check a supplied code against the live code for the subject. A
/// malformed code is rejected before any attempt is counted.
pub fn verify_code(
    codes: &dyn CodeRepository,
    subject: &CodeSubject,
    supplied: &str,
    now: Timestamp,
) -> GateResult<()> {
    let supplied = supplied.trim();
    if !is_well_formed(supplied) {
        return Err(GateError::InvalidInput);
    }

    let code = codes.live_code(subject, now)?.ok_or(GateError::CodeExpired)?;
    if code.is_exhausted() {
        return Err(GateError::CodeExhausted);
    }

    let salt = hex::decode(&code.salt).map_err(|_| GateError::Internal)?;
    let candidate = salted_hash(&salt, supplied.as_bytes());
    let matched = constant_time_eq(&candidate.0, &code.code_hash.0);

    match codes.record_code_attempt(&code.id, matched, now)? {
        CodeAttemptOutcome::Consumed => Ok(()),
        CodeAttemptOutcome::Counted { attempts } => {
            let remaining = code.max_attempts.saturating_sub(attempts);
            if remaining == 0 {
                tracing::warn!(subject = %subject, "code attempts exhausted");
                Err(GateError::CodeExhausted)
            } else {
                Err(GateError::CodeMismatch { remaining })
            }
        }
        CodeAttemptOutcome::Stale => match codes.get_code(&code.id)? {
            Some(c) if c.is_exhausted() => Err(GateError::CodeExhausted),
            _ => Err(GateError::CodeExpired),
        },
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use herald_core::{DispatchRequest, HeraldError, HeraldResult, ProviderEvent};

    use super::*;

    /// Records every code it is asked to send.
    pub struct CapturingProvider {
        pub channel: Channel,
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    impl CapturingProvider {
        pub fn new(channel: Channel) -> Self {
            Self {
                channel,
                sent: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        pub fn last_code(&self) -> String {
            self.sent
                .lock()
                .unwrap()
                .last()
                .map(|(_, code)| code.clone())
                .unwrap()
        }
    }

    #[async_trait]
    impl DeliveryProvider for CapturingProvider {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn dispatch(&self, request: &DispatchRequest) -> HeraldResult<ProviderMessageId> {
            Ok(ProviderMessageId::new(format!("msg-{}", request.notice_id)))
        }

        async fn fetch_events(
            &self,
            _message_id: &ProviderMessageId,
        ) -> HeraldResult<Vec<ProviderEvent>> {
            Ok(Vec::new())
        }

        async fn send_code(&self, destination: &str, code: &str) -> HeraldResult<ProviderMessageId> {
            if self.fail {
                return Err(HeraldError::Provider("gateway down".into()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((destination.to_string(), code.to_string()));
            Ok(ProviderMessageId::new(format!("code-{}", sent.len())))
        }
    }
}
