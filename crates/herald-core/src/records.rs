//! Append-only and short-lived records owned by the gatekeeper, the
//! reconciliation engine and the ledger.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::integrity::DocumentRef;
use crate::notice::{FirmBasis, ReadMethod};
use crate::types::{
    AccessContext, AgreementId, AttemptId, Channel, CodeId, CompanyId, ContentHash, EmployeeId,
    EnrollmentId, Gate, GateOutcome, NoticeId, ProviderMessageId, RunId, Timestamp,
    WebhookRecordId,
};

// ---------------------------------------------------------------------------
// One-time codes
// ---------------------------------------------------------------------------

/// What a one-time code protects: a notice, or a domicile agreement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum CodeSubject {
    Notice(NoticeId),
    Agreement(AgreementId),
}

impl CodeSubject {
    pub fn key(&self) -> String {
        match self {
            CodeSubject::Notice(id) => format!("notice:{}", id),
            CodeSubject::Agreement(id) => format!("agreement:{}", id),
        }
    }
}

impl fmt::Display for CodeSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeCode {
    pub id: CodeId,
    pub subject: CodeSubject,
    pub channel: Channel,
    /// Per-code random salt, hex.
    pub salt: String,
    /// SHA-256(salt || code). The plaintext code is never stored.
    pub code_hash: ContentHash,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
    pub attempts: u32,
    pub max_attempts: u32,
    pub consumed_at: Option<Timestamp>,
    pub invalidated_at: Option<Timestamp>,
}

impl OneTimeCode {
    /// Unconsumed, not superseded and not yet expired.
    pub fn is_live(&self, now: &Timestamp) -> bool {
        self.consumed_at.is_none() && self.invalidated_at.is_none() && *now < self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Result of conditionally counting a verification attempt on a code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeAttemptOutcome {
    /// Mismatch counted; `attempts` is the new total.
    Counted { attempts: u32 },
    /// Match recorded; the code is consumed.
    Consumed,
    /// The code was consumed, superseded or exhausted concurrently.
    Stale,
}

// ---------------------------------------------------------------------------
// Employees and standing agreements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeProfile {
    pub employee_id: EmployeeId,
    pub company_id: CompanyId,
    pub primary_identifier: String,
    pub secondary_identifier: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Opted into biometric verification in the standing agreement.
    pub biometric_opt_in: bool,
}

impl EmployeeProfile {
    pub fn destination(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms | Channel::Whatsapp => self.phone.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Biometrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricEnrollment {
    pub id: EnrollmentId,
    pub employee_id: EmployeeId,
    /// Provider-side reference to the template, never the image itself.
    pub template_ref: String,
    pub template_hash: ContentHash,
    pub liveness_confidence: f64,
    pub enrolled_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContingencyReason {
    CameraUnavailable,
    CameraPermissionDenied,
    PoorConnectivity,
    ProviderTimeout,
    ProviderError,
    LivenessInconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricAttempt {
    pub id: AttemptId,
    pub notice_id: NoticeId,
    pub employee_id: EmployeeId,
    pub at: Timestamp,
    pub liveness_confidence: Option<f64>,
    pub similarity: Option<f64>,
    pub outcome: GateOutcome,
    pub contingency: bool,
    pub contingency_reasons: Vec<ContingencyReason>,
    pub provider_calls: u32,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Gate log and comprehension challenge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateLogEntry {
    pub notice_id: NoticeId,
    pub gate: Gate,
    pub at: Timestamp,
    pub context: AccessContext,
    pub outcome: GateOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskedFact {
    SanctionType,
    SanctionDuration,
    IncidentDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComprehensionChallenge {
    pub notice_id: NoticeId,
    pub fact: MaskedFact,
    pub issued_at: Timestamp,
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_at: Option<Timestamp>,
    pub passed_at: Option<Timestamp>,
    pub resets: u32,
}

impl ComprehensionChallenge {
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Delivery events, webhooks and reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Processed,
    Deferred,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Failed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Processed => "processed",
            EventKind::Deferred => "deferred",
            EventKind::Delivered => "delivered",
            EventKind::Opened => "opened",
            EventKind::Clicked => "clicked",
            EventKind::Bounced => "bounced",
            EventKind::Failed => "failed",
        }
    }
}

/// A provider event normalized from any channel's payload or pull API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub message_id: ProviderMessageId,
    pub kind: EventKind,
    /// When the provider says the event happened.
    pub occurred_at: Timestamp,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub id: WebhookRecordId,
    pub provider: Channel,
    pub received_at: Timestamp,
    pub payload_hash: ContentHash,
    pub payload_len: u64,
    pub signature_valid: bool,
    pub signature_detail: Option<String>,
    /// Strict enforcement refused the payload.
    pub rejected: bool,
    pub origin: AccessContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub notice_id: NoticeId,
    pub channel: Channel,
    pub message_id: ProviderMessageId,
    pub kind: EventKind,
    pub occurred_at: Timestamp,
    pub recorded_at: Timestamp,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Clean,
    Recovered,
    PartialFailure,
    Failed,
}

impl RunOutcome {
    pub fn classify(reviewed: u32, recovered: u32, errors: u32) -> Self {
        if errors == 0 {
            if recovered == 0 {
                RunOutcome::Clean
            } else {
                RunOutcome::Recovered
            }
        } else if errors >= reviewed {
            RunOutcome::Failed
        } else {
            RunOutcome::PartialFailure
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: RunId,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub duration_ms: u64,
    pub reviewed: u32,
    pub recovered: u32,
    pub errors: u32,
    pub outcome: RunOutcome,
    pub error_samples: Vec<String>,
}

// ---------------------------------------------------------------------------
// Public verification queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationQuery {
    pub at: Timestamp,
    pub queried_hash: String,
    pub document: Option<DocumentRef>,
    pub matched: bool,
    pub caller: AccessContext,
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEventKind {
    NoticeCreated {
        notice_id: NoticeId,
        content_hash: ContentHash,
    },
    DocumentRegistered {
        document: DocumentRef,
        content_hash: ContentHash,
    },
    NoticeDispatched {
        notice_id: NoticeId,
        channel: Channel,
    },
    GatePassed {
        notice_id: NoticeId,
        gate: Gate,
        contingency: bool,
    },
    ReadConfirmed {
        notice_id: NoticeId,
        method: ReadMethod,
    },
    Engagement {
        notice_id: NoticeId,
        channel: Channel,
        kind: EventKind,
        occurred_at: Timestamp,
    },
    OpenRecovered {
        notice_id: NoticeId,
        channel: Channel,
        occurred_at: Timestamp,
    },
    ChannelFailed {
        notice_id: NoticeId,
        channel: Channel,
    },
    PhysicalFallbackActivated {
        notice_id: NoticeId,
    },
    PhysicalDispatched {
        notice_id: NoticeId,
    },
    FirmPromoted {
        notice_id: NoticeId,
        basis: FirmBasis,
    },
    ImpugnmentRecorded {
        notice_id: NoticeId,
    },
    ComprehensionReset {
        notice_id: NoticeId,
        operator: String,
    },
    DocumentSigned {
        document: DocumentRef,
        signer: String,
    },
    ProofResolved {
        document: DocumentRef,
        confirmed: bool,
    },
    VerificationQueried {
        queried_hash: String,
        matched: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_subject_key() {
        let s = CodeSubject::Notice(NoticeId::new("n-1"));
        assert_eq!(s.key(), "notice:n-1");
        let a = CodeSubject::Agreement(AgreementId::new("a-1"));
        assert_eq!(a.to_string(), "agreement:a-1");
    }

    #[test]
    fn test_code_liveness() {
        let code = OneTimeCode {
            id: CodeId::new("c"),
            subject: CodeSubject::Notice(NoticeId::new("n")),
            channel: Channel::Sms,
            salt: "00".into(),
            code_hash: ContentHash([0; 32]),
            issued_at: Timestamp::from_seconds(0),
            expires_at: Timestamp::from_seconds(600),
            attempts: 4,
            max_attempts: 5,
            consumed_at: None,
            invalidated_at: None,
        };
        assert!(code.is_live(&Timestamp::from_seconds(599)));
        assert!(!code.is_live(&Timestamp::from_seconds(600)));
        assert!(!code.is_exhausted());
        assert_eq!(code.remaining_attempts(), 1);
    }

    #[test]
    fn test_run_outcome_classification() {
        assert_eq!(RunOutcome::classify(0, 0, 0), RunOutcome::Clean);
        assert_eq!(RunOutcome::classify(5, 2, 0), RunOutcome::Recovered);
        assert_eq!(RunOutcome::classify(5, 1, 2), RunOutcome::PartialFailure);
        assert_eq!(RunOutcome::classify(3, 0, 3), RunOutcome::Failed);
    }

    #[test]
    fn test_employee_destination() {
        let profile = EmployeeProfile {
            employee_id: EmployeeId::new("e"),
            company_id: CompanyId::new("c"),
            primary_identifier: "1234".into(),
            secondary_identifier: None,
            email: Some("e@example.com".into()),
            phone: None,
            biometric_opt_in: false,
        };
        assert_eq!(profile.destination(Channel::Email), Some("e@example.com"));
        assert_eq!(profile.destination(Channel::Sms), None);
    }

    #[test]
    fn test_audit_event_kind_serialization() {
        let kind = AuditEventKind::FirmPromoted {
            notice_id: NoticeId::new("n-1"),
            basis: FirmBasis::AutoPromoted,
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert!(json.contains("firm_promoted"));
        let back: AuditEventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
    }
}
