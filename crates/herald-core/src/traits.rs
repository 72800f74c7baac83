use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HeraldResult;
use crate::integrity::{
    Anchor, DocumentRef, IntegrityMutation, IntegrityRecord, PendingProof, SignedToken,
};
use crate::notice::{MutationOutcome, Notice, NoticeFilter, NoticeMutation};
use crate::records::{
    AuditEventKind, BiometricAttempt, BiometricEnrollment, CodeAttemptOutcome, CodeSubject,
    ComprehensionChallenge, EmployeeProfile, EngagementEvent, GateLogEntry, OneTimeCode,
    ProviderEvent, ReconciliationRun, VerificationQuery, WebhookRecord,
};
use crate::types::{
    AuditHash, Channel, CodeId, ContentHash, EmployeeId, Gate, GateOutcome, NoticeId,
    ProviderMessageId, Timestamp,
};

// ---------------------------------------------------------------------------
// Signer: Ed25519 signing capability
// ---------------------------------------------------------------------------

pub trait Signer: Send + Sync {
    fn sign_ed25519(&self, message: &[u8]) -> HeraldResult<[u8; 64]>;
    fn public_key_ed25519(&self) -> [u8; 32];
}

// ---------------------------------------------------------------------------
// Repositories
//
// Fixed-shape, strongly typed persistence. Every milestone write goes through
// a conditional mutation evaluated atomically by the implementation.
// ---------------------------------------------------------------------------

pub trait NoticeRepository: Send + Sync {
    /// Insert a new notice. Fails with `Conflict` if the id exists.
    fn insert_notice(&self, notice: &Notice) -> HeraldResult<()>;

    fn get_notice(&self, id: &NoticeId) -> HeraldResult<Option<Notice>>;

    /// Resolve a provider message id recorded by a dispatch.
    fn find_by_message(
        &self,
        channel: Channel,
        message_id: &ProviderMessageId,
    ) -> HeraldResult<Option<NoticeId>>;

    /// Atomically evaluate `mutation` against the stored notice.
    /// Returns `NotFound` if the notice does not exist.
    fn apply_mutation(
        &self,
        id: &NoticeId,
        mutation: &NoticeMutation,
    ) -> HeraldResult<MutationOutcome>;

    fn select_notices(&self, filter: &NoticeFilter, limit: usize) -> HeraldResult<Vec<Notice>>;
}

pub trait CodeRepository: Send + Sync {
    /// Invalidate every live code for the subject and store `code`, as one
    /// atomic step. Returns how many codes were invalidated.
    fn issue_code(&self, code: &OneTimeCode, now: Timestamp) -> HeraldResult<u32>;

    fn live_code(&self, subject: &CodeSubject, now: Timestamp)
        -> HeraldResult<Option<OneTimeCode>>;

    fn get_code(&self, id: &CodeId) -> HeraldResult<Option<OneTimeCode>>;

    /// Count one attempt if the code is still live and under its ceiling.
    /// A matching attempt also consumes the code.
    fn record_code_attempt(
        &self,
        id: &CodeId,
        matched: bool,
        now: Timestamp,
    ) -> HeraldResult<CodeAttemptOutcome>;
}

pub trait GateRepository: Send + Sync {
    fn append_gate_log(&self, entry: &GateLogEntry) -> HeraldResult<()>;

    fn count_gate_outcomes(
        &self,
        notice_id: &NoticeId,
        gate: Gate,
        outcomes: &[GateOutcome],
        since: Timestamp,
    ) -> HeraldResult<u32>;

    fn gate_log(&self, notice_id: &NoticeId) -> HeraldResult<Vec<GateLogEntry>>;

    fn get_challenge(&self, notice_id: &NoticeId) -> HeraldResult<Option<ComprehensionChallenge>>;

    /// Compare-and-swap on the whole challenge: `expected = None` requires
    /// that no challenge exists yet.
    fn swap_challenge(
        &self,
        expected: Option<&ComprehensionChallenge>,
        next: &ComprehensionChallenge,
    ) -> HeraldResult<bool>;
}

pub trait BiometricRepository: Send + Sync {
    fn get_enrollment(&self, employee_id: &EmployeeId)
        -> HeraldResult<Option<BiometricEnrollment>>;

    /// Returns false if the employee is already enrolled.
    fn insert_enrollment(&self, enrollment: &BiometricEnrollment) -> HeraldResult<bool>;

    fn append_biometric_attempt(&self, attempt: &BiometricAttempt) -> HeraldResult<()>;

    fn biometric_attempts(&self, notice_id: &NoticeId) -> HeraldResult<Vec<BiometricAttempt>>;
}

pub trait DeliveryLog: Send + Sync {
    fn append_webhook(&self, record: &WebhookRecord) -> HeraldResult<()>;

    /// Most recent records, oldest first.
    fn webhook_records(&self, limit: usize) -> HeraldResult<Vec<WebhookRecord>>;

    fn append_engagement(&self, event: &EngagementEvent) -> HeraldResult<()>;

    fn engagement_events(&self, notice_id: &NoticeId) -> HeraldResult<Vec<EngagementEvent>>;

    fn append_reconciliation_run(&self, run: &ReconciliationRun) -> HeraldResult<()>;

    fn reconciliation_runs(&self, limit: usize) -> HeraldResult<Vec<ReconciliationRun>>;
}

pub trait IntegrityRepository: Send + Sync {
    /// Returns false if a record already exists for the document.
    fn insert_integrity(&self, record: &IntegrityRecord) -> HeraldResult<bool>;

    fn get_integrity(&self, document: &DocumentRef) -> HeraldResult<Option<IntegrityRecord>>;

    fn find_integrity_by_hash(&self, hash: &ContentHash)
        -> HeraldResult<Option<IntegrityRecord>>;

    fn apply_integrity(
        &self,
        document: &DocumentRef,
        mutation: &IntegrityMutation,
    ) -> HeraldResult<MutationOutcome>;

    /// Pending blockchain proofs submitted at or before the bound.
    fn pending_proofs(
        &self,
        submitted_before: Timestamp,
        limit: usize,
    ) -> HeraldResult<Vec<IntegrityRecord>>;

    fn append_verification_query(&self, query: &VerificationQuery) -> HeraldResult<()>;

    fn verification_queries(&self, limit: usize) -> HeraldResult<Vec<VerificationQuery>>;
}

/// Read access to employee records and standing agreements, which are
/// maintained elsewhere.
pub trait EmployeeDirectory: Send + Sync {
    fn employee(&self, id: &EmployeeId) -> HeraldResult<Option<EmployeeProfile>>;

    fn upsert_employee(&self, profile: &EmployeeProfile) -> HeraldResult<()>;
}

// ---------------------------------------------------------------------------
// AuditChainWriter: append-only hash-chained audit log
//
// Each entry includes the hash of the previous entry for tamper evidence.
// ---------------------------------------------------------------------------

pub trait AuditChainWriter: Send + Sync {
    fn append(&self, event: AuditEvent) -> HeraldResult<AuditHash>;
    fn verify_chain(&self) -> HeraldResult<bool>;
    fn head(&self) -> HeraldResult<Option<AuditHash>>;
    fn recent(&self, limit: usize) -> HeraldResult<Vec<AuditEvent>>;
}

/// Durable backing for the audit chain.
pub trait AuditPersistence: Send + Sync {
    fn persist_audit_entry(&self, hash: &AuditHash, event: &AuditEvent) -> HeraldResult<()>;
    fn load_audit_entries(&self) -> HeraldResult<Vec<(AuditHash, AuditEvent)>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: Timestamp,
    pub kind: AuditEventKind,
    pub previous_hash: Option<AuditHash>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            kind,
            previous_hash: None,
        }
    }
}

// ---------------------------------------------------------------------------
// External capability contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub notice_id: NoticeId,
    pub destination: String,
    pub subject: String,
    pub content_hash: ContentHash,
}

/// Email, SMS or messaging provider.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    fn channel(&self) -> Channel;

    async fn dispatch(&self, request: &DispatchRequest) -> HeraldResult<ProviderMessageId>;

    /// Pull API: every event the provider holds for one message.
    async fn fetch_events(&self, message_id: &ProviderMessageId)
        -> HeraldResult<Vec<ProviderEvent>>;

    /// Deliver a one-time code out of band.
    async fn send_code(&self, destination: &str, code: &str) -> HeraldResult<ProviderMessageId>;
}

/// Opaque provider-side handle to a captured face reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BiometricReference(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessResult {
    pub is_live: bool,
    pub confidence: f64,
    pub reference: BiometricReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub similarity: f64,
}

#[async_trait]
pub trait BiometricProvider: Send + Sync {
    async fn verify_liveness(&self, session_id: &str) -> HeraldResult<LivenessResult>;

    async fn compare_faces(
        &self,
        reference_a: &BiometricReference,
        reference_b: &BiometricReference,
    ) -> HeraldResult<FaceMatch>;
}

#[async_trait]
pub trait TimestampAuthority: Send + Sync {
    async fn stamp(&self, hash: &ContentHash) -> HeraldResult<SignedToken>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotaryStatus {
    pub confirmed: bool,
    pub anchor: Option<Anchor>,
}

#[async_trait]
pub trait BlockchainNotary: Send + Sync {
    async fn submit(&self, hash: &ContentHash) -> HeraldResult<PendingProof>;

    async fn query(&self, proof: &PendingProof) -> HeraldResult<NotaryStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify the trait objects are object-safe
    fn _assert_signer_object_safe(_: &dyn Signer) {}
    fn _assert_notice_repo_object_safe(_: &dyn NoticeRepository) {}
    fn _assert_code_repo_object_safe(_: &dyn CodeRepository) {}
    fn _assert_audit_object_safe(_: &dyn AuditChainWriter) {}
    fn _assert_delivery_object_safe(_: &dyn DeliveryProvider) {}
    fn _assert_biometric_object_safe(_: &dyn BiometricProvider) {}
    fn _assert_tsa_object_safe(_: &dyn TimestampAuthority) {}
    fn _assert_notary_object_safe(_: &dyn BlockchainNotary) {}

    #[test]
    fn test_audit_event_serialization() {
        let event = AuditEvent::new(
            AuditEventKind::PhysicalFallbackActivated {
                notice_id: NoticeId::new("n-1"),
            },
            Timestamp::from_seconds(42),
        );
        let json = serde_json::to_string(&event).unwrap();
        let event2: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, event2);
    }
}
