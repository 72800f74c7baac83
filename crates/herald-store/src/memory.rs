use herald_core::{
    AuditEvent, AuditHash, AuditPersistence, BiometricAttempt, BiometricEnrollment,
    BiometricRepository, Channel, CodeAttemptOutcome, CodeId, CodeRepository, CodeSubject,
    ComprehensionChallenge, ContentHash, DeliveryLog, DocumentRef, EmployeeDirectory, EmployeeId,
    EmployeeProfile, EngagementEvent, Gate, GateLogEntry, GateOutcome, GateRepository,
    HeraldError, HeraldResult, IntegrityMutation, IntegrityRecord, IntegrityRepository,
    MutationOutcome, Notice, NoticeFilter, NoticeId, NoticeMutation, NoticeRepository,
    OneTimeCode, ProofState, ProviderMessageId, ReconciliationRun, Timestamp, VerificationQuery,
    WebhookRecord,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// In-memory store implementing every repository trait.
///
/// All collections live behind one lock, so each conditional mutation is
/// evaluated and written as a single step.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    notices: HashMap<NoticeId, Notice>,
    message_index: HashMap<(Channel, ProviderMessageId), NoticeId>,
    codes: HashMap<CodeId, OneTimeCode>,
    gate_log: Vec<GateLogEntry>,
    challenges: HashMap<NoticeId, ComprehensionChallenge>,
    enrollments: HashMap<EmployeeId, BiometricEnrollment>,
    biometric_attempts: Vec<BiometricAttempt>,
    webhooks: Vec<WebhookRecord>,
    engagement: Vec<EngagementEvent>,
    runs: Vec<ReconciliationRun>,
    integrity: HashMap<String, IntegrityRecord>,
    queries: Vec<VerificationQuery>,
    employees: HashMap<EmployeeId, EmployeeProfile>,
    audit: Vec<(AuditHash, AuditEvent)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> HeraldResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| HeraldError::Storage(format!("lock poisoned: {}", e)))
    }

    /// Number of stored notices (for testing/inspection).
    pub fn notice_count(&self) -> usize {
        self.lock().map(|i| i.notices.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tail<T: Clone>(items: &[T], limit: usize) -> Vec<T> {
    let start = items.len().saturating_sub(limit);
    items[start..].to_vec()
}

impl NoticeRepository for MemoryStore {
    fn insert_notice(&self, notice: &Notice) -> HeraldResult<()> {
        let mut inner = self.lock()?;
        if inner.notices.contains_key(&notice.id) {
            return Err(HeraldError::Conflict(format!("notice {} exists", notice.id)));
        }
        for (channel, message_id) in notice.dispatched_channels() {
            inner
                .message_index
                .insert((channel, message_id), notice.id.clone());
        }
        inner.notices.insert(notice.id.clone(), notice.clone());
        Ok(())
    }

    fn get_notice(&self, id: &NoticeId) -> HeraldResult<Option<Notice>> {
        Ok(self.lock()?.notices.get(id).cloned())
    }

    fn find_by_message(
        &self,
        channel: Channel,
        message_id: &ProviderMessageId,
    ) -> HeraldResult<Option<NoticeId>> {
        let inner = self.lock()?;
        Ok(inner
            .message_index
            .get(&(channel, message_id.clone()))
            .cloned())
    }

    fn apply_mutation(
        &self,
        id: &NoticeId,
        mutation: &NoticeMutation,
    ) -> HeraldResult<MutationOutcome> {
        let mut inner = self.lock()?;
        let notice = inner
            .notices
            .get_mut(id)
            .ok_or_else(|| HeraldError::NotFound(format!("notice {}", id)))?;
        let outcome = notice.apply(mutation);
        if outcome.is_applied() {
            if let NoticeMutation::Dispatch {
                channel,
                provider_message_id,
                ..
            } = mutation
            {
                inner
                    .message_index
                    .insert((*channel, provider_message_id.clone()), id.clone());
            }
        }
        Ok(outcome)
    }

    fn select_notices(&self, filter: &NoticeFilter, limit: usize) -> HeraldResult<Vec<Notice>> {
        let inner = self.lock()?;
        let mut selected: Vec<Notice> = inner
            .notices
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        selected.truncate(limit);
        Ok(selected)
    }
}

impl CodeRepository for MemoryStore {
    fn issue_code(&self, code: &OneTimeCode, now: Timestamp) -> HeraldResult<u32> {
        let mut inner = self.lock()?;
        let mut invalidated = 0;
        for existing in inner.codes.values_mut() {
            if existing.subject == code.subject
                && existing.consumed_at.is_none()
                && existing.invalidated_at.is_none()
            {
                existing.invalidated_at = Some(now);
                invalidated += 1;
            }
        }
        inner.codes.insert(code.id.clone(), code.clone());
        Ok(invalidated)
    }

    fn live_code(
        &self,
        subject: &CodeSubject,
        now: Timestamp,
    ) -> HeraldResult<Option<OneTimeCode>> {
        let inner = self.lock()?;
        Ok(inner
            .codes
            .values()
            .filter(|c| &c.subject == subject && c.is_live(&now))
            .max_by_key(|c| c.issued_at)
            .cloned())
    }

    fn get_code(&self, id: &CodeId) -> HeraldResult<Option<OneTimeCode>> {
        Ok(self.lock()?.codes.get(id).cloned())
    }

    fn record_code_attempt(
        &self,
        id: &CodeId,
        matched: bool,
        now: Timestamp,
    ) -> HeraldResult<CodeAttemptOutcome> {
        let mut inner = self.lock()?;
        let code = inner
            .codes
            .get_mut(id)
            .ok_or_else(|| HeraldError::NotFound(format!("code {}", id)))?;
        if !code.is_live(&now) || code.is_exhausted() {
            return Ok(CodeAttemptOutcome::Stale);
        }
        code.attempts += 1;
        if matched {
            code.consumed_at = Some(now);
            Ok(CodeAttemptOutcome::Consumed)
        } else {
            Ok(CodeAttemptOutcome::Counted {
                attempts: code.attempts,
            })
        }
    }
}

impl GateRepository for MemoryStore {
    fn append_gate_log(&self, entry: &GateLogEntry) -> HeraldResult<()> {
        self.lock()?.gate_log.push(entry.clone());
        Ok(())
    }

    fn count_gate_outcomes(
        &self,
        notice_id: &NoticeId,
        gate: Gate,
        outcomes: &[GateOutcome],
        since: Timestamp,
    ) -> HeraldResult<u32> {
        let inner = self.lock()?;
        let count = inner
            .gate_log
            .iter()
            .filter(|e| {
                &e.notice_id == notice_id
                    && e.gate == gate
                    && e.at >= since
                    && outcomes.contains(&e.outcome)
            })
            .count();
        Ok(count as u32)
    }

    fn gate_log(&self, notice_id: &NoticeId) -> HeraldResult<Vec<GateLogEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .gate_log
            .iter()
            .filter(|e| &e.notice_id == notice_id)
            .cloned()
            .collect())
    }

    fn get_challenge(&self, notice_id: &NoticeId) -> HeraldResult<Option<ComprehensionChallenge>> {
        Ok(self.lock()?.challenges.get(notice_id).cloned())
    }

    fn swap_challenge(
        &self,
        expected: Option<&ComprehensionChallenge>,
        next: &ComprehensionChallenge,
    ) -> HeraldResult<bool> {
        let mut inner = self.lock()?;
        let current = inner.challenges.get(&next.notice_id);
        if current != expected {
            return Ok(false);
        }
        inner
            .challenges
            .insert(next.notice_id.clone(), next.clone());
        Ok(true)
    }
}

impl BiometricRepository for MemoryStore {
    fn get_enrollment(
        &self,
        employee_id: &EmployeeId,
    ) -> HeraldResult<Option<BiometricEnrollment>> {
        Ok(self.lock()?.enrollments.get(employee_id).cloned())
    }

    fn insert_enrollment(&self, enrollment: &BiometricEnrollment) -> HeraldResult<bool> {
        let mut inner = self.lock()?;
        if inner.enrollments.contains_key(&enrollment.employee_id) {
            return Ok(false);
        }
        inner
            .enrollments
            .insert(enrollment.employee_id.clone(), enrollment.clone());
        Ok(true)
    }

    fn append_biometric_attempt(&self, attempt: &BiometricAttempt) -> HeraldResult<()> {
        self.lock()?.biometric_attempts.push(attempt.clone());
        Ok(())
    }

    fn biometric_attempts(&self, notice_id: &NoticeId) -> HeraldResult<Vec<BiometricAttempt>> {
        let inner = self.lock()?;
        Ok(inner
            .biometric_attempts
            .iter()
            .filter(|a| &a.notice_id == notice_id)
            .cloned()
            .collect())
    }
}

impl DeliveryLog for MemoryStore {
    fn append_webhook(&self, record: &WebhookRecord) -> HeraldResult<()> {
        self.lock()?.webhooks.push(record.clone());
        Ok(())
    }

    fn webhook_records(&self, limit: usize) -> HeraldResult<Vec<WebhookRecord>> {
        Ok(tail(&self.lock()?.webhooks, limit))
    }

    fn append_engagement(&self, event: &EngagementEvent) -> HeraldResult<()> {
        self.lock()?.engagement.push(event.clone());
        Ok(())
    }

    fn engagement_events(&self, notice_id: &NoticeId) -> HeraldResult<Vec<EngagementEvent>> {
        let inner = self.lock()?;
        Ok(inner
            .engagement
            .iter()
            .filter(|e| &e.notice_id == notice_id)
            .cloned()
            .collect())
    }

    fn append_reconciliation_run(&self, run: &ReconciliationRun) -> HeraldResult<()> {
        self.lock()?.runs.push(run.clone());
        Ok(())
    }

    fn reconciliation_runs(&self, limit: usize) -> HeraldResult<Vec<ReconciliationRun>> {
        Ok(tail(&self.lock()?.runs, limit))
    }
}

impl IntegrityRepository for MemoryStore {
    fn insert_integrity(&self, record: &IntegrityRecord) -> HeraldResult<bool> {
        let mut inner = self.lock()?;
        let key = record.document.key();
        if inner.integrity.contains_key(&key) {
            return Ok(false);
        }
        inner.integrity.insert(key, record.clone());
        Ok(true)
    }

    fn get_integrity(&self, document: &DocumentRef) -> HeraldResult<Option<IntegrityRecord>> {
        Ok(self.lock()?.integrity.get(&document.key()).cloned())
    }

    fn find_integrity_by_hash(
        &self,
        hash: &ContentHash,
    ) -> HeraldResult<Option<IntegrityRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .integrity
            .values()
            .filter(|r| &r.content_hash == hash)
            .min_by_key(|r| r.hashed_at)
            .cloned())
    }

    fn apply_integrity(
        &self,
        document: &DocumentRef,
        mutation: &IntegrityMutation,
    ) -> HeraldResult<MutationOutcome> {
        let mut inner = self.lock()?;
        let record = inner
            .integrity
            .get_mut(&document.key())
            .ok_or_else(|| HeraldError::NotFound(format!("integrity record {}", document)))?;
        Ok(record.apply(mutation))
    }

    fn pending_proofs(
        &self,
        submitted_before: Timestamp,
        limit: usize,
    ) -> HeraldResult<Vec<IntegrityRecord>> {
        let inner = self.lock()?;
        let mut pending: Vec<IntegrityRecord> = inner
            .integrity
            .values()
            .filter(|r| {
                r.blockchain.state == ProofState::Pending
                    && r.blockchain
                        .submitted_at
                        .map(|at| at <= submitted_before)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.blockchain.submitted_at);
        pending.truncate(limit);
        Ok(pending)
    }

    fn append_verification_query(&self, query: &VerificationQuery) -> HeraldResult<()> {
        self.lock()?.queries.push(query.clone());
        Ok(())
    }

    fn verification_queries(&self, limit: usize) -> HeraldResult<Vec<VerificationQuery>> {
        Ok(tail(&self.lock()?.queries, limit))
    }
}

impl EmployeeDirectory for MemoryStore {
    fn employee(&self, id: &EmployeeId) -> HeraldResult<Option<EmployeeProfile>> {
        Ok(self.lock()?.employees.get(id).cloned())
    }

    fn upsert_employee(&self, profile: &EmployeeProfile) -> HeraldResult<()> {
        self.lock()?
            .employees
            .insert(profile.employee_id.clone(), profile.clone());
        Ok(())
    }
}

impl AuditPersistence for MemoryStore {
    fn persist_audit_entry(&self, hash: &AuditHash, event: &AuditEvent) -> HeraldResult<()> {
        self.lock()?.audit.push((hash.clone(), event.clone()));
        Ok(())
    }

    fn load_audit_entries(&self) -> HeraldResult<Vec<(AuditHash, AuditEvent)>> {
        Ok(self.lock()?.audit.clone())
    }
}
