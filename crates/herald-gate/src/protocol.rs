//! The gatekeeper: strict gate order per notice, one log entry per call.
//!
//! Order is credential, one-time code, biometric (only for employees who
//! opted in) and reading confirmation. Re-invoking a satisfied gate returns
//! the stored timestamp without touching state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use herald_core::{
    AccessContext, AuditChainWriter, AuditEvent, AuditEventKind, BiometricProvider,
    BiometricRepository, Channel, CodeRepository, CodeSubject, DeliveryProvider,
    EmployeeDirectory, EmployeeProfile, Gate, GateLogEntry, GateOutcome, GateRepository,
    MutationOutcome, Notice, NoticeContent, NoticeId, NoticeMutation, NoticeRepository,
    ReadMethod, Timestamp,
};

use crate::biometric::{
    contingency_reasons, open_contingency, record_contingency_activation, record_contingency_pass,
    BiometricCheck, DeviceCapabilityReport,
};
use crate::comprehension::{
    load_or_issue, reset_challenge, submit_answer, AnswerOutcome, ChallengePrompt,
    DEFAULT_COMPREHENSION_ATTEMPTS,
};
use crate::credential::verify_credential;
use crate::error::{GateError, GateResult};
use crate::otp::{issue_code, verify_code, CodePolicy, IssuedCode};

/// Repositories the gatekeeper reads and writes.
#[derive(Clone)]
pub struct GateStores {
    pub notices: Arc<dyn NoticeRepository>,
    pub employees: Arc<dyn EmployeeDirectory>,
    pub codes: Arc<dyn CodeRepository>,
    pub gates: Arc<dyn GateRepository>,
    pub biometrics: Arc<dyn BiometricRepository>,
    pub audit: Arc<dyn AuditChainWriter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    pub code: CodePolicy,
    pub comprehension_attempts: u32,
    pub provider_timeout: Duration,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            code: CodePolicy::default(),
            comprehension_attempts: DEFAULT_COMPREHENSION_ATTEMPTS,
            provider_timeout: Duration::from_secs(10),
        }
    }
}

/// A satisfied gate: when, and whether this call satisfied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePass {
    pub gate: Gate,
    pub outcome: GateOutcome,
    pub at: Timestamp,
    pub contingency: bool,
}

impl GatePass {
    fn passed(gate: Gate, at: Timestamp) -> Self {
        Self {
            gate,
            outcome: GateOutcome::Passed,
            at,
            contingency: false,
        }
    }

    fn already(gate: Gate, at: Timestamp) -> Self {
        Self {
            gate,
            outcome: GateOutcome::AlreadySatisfied,
            at,
            contingency: false,
        }
    }
}

/// Contingency opened: the reasons on record and the fallback code sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContingencyTicket {
    pub reasons: Vec<herald_core::ContingencyReason>,
    pub code: IssuedCode,
}

/// Where an accessor stands in the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateProgress {
    pub notice_id: NoticeId,
    pub identity_validated_at: Option<Timestamp>,
    pub code_validated_at: Option<Timestamp>,
    pub biometric_required: bool,
    pub biometric_completed_at: Option<Timestamp>,
    pub biometric_contingency: bool,
    pub read_confirmed_at: Option<Timestamp>,
    pub read_method: Option<ReadMethod>,
    pub next_gate: Option<Gate>,
}

pub struct Gatekeeper {
    stores: GateStores,
    policy: GatePolicy,
    code_providers: HashMap<Channel, Arc<dyn DeliveryProvider>>,
    biometric: Option<Arc<dyn BiometricProvider>>,
}

impl Gatekeeper {
    pub fn new(stores: GateStores, policy: GatePolicy) -> Self {
        Self {
            stores,
            policy,
            code_providers: HashMap::new(),
            biometric: None,
        }
    }

    pub fn with_code_provider(mut self, provider: Arc<dyn DeliveryProvider>) -> Self {
        self.code_providers.insert(provider.channel(), provider);
        self
    }

    pub fn with_biometric_provider(mut self, provider: Arc<dyn BiometricProvider>) -> Self {
        self.biometric = Some(provider);
        self
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    fn load(&self, notice_id: &NoticeId) -> GateResult<Notice> {
        self.stores
            .notices
            .get_notice(notice_id)?
            .ok_or(GateError::NotFound)
    }

    fn employee(&self, notice: &Notice) -> GateResult<EmployeeProfile> {
        self.stores
            .employees
            .employee(&notice.content.employee_id)?
            .ok_or(GateError::NotFound)
    }

    fn biometric_required(&self, notice: &Notice) -> GateResult<bool> {
        Ok(self.employee(notice)?.biometric_opt_in)
    }

    /// The first unsatisfied gate for this notice.
    fn next_gate(&self, notice: &Notice) -> GateResult<Option<Gate>> {
        if notice.identity_validated_at.is_none() {
            return Ok(Some(Gate::Credential));
        }
        if notice.code_validated_at.is_none() {
            return Ok(Some(Gate::OneTimeCode));
        }
        if notice.biometric_completed_at.is_none() && self.biometric_required(notice)? {
            return Ok(Some(Gate::Biometric));
        }
        if notice.read_confirmed_at.is_none() {
            return Ok(Some(Gate::ReadingConfirmation));
        }
        Ok(None)
    }

    /// Refuse a gate whose predecessors are not all satisfied.
    fn require_reached(&self, notice: &Notice, gate: Gate) -> GateResult<()> {
        let reached = match gate {
            Gate::Credential => notice.first_dispatched_at().is_some(),
            Gate::OneTimeCode => notice.identity_validated_at.is_some(),
            Gate::Biometric => notice.code_validated_at.is_some(),
            Gate::ReadingConfirmation => {
                notice.code_validated_at.is_some()
                    && (notice.biometric_completed_at.is_some()
                        || !self.biometric_required(notice)?)
            }
        };
        if reached {
            Ok(())
        } else {
            Err(GateError::OutOfOrder)
        }
    }

    /// Log the call, audit a fresh pass, hand the result back.
    fn finish<T>(
        &self,
        notice_id: &NoticeId,
        gate: Gate,
        context: &AccessContext,
        now: Timestamp,
        result: GateResult<T>,
        outcome_of: impl Fn(&T) -> GateOutcome,
    ) -> GateResult<T> {
        let outcome = match &result {
            Ok(value) => Some(outcome_of(value)),
            Err(e) => e.outcome(),
        };
        if let Some(outcome) = outcome {
            let detail = result.as_ref().err().map(|e| e.to_string());
            self.stores.gates.append_gate_log(&GateLogEntry {
                notice_id: notice_id.clone(),
                gate,
                at: now,
                context: context.clone(),
                outcome,
                detail,
            })?;
            match &result {
                Err(e) if e.is_lockout() => {
                    tracing::warn!(notice_id = %notice_id, gate = %gate, "gate locked");
                }
                Err(e) => {
                    tracing::info!(notice_id = %notice_id, gate = %gate, error = %e, "gate call failed");
                }
                Ok(_) => {}
            }
        }
        result
    }

    fn audit_pass(&self, pass: &GatePass, notice_id: &NoticeId) -> GateResult<()> {
        if pass.outcome == GateOutcome::Passed {
            self.stores.audit.append(AuditEvent::new(
                AuditEventKind::GatePassed {
                    notice_id: notice_id.clone(),
                    gate: pass.gate,
                    contingency: pass.contingency,
                },
                pass.at,
            ))?;
            tracing::info!(notice_id = %notice_id, gate = %pass.gate, contingency = pass.contingency, "gate passed");
        }
        Ok(())
    }

    fn pass_outcome(pass: &GatePass) -> GateOutcome {
        pass.outcome
    }

    /// Apply a gate milestone; a concurrent winner counts as satisfied.
    fn apply_milestone(
        &self,
        notice_id: &NoticeId,
        gate: Gate,
        mutation: NoticeMutation,
        now: Timestamp,
        stored: impl Fn(&Notice) -> Option<Timestamp>,
    ) -> GateResult<GatePass> {
        match self.stores.notices.apply_mutation(notice_id, &mutation)? {
            MutationOutcome::Applied => Ok(GatePass::passed(gate, now)),
            MutationOutcome::AlreadySet => {
                let notice = self.load(notice_id)?;
                let at = stored(&notice).ok_or(GateError::Internal)?;
                Ok(GatePass::already(gate, at))
            }
            MutationOutcome::Rejected(_) => Err(GateError::OutOfOrder),
        }
    }

    // -----------------------------------------------------------------------
    // Gate A
    // -----------------------------------------------------------------------

    pub fn verify_credential(
        &self,
        notice_id: &NoticeId,
        supplied: &str,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let result = self.load(notice_id).and_then(|notice| {
            let check = verify_credential(
                self.stores.notices.as_ref(),
                self.stores.employees.as_ref(),
                self.stores.gates.as_ref(),
                &notice,
                supplied,
                now,
            )?;
            let pass = if check.newly_validated {
                GatePass::passed(Gate::Credential, check.validated_at)
            } else {
                GatePass::already(Gate::Credential, check.validated_at)
            };
            self.audit_pass(&pass, notice_id)?;
            Ok(pass)
        });
        self.finish(notice_id, Gate::Credential, context, now, result, Self::pass_outcome)
    }

    // -----------------------------------------------------------------------
    // Gate B
    // -----------------------------------------------------------------------

    fn provider_for(&self, channel: Channel) -> GateResult<&Arc<dyn DeliveryProvider>> {
        self.code_providers
            .get(&channel)
            .ok_or(GateError::ProviderUnavailable)
    }

    async fn send_code(
        &self,
        notice: &Notice,
        channel: Channel,
        now: Timestamp,
    ) -> GateResult<IssuedCode> {
        let employee = self.employee(notice)?;
        let destination = employee
            .destination(channel)
            .ok_or(GateError::InvalidInput)?;
        let provider = self.provider_for(channel)?;
        issue_code(
            self.stores.codes.as_ref(),
            provider.as_ref(),
            destination,
            CodeSubject::Notice(notice.id.clone()),
            self.policy.code,
            self.policy.provider_timeout,
            now,
        )
        .await
    }

    pub async fn request_code(
        &self,
        notice_id: &NoticeId,
        channel: Channel,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<IssuedCode> {
        let result = match self.load(notice_id) {
            Ok(notice) => match self.require_reached(&notice, Gate::OneTimeCode) {
                Ok(()) if notice.code_validated_at.is_some() => Err(GateError::NotRequired),
                Ok(()) => self.send_code(&notice, channel, now).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        self.finish(notice_id, Gate::OneTimeCode, context, now, result, |_| {
            GateOutcome::Issued
        })
    }

    pub fn verify_code(
        &self,
        notice_id: &NoticeId,
        code: &str,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let result = self.load(notice_id).and_then(|notice| {
            if let Some(at) = notice.code_validated_at {
                return Ok(GatePass::already(Gate::OneTimeCode, at));
            }
            self.require_reached(&notice, Gate::OneTimeCode)?;
            verify_code(
                self.stores.codes.as_ref(),
                &CodeSubject::Notice(notice_id.clone()),
                code,
                now,
            )?;
            let pass = self.apply_milestone(
                notice_id,
                Gate::OneTimeCode,
                NoticeMutation::CodeValidated { at: now },
                now,
                |n| n.code_validated_at,
            )?;
            self.audit_pass(&pass, notice_id)?;
            Ok(pass)
        });
        self.finish(notice_id, Gate::OneTimeCode, context, now, result, Self::pass_outcome)
    }

    // -----------------------------------------------------------------------
    // Gate C
    // -----------------------------------------------------------------------

    /// Checks shared by every biometric entry point. `Ok(Some)` means the
    /// gate is already satisfied.
    fn biometric_preflight(&self, notice: &Notice) -> GateResult<Option<GatePass>> {
        if let Some(at) = notice.biometric_completed_at {
            let mut pass = GatePass::already(Gate::Biometric, at);
            pass.contingency = notice.biometric_contingency;
            return Ok(Some(pass));
        }
        self.require_reached(notice, Gate::Biometric)?;
        if !self.biometric_required(notice)? {
            return Err(GateError::NotRequired);
        }
        Ok(None)
    }

    fn complete_biometric(
        &self,
        notice_id: &NoticeId,
        contingency: bool,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let mut pass = self.apply_milestone(
            notice_id,
            Gate::Biometric,
            NoticeMutation::BiometricCompleted { at: now, contingency },
            now,
            |n| n.biometric_completed_at,
        )?;
        if pass.outcome == GateOutcome::Passed {
            pass.contingency = contingency;
        } else {
            pass.contingency = self.load(notice_id)?.biometric_contingency;
        }
        self.audit_pass(&pass, notice_id)?;
        Ok(pass)
    }

    fn check<'a>(&'a self, provider: &'a Arc<dyn BiometricProvider>) -> BiometricCheck<'a> {
        BiometricCheck {
            repo: self.stores.biometrics.as_ref(),
            provider: provider.as_ref(),
            timeout: self.policy.provider_timeout,
        }
    }

    async fn run_biometric(
        &self,
        notice_id: &NoticeId,
        session_id: &str,
        enroll: bool,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let notice = self.load(notice_id)?;
        if let Some(pass) = self.biometric_preflight(&notice)? {
            return Ok(pass);
        }
        if session_id.trim().is_empty() {
            return Err(GateError::InvalidInput);
        }
        let provider = self.biometric.as_ref().ok_or(GateError::ProviderUnavailable)?;
        let employee_id = &notice.content.employee_id;
        if enroll {
            self.check(provider)
                .enroll(notice_id, employee_id, session_id, now)
                .await?;
        } else {
            self.check(provider)
                .verify(notice_id, employee_id, session_id, now)
                .await?;
        }
        self.complete_biometric(notice_id, false, now)
    }

    /// First-ever biometric access: enrollment satisfies the gate.
    pub async fn enroll_biometric(
        &self,
        notice_id: &NoticeId,
        session_id: &str,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let result = self.run_biometric(notice_id, session_id, true, now).await;
        self.finish(notice_id, Gate::Biometric, context, now, result, Self::pass_outcome)
    }

    pub async fn verify_biometric(
        &self,
        notice_id: &NoticeId,
        session_id: &str,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let result = self.run_biometric(notice_id, session_id, false, now).await;
        self.finish(notice_id, Gate::Biometric, context, now, result, Self::pass_outcome)
    }

    async fn open_contingency_path(
        &self,
        notice_id: &NoticeId,
        report: &DeviceCapabilityReport,
        channel: Channel,
        now: Timestamp,
    ) -> GateResult<ContingencyTicket> {
        let notice = self.load(notice_id)?;
        if self.biometric_preflight(&notice)?.is_some() {
            return Err(GateError::NotRequired);
        }
        let reasons = contingency_reasons(self.stores.biometrics.as_ref(), notice_id, report)?;
        if reasons.is_empty() {
            return Err(GateError::ContingencyUnavailable);
        }
        let code = self.send_code(&notice, channel, now).await?;
        record_contingency_activation(
            self.stores.biometrics.as_ref(),
            notice_id,
            &notice.content.employee_id,
            reasons.clone(),
            now,
        )?;
        tracing::warn!(notice_id = %notice_id, reasons = ?reasons, "biometric contingency activated");
        Ok(ContingencyTicket { reasons, code })
    }

    /// Fall back to a one-time code when the capture cannot be completed.
    pub async fn activate_contingency(
        &self,
        notice_id: &NoticeId,
        report: &DeviceCapabilityReport,
        channel: Channel,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<ContingencyTicket> {
        let result = self
            .open_contingency_path(notice_id, report, channel, now)
            .await;
        self.finish(notice_id, Gate::Biometric, context, now, result, |_| {
            GateOutcome::ContingencyActivated
        })
    }

    pub fn verify_contingency(
        &self,
        notice_id: &NoticeId,
        code: &str,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let result = self.load(notice_id).and_then(|notice| {
            if let Some(pass) = self.biometric_preflight(&notice)? {
                return Ok(pass);
            }
            let activation = open_contingency(self.stores.biometrics.as_ref(), notice_id)?
                .ok_or(GateError::OutOfOrder)?;
            verify_code(
                self.stores.codes.as_ref(),
                &CodeSubject::Notice(notice_id.clone()),
                code,
                now,
            )?;
            record_contingency_pass(self.stores.biometrics.as_ref(), &activation, now)?;
            self.complete_biometric(notice_id, true, now)
        });
        self.finish(notice_id, Gate::Biometric, context, now, result, Self::pass_outcome)
    }

    // -----------------------------------------------------------------------
    // Content and Gate D
    // -----------------------------------------------------------------------

    /// The notice body, revealed once every identity gate is satisfied.
    pub fn reveal_content(&self, notice_id: &NoticeId) -> GateResult<NoticeContent> {
        let notice = self.load(notice_id)?;
        self.require_reached(&notice, Gate::ReadingConfirmation)?;
        Ok(notice.content)
    }

    pub fn comprehension_challenge(
        &self,
        notice_id: &NoticeId,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<ChallengePrompt> {
        let result = self.load(notice_id).and_then(|notice| {
            self.require_reached(&notice, Gate::ReadingConfirmation)?;
            let challenge = load_or_issue(
                self.stores.gates.as_ref(),
                notice_id,
                &notice.content,
                self.policy.comprehension_attempts,
                now,
            )?;
            Ok(ChallengePrompt::render(&challenge, &notice.content))
        });
        self.finish(
            notice_id,
            Gate::ReadingConfirmation,
            context,
            now,
            result,
            |_| GateOutcome::Issued,
        )
    }

    fn confirm_read(
        &self,
        notice_id: &NoticeId,
        method: ReadMethod,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let pass = self.apply_milestone(
            notice_id,
            Gate::ReadingConfirmation,
            NoticeMutation::ReadConfirmed { at: now, method },
            now,
            |n| n.read_confirmed_at,
        )?;
        if pass.outcome == GateOutcome::Passed {
            self.stores.audit.append(AuditEvent::new(
                AuditEventKind::ReadConfirmed {
                    notice_id: notice_id.clone(),
                    method,
                },
                now,
            ))?;
        }
        self.audit_pass(&pass, notice_id)?;
        Ok(pass)
    }

    pub fn answer_comprehension(
        &self,
        notice_id: &NoticeId,
        answer: &str,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let result = self.load(notice_id).and_then(|notice| {
            if let Some(at) = notice.read_confirmed_at {
                return Ok(GatePass::already(Gate::ReadingConfirmation, at));
            }
            self.require_reached(&notice, Gate::ReadingConfirmation)?;
            match submit_answer(
                self.stores.gates.as_ref(),
                notice_id,
                &notice.content,
                answer,
                now,
            )? {
                AnswerOutcome::Passed { at } | AnswerOutcome::AlreadyPassed { at } => {
                    self.confirm_read(notice_id, ReadMethod::ComprehensionChallenge, at)
                }
            }
        });
        self.finish(
            notice_id,
            Gate::ReadingConfirmation,
            context,
            now,
            result,
            Self::pass_outcome,
        )
    }

    /// Legacy reading confirmation by affirmative declaration. Refused while
    /// a comprehension challenge for the notice is locked.
    pub fn confirm_by_declaration(
        &self,
        notice_id: &NoticeId,
        accepted: bool,
        context: &AccessContext,
        now: Timestamp,
    ) -> GateResult<GatePass> {
        let result = self.load(notice_id).and_then(|notice| {
            if let Some(at) = notice.read_confirmed_at {
                return Ok(GatePass::already(Gate::ReadingConfirmation, at));
            }
            self.require_reached(&notice, Gate::ReadingConfirmation)?;
            if !accepted {
                return Err(GateError::DeclarationRequired);
            }
            if let Some(challenge) = self.stores.gates.get_challenge(notice_id)? {
                if challenge.is_locked() {
                    return Err(GateError::ChallengeLocked);
                }
            }
            self.confirm_read(notice_id, ReadMethod::Checkbox, now)
        });
        self.finish(
            notice_id,
            Gate::ReadingConfirmation,
            context,
            now,
            result,
            Self::pass_outcome,
        )
    }

    /// Manual override of a locked comprehension challenge.
    pub fn reset_comprehension(
        &self,
        notice_id: &NoticeId,
        operator: &str,
        now: Timestamp,
    ) -> GateResult<ChallengePrompt> {
        let notice = self.load(notice_id)?;
        let challenge = reset_challenge(self.stores.gates.as_ref(), notice_id, now)?;
        self.stores.audit.append(AuditEvent::new(
            AuditEventKind::ComprehensionReset {
                notice_id: notice_id.clone(),
                operator: operator.to_string(),
            },
            now,
        ))?;
        tracing::info!(notice_id = %notice_id, resets = challenge.resets, "comprehension challenge reset");
        Ok(ChallengePrompt::render(&challenge, &notice.content))
    }

    pub fn progress(&self, notice_id: &NoticeId) -> GateResult<GateProgress> {
        let notice = self.load(notice_id)?;
        Ok(GateProgress {
            notice_id: notice.id.clone(),
            identity_validated_at: notice.identity_validated_at,
            code_validated_at: notice.code_validated_at,
            biometric_required: self.biometric_required(&notice)?,
            biometric_completed_at: notice.biometric_completed_at,
            biometric_contingency: notice.biometric_contingency,
            read_confirmed_at: notice.read_confirmed_at,
            read_method: notice.read_method,
            next_gate: self.next_gate(&notice)?,
        })
    }

    pub fn gate_log(&self, notice_id: &NoticeId) -> GateResult<Vec<GateLogEntry>> {
        Ok(self.stores.gates.gate_log(notice_id)?)
    }
}
