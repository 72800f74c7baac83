//! Gate C: facial biometrics, for employees who opted in.
//!
//! The first access enrolls a reference template from a liveness capture.
//! Later accesses need a fresh liveness capture whose similarity to the
//! template reaches [`SIMILARITY_THRESHOLD`]. When the device or the
//! provider cannot complete the check, the contingency path falls back to a
//! one-time code and is recorded as such.

use std::time::{Duration, Instant};

use herald_core::{
    sha256, AttemptId, BiometricAttempt, BiometricEnrollment, BiometricProvider,
    BiometricReference, BiometricRepository, ContingencyReason, EmployeeId, EnrollmentId,
    GateOutcome, HeraldError, HeraldResult, NoticeId, Timestamp,
};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// Minimum face similarity (0-100) for a pass.
pub const SIMILARITY_THRESHOLD: f64 = 95.0;

/// Downlink below which connectivity is considered too poor for capture.
const MIN_DOWNLINK_MBPS: f64 = 0.5;

/// What the accessor's browser reports when a capture cannot start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilityReport {
    pub camera_available: Option<bool>,
    pub camera_permission_granted: Option<bool>,
    /// Media error name raised by the capture attempt, e.g. `NotAllowedError`.
    pub media_error: Option<String>,
    /// Effective connection type, e.g. `4g` or `slow-2g`.
    pub connection_type: Option<String>,
    pub downlink_mbps: Option<f64>,
}

impl DeviceCapabilityReport {
    /// Reasons a capture could not be completed, inferred from the report.
    pub fn infer_reasons(&self) -> Vec<ContingencyReason> {
        let mut reasons = Vec::new();
        let media_error = self.media_error.as_deref().unwrap_or_default();

        if self.camera_available == Some(false)
            || matches!(
                media_error,
                "NotFoundError" | "NotReadableError" | "OverconstrainedError" | "AbortError"
            )
        {
            reasons.push(ContingencyReason::CameraUnavailable);
        }
        if self.camera_permission_granted == Some(false)
            || matches!(media_error, "NotAllowedError" | "SecurityError")
        {
            reasons.push(ContingencyReason::CameraPermissionDenied);
        }
        let slow_type = matches!(
            self.connection_type.as_deref(),
            Some("slow-2g") | Some("2g")
        );
        let slow_link = self
            .downlink_mbps
            .map(|mbps| mbps < MIN_DOWNLINK_MBPS)
            .unwrap_or(false);
        if slow_type || slow_link {
            reasons.push(ContingencyReason::PoorConnectivity);
        }
        reasons
    }
}

fn provider_reason(e: &HeraldError) -> ContingencyReason {
    match e {
        HeraldError::ProviderTimeout(_) => ContingencyReason::ProviderTimeout,
        _ => ContingencyReason::ProviderError,
    }
}

async fn bounded<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = HeraldResult<T>>,
) -> HeraldResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(HeraldError::ProviderTimeout("biometric provider".into())),
    }
}

/// Attempt record under construction.
struct AttemptLog {
    started: Instant,
    attempt: BiometricAttempt,
}

impl AttemptLog {
    fn start(notice_id: &NoticeId, employee_id: &EmployeeId, now: Timestamp) -> Self {
        Self {
            started: Instant::now(),
            attempt: BiometricAttempt {
                id: AttemptId::generate(),
                notice_id: notice_id.clone(),
                employee_id: employee_id.clone(),
                at: now,
                liveness_confidence: None,
                similarity: None,
                outcome: GateOutcome::Failed,
                contingency: false,
                contingency_reasons: Vec::new(),
                provider_calls: 0,
                duration_ms: 0,
            },
        }
    }

    fn finish(
        mut self,
        repo: &dyn BiometricRepository,
        outcome: GateOutcome,
    ) -> GateResult<BiometricAttempt> {
        self.attempt.outcome = outcome;
        self.attempt.duration_ms = self.started.elapsed().as_millis() as u64;
        repo.append_biometric_attempt(&self.attempt)?;
        Ok(self.attempt)
    }
}

/// Drives the biometric provider for one notice access.
pub struct BiometricCheck<'a> {
    pub repo: &'a dyn BiometricRepository,
    pub provider: &'a dyn BiometricProvider,
    pub timeout: Duration,
}

impl BiometricCheck<'_> {
    /// First-ever access: capture liveness and store the reference template.
    pub async fn enroll(
        &self,
        notice_id: &NoticeId,
        employee_id: &EmployeeId,
        session_id: &str,
        now: Timestamp,
    ) -> GateResult<BiometricAttempt> {
        if self.repo.get_enrollment(employee_id)?.is_some() {
            return Err(GateError::AlreadyEnrolled);
        }
        let mut log = AttemptLog::start(notice_id, employee_id, now);

        log.attempt.provider_calls += 1;
        let liveness = match bounded(self.timeout, self.provider.verify_liveness(session_id)).await
        {
            Ok(l) => l,
            Err(e) => return self.provider_failed(log, e),
        };
        log.attempt.liveness_confidence = Some(liveness.confidence);
        if !liveness.is_live {
            log.finish(self.repo, GateOutcome::Failed)?;
            return Err(GateError::BiometricRejected);
        }

        let enrollment = BiometricEnrollment {
            id: EnrollmentId::generate(),
            employee_id: employee_id.clone(),
            template_ref: liveness.reference.0.clone(),
            template_hash: sha256(liveness.reference.0.as_bytes()),
            liveness_confidence: liveness.confidence,
            enrolled_at: now,
        };
        if !self.repo.insert_enrollment(&enrollment)? {
            log.finish(self.repo, GateOutcome::OutOfOrder)?;
            return Err(GateError::AlreadyEnrolled);
        }
        tracing::info!(notice_id = %notice_id, "biometric enrollment stored");
        log.finish(self.repo, GateOutcome::Passed)
    }

    /// Fresh liveness capture compared against the enrolled template.
    pub async fn verify(
        &self,
        notice_id: &NoticeId,
        employee_id: &EmployeeId,
        session_id: &str,
        now: Timestamp,
    ) -> GateResult<BiometricAttempt> {
        let enrollment = self
            .repo
            .get_enrollment(employee_id)?
            .ok_or(GateError::NotEnrolled)?;
        let mut log = AttemptLog::start(notice_id, employee_id, now);

        log.attempt.provider_calls += 1;
        let liveness = match bounded(self.timeout, self.provider.verify_liveness(session_id)).await
        {
            Ok(l) => l,
            Err(e) => return self.provider_failed(log, e),
        };
        log.attempt.liveness_confidence = Some(liveness.confidence);
        if !liveness.is_live {
            log.finish(self.repo, GateOutcome::Failed)?;
            return Err(GateError::BiometricRejected);
        }

        log.attempt.provider_calls += 1;
        let enrolled = BiometricReference(enrollment.template_ref);
        let face = match bounded(
            self.timeout,
            self.provider.compare_faces(&enrolled, &liveness.reference),
        )
        .await
        {
            Ok(f) => f,
            Err(e) => return self.provider_failed(log, e),
        };
        log.attempt.similarity = Some(face.similarity);
        if face.similarity < SIMILARITY_THRESHOLD {
            tracing::warn!(notice_id = %notice_id, similarity = face.similarity, "face similarity below threshold");
            log.finish(self.repo, GateOutcome::Failed)?;
            return Err(GateError::BiometricRejected);
        }
        log.finish(self.repo, GateOutcome::Passed)
    }

    fn provider_failed(&self, mut log: AttemptLog, e: HeraldError) -> GateResult<BiometricAttempt> {
        tracing::warn!(notice_id = %log.attempt.notice_id, error = %e, "biometric provider failed");
        log.attempt.contingency_reasons.push(provider_reason(&e));
        log.finish(self.repo, GateOutcome::ProviderError)?;
        Err(GateError::ProviderUnavailable)
    }
}

/// Reasons for a contingency: what the device reports plus any provider
/// failure already recorded for this notice. Empty means the contingency
/// is not justified.
pub fn contingency_reasons(
    repo: &dyn BiometricRepository,
    notice_id: &NoticeId,
    report: &DeviceCapabilityReport,
) -> GateResult<Vec<ContingencyReason>> {
    let mut reasons = report.infer_reasons();
    for attempt in repo.biometric_attempts(notice_id)? {
        if attempt.outcome == GateOutcome::ProviderError {
            for reason in attempt.contingency_reasons {
                if !reasons.contains(&reason) {
                    reasons.push(reason);
                }
            }
        }
    }
    Ok(reasons)
}

/// Record that the contingency path was opened.
pub fn record_contingency_activation(
    repo: &dyn BiometricRepository,
    notice_id: &NoticeId,
    employee_id: &EmployeeId,
    reasons: Vec<ContingencyReason>,
    now: Timestamp,
) -> GateResult<BiometricAttempt> {
    let mut log = AttemptLog::start(notice_id, employee_id, now);
    log.attempt.contingency = true;
    log.attempt.contingency_reasons = reasons;
    log.finish(repo, GateOutcome::ContingencyActivated)
}

/// Most recent contingency activation for the notice, if any.
pub fn open_contingency(
    repo: &dyn BiometricRepository,
    notice_id: &NoticeId,
) -> GateResult<Option<BiometricAttempt>> {
    Ok(repo
        .biometric_attempts(notice_id)?
        .into_iter()
        .filter(|a| a.outcome == GateOutcome::ContingencyActivated)
        .max_by_key(|a| a.at))
}

/// Record the contingency code passing. The record carries the reasons of
/// the activation and is flagged so it is never mistaken for a biometric
/// pass.
pub fn record_contingency_pass(
    repo: &dyn BiometricRepository,
    activation: &BiometricAttempt,
    now: Timestamp,
) -> GateResult<BiometricAttempt> {
    let mut log = AttemptLog::start(&activation.notice_id, &activation.employee_id, now);
    log.attempt.contingency = true;
    log.attempt.contingency_reasons = activation.contingency_reasons.clone();
    log.finish(repo, GateOutcome::Passed)
}
