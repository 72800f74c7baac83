//! Gate A: the accessor proves who they are by retyping an identifier from
//! the employee record.

use herald_core::{
    constant_time_eq, EmployeeDirectory, Gate, GateOutcome, GateRepository, MutationOutcome,
    Notice, NoticeMutation, NoticeRepository, Timestamp, SECONDS_PER_HOUR,
};

use crate::error::{GateError, GateResult};
use crate::normalize::{normalize_identifier, MAX_IDENTIFIER_LEN};

/// Failures inside the window that lock the gate.
pub const CREDENTIAL_MAX_FAILURES: u32 = 10;

/// Sliding window for the failure counter.
pub const CREDENTIAL_WINDOW_SECS: u64 = 24 * SECONDS_PER_HOUR;

/// Outcomes counted toward the lockout.
const COUNTED: [GateOutcome; 2] = [GateOutcome::Failed, GateOutcome::Invalid];

/// Result of a credential check: when identity was validated, and whether
/// this call did it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialCheck {
    pub validated_at: Timestamp,
    pub newly_validated: bool,
}

/// Failures recorded for the notice inside the window ending at `now`.
pub fn recent_failures(
    gates: &dyn GateRepository,
    notice: &Notice,
    now: Timestamp,
) -> GateResult<u32> {
    Ok(gates.count_gate_outcomes(
        &notice.id,
        Gate::Credential,
        &COUNTED,
        now.minus_seconds(CREDENTIAL_WINDOW_SECS),
    )?)
}

pub fn verify_credential(
    notices: &dyn NoticeRepository,
    employees: &dyn EmployeeDirectory,
    gates: &dyn GateRepository,
    notice: &Notice,
    supplied: &str,
    now: Timestamp,
) -> GateResult<CredentialCheck> {
    if let Some(at) = notice.identity_validated_at {
        return Ok(CredentialCheck {
            validated_at: at,
            newly_validated: false,
        });
    }
    if notice.first_dispatched_at().is_none() {
        return Err(GateError::OutOfOrder);
    }
    if recent_failures(gates, notice, now)? >= CREDENTIAL_MAX_FAILURES {
        return Err(GateError::LockedOut);
    }

    let candidate = normalize_identifier(supplied);
    if candidate.is_empty() || candidate.len() > MAX_IDENTIFIER_LEN {
        return Err(GateError::InvalidInput);
    }

    let employee = employees
        .employee(&notice.content.employee_id)?
        .ok_or(GateError::NotFound)?;
    let known = std::iter::once(employee.primary_identifier.as_str())
        .chain(employee.secondary_identifier.as_deref())
        .map(normalize_identifier)
        .filter(|id| !id.is_empty());

    let mut matched = false;
    for id in known {
        matched |= constant_time_eq(id.as_bytes(), candidate.as_bytes());
    }
    if !matched {
        return Err(GateError::CredentialMismatch);
    }

    match notices.apply_mutation(&notice.id, &NoticeMutation::IdentityValidated { at: now })? {
        MutationOutcome::Applied => Ok(CredentialCheck {
            validated_at: now,
            newly_validated: true,
        }),
        MutationOutcome::AlreadySet => {
            // A concurrent call won; report its timestamp.
            let stored = notices
                .get_notice(&notice.id)?
                .and_then(|n| n.identity_validated_at)
                .ok_or(GateError::Internal)?;
            Ok(CredentialCheck {
                validated_at: stored,
                newly_validated: false,
            })
        }
        MutationOutcome::Rejected(_) => Err(GateError::OutOfOrder),
    }
}
