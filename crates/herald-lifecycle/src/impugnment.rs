//! Recording an impugnment and its resolution.
//!
//! An impugnment can only be lodged against a read-confirmed notice. If the
//! impugnment is declined the notice becomes firm with basis
//! `ImpugnmentDeclined`, which renders like an auto-promoted notice but stays
//! distinguishable for reporting. An upheld impugnment leaves the notice in
//! `impugned`.

use serde::{Deserialize, Serialize};

use herald_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, FirmBasis, LifecycleState, MutationOutcome,
    Notice, NoticeId, NoticeMutation, NoticeRepository, RejectReason, Timestamp,
};

use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpugnmentResolution {
    Declined,
    Upheld,
}

fn load(notices: &dyn NoticeRepository, id: &NoticeId) -> LifecycleResult<Notice> {
    notices.get_notice(id)?.ok_or(LifecycleError::NotFound)
}

fn rejected(reason: RejectReason, current: LifecycleState, to: LifecycleState) -> LifecycleError {
    match reason {
        RejectReason::InvalidTransition { from, to } => {
            LifecycleError::InvalidTransition { from, to }
        }
        _ => LifecycleError::InvalidTransition { from: current, to },
    }
}

/// Record an impugnment. Recording it twice is a no-op.
pub fn record_impugnment(
    notices: &dyn NoticeRepository,
    audit: &dyn AuditChainWriter,
    id: &NoticeId,
    now: Timestamp,
) -> LifecycleResult<Notice> {
    let current = load(notices, id)?;
    match notices.apply_mutation(id, &NoticeMutation::Impugn { at: now })? {
        MutationOutcome::Applied => {
            audit.append(AuditEvent::new(
                AuditEventKind::ImpugnmentRecorded {
                    notice_id: id.clone(),
                },
                now,
            ))?;
            tracing::info!(notice_id = %id, "impugnment recorded");
        }
        MutationOutcome::AlreadySet => {}
        MutationOutcome::Rejected(reason) => {
            return Err(rejected(reason, current.state, LifecycleState::Impugned));
        }
    }
    load(notices, id)
}

pub fn resolve_impugnment(
    notices: &dyn NoticeRepository,
    audit: &dyn AuditChainWriter,
    id: &NoticeId,
    resolution: ImpugnmentResolution,
    now: Timestamp,
) -> LifecycleResult<Notice> {
    let current = load(notices, id)?;
    if current.impugned_at.is_none() {
        return Err(LifecycleError::InvalidTransition {
            from: current.state,
            to: LifecycleState::Firm,
        });
    }

    match resolution {
        ImpugnmentResolution::Upheld => {
            tracing::info!(notice_id = %id, "impugnment upheld");
            Ok(current)
        }
        ImpugnmentResolution::Declined => {
            let mutation = NoticeMutation::PromoteFirm {
                at: now,
                basis: FirmBasis::ImpugnmentDeclined,
            };
            match notices.apply_mutation(id, &mutation)? {
                MutationOutcome::Applied => {
                    audit.append(AuditEvent::new(
                        AuditEventKind::FirmPromoted {
                            notice_id: id.clone(),
                            basis: FirmBasis::ImpugnmentDeclined,
                        },
                        now,
                    ))?;
                    tracing::info!(notice_id = %id, "impugnment declined, notice firm");
                }
                MutationOutcome::AlreadySet => {}
                MutationOutcome::Rejected(reason) => {
                    return Err(rejected(reason, current.state, LifecycleState::Firm));
                }
            }
            load(notices, id)
        }
    }
}
