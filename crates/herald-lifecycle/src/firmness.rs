//! Firmness promotion.
//!
//! A notice read-confirmed at least thirty days ago, with no impugnment
//! recorded, becomes firm. The period is a legal constant and is not
//! configurable per tenant.

use serde::{Deserialize, Serialize};

use herald_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, FirmBasis, MutationOutcome, NoticeFilter,
    NoticeMutation, NoticeRepository, Timestamp, FIRMNESS_PERIOD_SECS,
};

use crate::error::LifecycleResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmnessReport {
    pub reviewed: u32,
    pub promoted: u32,
    pub errors: u32,
}

/// Promote every due notice. Each row is a conditional update, so a
/// concurrent run or a racing impugnment can only make a row a no-op.
pub fn promote_due_notices(
    notices: &dyn NoticeRepository,
    audit: &dyn AuditChainWriter,
    now: Timestamp,
    limit: usize,
) -> LifecycleResult<FirmnessReport> {
    let filter = NoticeFilter::DueForFirmness {
        read_before: now.minus_seconds(FIRMNESS_PERIOD_SECS),
    };
    let mut report = FirmnessReport::default();

    for notice in notices.select_notices(&filter, limit)? {
        report.reviewed += 1;
        let mutation = NoticeMutation::PromoteFirm {
            at: now,
            basis: FirmBasis::AutoPromoted,
        };
        match notices.apply_mutation(&notice.id, &mutation) {
            Ok(MutationOutcome::Applied) => {
                report.promoted += 1;
                tracing::info!(notice_id = %notice.id, "notice promoted to firm");
                if let Err(e) = audit.append(AuditEvent::new(
                    AuditEventKind::FirmPromoted {
                        notice_id: notice.id.clone(),
                        basis: FirmBasis::AutoPromoted,
                    },
                    now,
                )) {
                    tracing::error!(notice_id = %notice.id, error = %e, "audit append failed");
                    report.errors += 1;
                }
            }
            Ok(MutationOutcome::AlreadySet) => {}
            Ok(MutationOutcome::Rejected(reason)) => {
                tracing::debug!(notice_id = %notice.id, %reason, "promotion skipped");
            }
            Err(e) => {
                tracing::warn!(notice_id = %notice.id, error = %e, "promotion failed");
                report.errors += 1;
            }
        }
    }

    tracing::info!(
        reviewed = report.reviewed,
        promoted = report.promoted,
        errors = report.errors,
        "firmness promotion finished"
    );
    Ok(report)
}
