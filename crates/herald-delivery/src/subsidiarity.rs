//! Subsidiarity activation.
//!
//! A notice with no confirmed open 54 hours after dispatch, whose recipient
//! never reached the gatekeeper either, must also be delivered by physical
//! means. The flag is one-way: the job only ever sets
//! it and nothing here clears it.

use herald_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, MutationOutcome, NoticeFilter, NoticeMutation,
    NoticeRepository, Timestamp, SECONDS_PER_HOUR,
};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryResult;

/// Grace period between dispatch and mandatory physical delivery.
pub const SUBSIDIARITY_GRACE_SECS: u64 = 54 * SECONDS_PER_HOUR;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsidiarityReport {
    pub reviewed: u32,
    pub activated: u32,
    pub errors: u32,
}

pub fn activate_physical_fallback(
    notices: &dyn NoticeRepository,
    audit: &dyn AuditChainWriter,
    now: Timestamp,
    limit: usize,
) -> DeliveryResult<SubsidiarityReport> {
    let filter = NoticeFilter::PastSubsidiarityGrace {
        dispatched_before: now.minus_seconds(SUBSIDIARITY_GRACE_SECS),
    };
    let mut report = SubsidiarityReport::default();

    for notice in notices.select_notices(&filter, limit)? {
        report.reviewed += 1;
        match notices.apply_mutation(&notice.id, &NoticeMutation::RequirePhysical { at: now }) {
            Ok(MutationOutcome::Applied) => {
                report.activated += 1;
                tracing::info!(notice_id = %notice.id, "physical notification required");
                if let Err(e) = audit.append(AuditEvent::new(
                    AuditEventKind::PhysicalFallbackActivated {
                        notice_id: notice.id.clone(),
                    },
                    now,
                )) {
                    tracing::error!(notice_id = %notice.id, error = %e, "audit append failed");
                    report.errors += 1;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(notice_id = %notice.id, error = %e, "subsidiarity update failed");
                report.errors += 1;
            }
        }
    }

    tracing::info!(
        reviewed = report.reviewed,
        activated = report.activated,
        errors = report.errors,
        "subsidiarity activation finished"
    );
    Ok(report)
}
