//! The physical notification track.
//!
//! Subsidiarity activation moves a notice to `physical-required`; the issuing
//! party then records the non-digital delivery here.

use herald_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, MutationOutcome, Notice, NoticeId,
    NoticeMutation, NoticeRepository, Timestamp,
};

use crate::error::{LifecycleError, LifecycleResult};

pub fn record_physical_dispatch(
    notices: &dyn NoticeRepository,
    audit: &dyn AuditChainWriter,
    id: &NoticeId,
    now: Timestamp,
) -> LifecycleResult<Notice> {
    match notices.apply_mutation(id, &NoticeMutation::PhysicalDispatched { at: now })? {
        MutationOutcome::Applied => {
            audit.append(AuditEvent::new(
                AuditEventKind::PhysicalDispatched {
                    notice_id: id.clone(),
                },
                now,
            ))?;
            tracing::info!(notice_id = %id, "physical notification dispatched");
        }
        MutationOutcome::AlreadySet => {}
        MutationOutcome::Rejected(_) => return Err(LifecycleError::PhysicalNotRequired),
    }
    notices.get_notice(id)?.ok_or(LifecycleError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::{derive_semaphore, Semaphore};
    use crate::testing::{audit_kinds, draft};
    use herald_core::{Channel, PhysicalTrack, ProviderMessageId};
    use herald_ledger::AuditChain;
    use herald_store::MemoryStore;

    fn t(s: u64) -> Timestamp {
        Timestamp::from_seconds(s)
    }

    #[test]
    fn test_dispatch_after_requirement() {
        let store = MemoryStore::new();
        let audit = AuditChain::new();
        let notice = draft("n-1");
        store.insert_notice(&notice).unwrap();
        store
            .apply_mutation(
                &notice.id,
                &NoticeMutation::Dispatch {
                    channel: Channel::Sms,
                    provider_message_id: ProviderMessageId::new("sm-1"),
                    at: t(10),
                },
            )
            .unwrap();
        store
            .apply_mutation(&notice.id, &NoticeMutation::RequirePhysical { at: t(20) })
            .unwrap();

        let updated = record_physical_dispatch(&store, &audit, &notice.id, t(30)).unwrap();
        assert_eq!(updated.physical_track, PhysicalTrack::Dispatched);
        assert_eq!(updated.physical_dispatched_at, Some(t(30)));
        assert_eq!(derive_semaphore(&updated, t(40)), Semaphore::PhysicalDispatched);

        let again = record_physical_dispatch(&store, &audit, &notice.id, t(50)).unwrap();
        assert_eq!(again.physical_dispatched_at, Some(t(30)));
        assert_eq!(audit_kinds(&audit).len(), 1);
    }

    #[test]
    fn test_rejected_when_never_required() {
        let store = MemoryStore::new();
        let audit = AuditChain::new();
        let notice = draft("n-1");
        store.insert_notice(&notice).unwrap();
        assert_eq!(
            record_physical_dispatch(&store, &audit, &notice.id, t(5)).unwrap_err(),
            LifecycleError::PhysicalNotRequired
        );
    }
}
