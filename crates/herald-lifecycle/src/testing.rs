//! Fixtures shared by the lifecycle tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use herald_core::{
    AuditChainWriter, AuditEventKind, Channel, CompanyId, ContentHash, EmployeeId, HeraldResult,
    Notice, NoticeContent, NoticeId, NoticeMutation, NoticeRepository, ProviderMessageId,
    ReadMethod, SignedToken, TimestampAuthority, Timestamp,
};
use herald_ledger::{AuditChain, DualTimestamper, Ledger, LedgerSigner};
use herald_store::MemoryStore;

pub fn sample_content() -> NoticeContent {
    NoticeContent {
        employee_id: EmployeeId::new("e-1"),
        company_id: CompanyId::new("acme"),
        sanction_type: "Suspension".into(),
        sanction_days: 2,
        incident_date: NaiveDate::from_ymd_opt(2026, 4, 20).unwrap(),
        summary: "Late arrival".into(),
        body: "Arrived two hours late on three consecutive shifts.".into(),
    }
}

pub fn draft(id: &str) -> Notice {
    Notice::draft(
        NoticeId::new(id),
        sample_content(),
        ContentHash([4; 32]),
        Timestamp::from_seconds(1),
        None,
    )
}

/// Store a notice that was dispatched at `dispatched` and read at `read`.
pub fn read_confirmed(store: &MemoryStore, id: &str, dispatched: u64, read: u64) -> Notice {
    let notice = draft(id);
    store.insert_notice(&notice).unwrap();
    for mutation in [
        NoticeMutation::Dispatch {
            channel: Channel::Email,
            provider_message_id: ProviderMessageId::new(format!("m-{id}")),
            at: Timestamp::from_seconds(dispatched),
        },
        NoticeMutation::IdentityValidated {
            at: Timestamp::from_seconds(read),
        },
        NoticeMutation::ReadConfirmed {
            at: Timestamp::from_seconds(read),
            method: ReadMethod::ComprehensionChallenge,
        },
    ] {
        assert!(store.apply_mutation(&notice.id, &mutation).unwrap().is_applied());
    }
    store.get_notice(&notice.id).unwrap().unwrap()
}

pub fn audit_kinds(audit: &dyn AuditChainWriter) -> Vec<AuditEventKind> {
    audit
        .recent(1_000)
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

/// Time-stamp authority that stamps every hash immediately.
pub struct StubTsa;

#[async_trait]
impl TimestampAuthority for StubTsa {
    async fn stamp(&self, hash: &ContentHash) -> HeraldResult<SignedToken> {
        Ok(SignedToken {
            authority: "stub-tsa".into(),
            token: format!("tok-{}", &hash.to_hex()[..12]),
            stamped_at: Timestamp::from_seconds(1),
        })
    }
}

pub fn ledger(store: Arc<MemoryStore>, audit: Arc<AuditChain>) -> Arc<Ledger> {
    Arc::new(Ledger::new(
        store.clone(),
        store,
        audit,
        DualTimestamper::new(Some(Arc::new(StubTsa)), None, Duration::from_secs(5)),
        None,
        Arc::new(LedgerSigner::from_bytes([3; 32], "hr@acme")),
    ))
}
