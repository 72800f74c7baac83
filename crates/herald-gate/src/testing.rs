//! Fixtures shared by the gate tests.

use chrono::NaiveDate;
use herald_core::{
    Channel, CompanyId, ContentHash, EmployeeDirectory, EmployeeId, EmployeeProfile, Notice,
    NoticeContent, NoticeId, NoticeMutation, NoticeRepository, ProviderMessageId, Timestamp,
};
use herald_store::MemoryStore;

pub fn sample_content() -> NoticeContent {
    NoticeContent {
        employee_id: EmployeeId::new("e-1"),
        company_id: CompanyId::new("acme"),
        sanction_type: "Suspensión".into(),
        sanction_days: 3,
        incident_date: NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
        summary: "Unjustified absence".into(),
        body: "Absent from the assigned shift without notice.".into(),
    }
}

pub fn seed_employee(store: &MemoryStore, biometric_opt_in: bool) {
    store
        .upsert_employee(&EmployeeProfile {
            employee_id: EmployeeId::new("e-1"),
            company_id: CompanyId::new("acme"),
            primary_identifier: "12.345.678-K".into(),
            secondary_identifier: Some("EMP-0042".into()),
            email: Some("worker@example.com".into()),
            phone: Some("+5491100000000".into()),
            biometric_opt_in,
        })
        .unwrap();
}

/// A notice dispatched by email at t=1000.
pub fn dispatched_notice(store: &MemoryStore, id: &str) -> Notice {
    let notice = Notice::draft(
        NoticeId::new(id),
        sample_content(),
        ContentHash([1; 32]),
        Timestamp::from_seconds(900),
        None,
    );
    store.insert_notice(&notice).unwrap();
    store
        .apply_mutation(
            &notice.id,
            &NoticeMutation::Dispatch {
                channel: Channel::Email,
                provider_message_id: ProviderMessageId::new(format!("m-{id}")),
                at: Timestamp::from_seconds(1_000),
            },
        )
        .unwrap();
    store.get_notice(&notice.id).unwrap().unwrap()
}
