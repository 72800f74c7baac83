//! Fixtures and fake providers for the delivery tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use herald_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, AuditHash, Channel, CompanyId, ContentHash,
    DeliveryProvider, DispatchRequest, EmployeeDirectory, EmployeeId, EmployeeProfile,
    HeraldError, HeraldResult, Notice, NoticeContent, NoticeId, NoticeMutation, NoticeRepository,
    ProviderEvent, ProviderMessageId, Timestamp,
};
use herald_store::MemoryStore;

pub fn sample_content() -> NoticeContent {
    NoticeContent {
        employee_id: EmployeeId::new("e-1"),
        company_id: CompanyId::new("acme"),
        sanction_type: "Written warning".into(),
        sanction_days: 0,
        incident_date: NaiveDate::from_ymd_opt(2026, 5, 2).unwrap(),
        summary: "Safety gear".into(),
        body: "Operated the press without protective gloves.".into(),
    }
}

pub fn seed_employee(store: &MemoryStore) {
    store
        .upsert_employee(&EmployeeProfile {
            employee_id: EmployeeId::new("e-1"),
            company_id: CompanyId::new("acme"),
            primary_identifier: "20111222".into(),
            secondary_identifier: None,
            email: Some("worker@example.com".into()),
            phone: Some("+5491100000000".into()),
            biometric_opt_in: false,
        })
        .unwrap();
}

pub fn draft_notice(store: &MemoryStore, id: &str) -> Notice {
    let notice = Notice::draft(
        NoticeId::new(id),
        sample_content(),
        ContentHash([2; 32]),
        Timestamp::from_seconds(1),
        None,
    );
    store.insert_notice(&notice).unwrap();
    notice
}

/// A notice dispatched on one channel with message id `m-<id>-<channel>`.
pub fn dispatched_notice(store: &MemoryStore, id: &str, channel: Channel, at: u64) -> Notice {
    let notice = draft_notice(store, id);
    store
        .apply_mutation(
            &notice.id,
            &NoticeMutation::Dispatch {
                channel,
                provider_message_id: ProviderMessageId::new(format!("m-{id}-{channel}")),
                at: Timestamp::from_seconds(at),
            },
        )
        .unwrap();
    store.get_notice(&notice.id).unwrap().unwrap()
}

/// Audit sink that keeps events in order without hashing.
#[derive(Default)]
pub struct AuditLog {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl AuditLog {
    /// Make every following append fail with a storage error.
    pub fn fail_appends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }
}

impl AuditChainWriter for AuditLog {
    fn append(&self, event: AuditEvent) -> HeraldResult<AuditHash> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HeraldError::Storage("audit log unavailable".into()));
        }
        let mut events = self.events.lock().unwrap();
        events.push(event);
        Ok(AuditHash([events.len() as u8; 32]))
    }

    fn verify_chain(&self) -> HeraldResult<bool> {
        Ok(true)
    }

    fn head(&self) -> HeraldResult<Option<AuditHash>> {
        Ok(None)
    }

    fn recent(&self, limit: usize) -> HeraldResult<Vec<AuditEvent>> {
        let events = self.events.lock().unwrap();
        let start = events.len().saturating_sub(limit);
        Ok(events[start..].to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Ok,
    Fail,
    Hang,
}

/// Scriptable delivery provider.
pub struct FakeProvider {
    channel: Channel,
    dispatch: Mutex<Behavior>,
    fetch: Mutex<Behavior>,
    events: Mutex<HashMap<ProviderMessageId, Vec<ProviderEvent>>>,
    pub dispatched: Mutex<Vec<DispatchRequest>>,
    pub fetches: AtomicU32,
}

impl FakeProvider {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            dispatch: Mutex::new(Behavior::Ok),
            fetch: Mutex::new(Behavior::Ok),
            events: Mutex::new(HashMap::new()),
            dispatched: Mutex::new(Vec::new()),
            fetches: AtomicU32::new(0),
        }
    }

    pub fn set_dispatch(&self, behavior: Behavior) {
        *self.dispatch.lock().unwrap() = behavior;
    }

    pub fn set_fetch(&self, behavior: Behavior) {
        *self.fetch.lock().unwrap() = behavior;
    }

    pub fn add_event(&self, event: ProviderEvent) {
        self.events
            .lock()
            .unwrap()
            .entry(event.message_id.clone())
            .or_default()
            .push(event);
    }

    async fn behave(behavior: Behavior) -> HeraldResult<()> {
        match behavior {
            Behavior::Ok => Ok(()),
            Behavior::Fail => Err(HeraldError::Provider("503 from provider".into())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DeliveryProvider for FakeProvider {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn dispatch(&self, request: &DispatchRequest) -> HeraldResult<ProviderMessageId> {
        let behavior = *self.dispatch.lock().unwrap();
        Self::behave(behavior).await?;
        self.dispatched.lock().unwrap().push(request.clone());
        Ok(ProviderMessageId::new(format!(
            "m-{}-{}",
            request.notice_id, self.channel
        )))
    }

    async fn fetch_events(
        &self,
        message_id: &ProviderMessageId,
    ) -> HeraldResult<Vec<ProviderEvent>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.fetch.lock().unwrap();
        Self::behave(behavior).await?;
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_code(&self, _destination: &str, _code: &str) -> HeraldResult<ProviderMessageId> {
        Ok(ProviderMessageId::new("code"))
    }
}
