//! Multi-channel dispatch.
//!
//! Channels go out concurrently, each behind its own circuit breaker and
//! timeout, so a slow SMS provider never holds up email. Successful sends
//! are recorded through the `Dispatch` mutation, which only writes a
//! channel's dispatch timestamp once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use herald_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, Channel, DeliveryProvider, DispatchRequest,
    EmployeeDirectory, HeraldError, MutationOutcome, NoticeId, NoticeMutation, NoticeRepository,
    ProviderMessageId, Timestamp,
};

use crate::circuit_breaker::{
    ChannelHealth, CircuitBreaker, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_SECS,
};
use crate::error::{DeliveryError, DeliveryResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Sent {
        message_id: ProviderMessageId,
        at: Timestamp,
    },
    AlreadyDispatched,
    NoDestination,
    NoProvider,
    CircuitOpen,
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub notice_id: NoticeId,
    pub channels: BTreeMap<Channel, ChannelOutcome>,
}

impl DispatchReport {
    pub fn sent(&self) -> usize {
        self.channels
            .values()
            .filter(|o| matches!(o, ChannelOutcome::Sent { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub timeout: Duration,
    pub breaker_threshold: u32,
    pub breaker_recovery_secs: u64,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            breaker_threshold: DEFAULT_FAILURE_THRESHOLD,
            breaker_recovery_secs: DEFAULT_RECOVERY_SECS,
        }
    }
}

pub struct Dispatcher {
    notices: Arc<dyn NoticeRepository>,
    employees: Arc<dyn EmployeeDirectory>,
    audit: Arc<dyn AuditChainWriter>,
    providers: HashMap<Channel, Arc<dyn DeliveryProvider>>,
    breakers: Mutex<HashMap<Channel, CircuitBreaker>>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        notices: Arc<dyn NoticeRepository>,
        employees: Arc<dyn EmployeeDirectory>,
        audit: Arc<dyn AuditChainWriter>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            notices,
            employees,
            audit,
            providers: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn DeliveryProvider>) -> Self {
        self.providers.insert(provider.channel(), provider);
        self
    }

    pub fn providers(&self) -> &HashMap<Channel, Arc<dyn DeliveryProvider>> {
        &self.providers
    }

    fn with_breaker<T>(
        &self,
        channel: Channel,
        f: impl FnOnce(&mut CircuitBreaker) -> T,
    ) -> DeliveryResult<T> {
        let mut breakers = self.breakers.lock().map_err(|_| DeliveryError::Internal)?;
        let breaker = breakers.entry(channel).or_insert_with(|| {
            CircuitBreaker::new(
                self.policy.breaker_threshold,
                self.policy.breaker_recovery_secs,
            )
        });
        Ok(f(breaker))
    }

    pub fn health(&self) -> DeliveryResult<BTreeMap<Channel, ChannelHealth>> {
        let breakers = self.breakers.lock().map_err(|_| DeliveryError::Internal)?;
        Ok(breakers
            .iter()
            .map(|(channel, breaker)| (*channel, breaker.health().clone()))
            .collect())
    }

    /// Hand the notice to every requested channel. Per-channel problems are
    /// reported in the result; only a missing or terminal notice is an error.
    pub async fn dispatch(
        &self,
        notice_id: &NoticeId,
        channels: &[Channel],
        now: Timestamp,
    ) -> DeliveryResult<DispatchReport> {
        let notice = self
            .notices
            .get_notice(notice_id)?
            .ok_or(DeliveryError::NotFound)?;
        if notice.state.is_terminal() {
            return Err(DeliveryError::TerminalState);
        }
        let employee = self.employees.employee(&notice.content.employee_id)?;

        let mut outcomes = BTreeMap::new();
        let mut pending: Vec<(Channel, Arc<dyn DeliveryProvider>, DispatchRequest)> = Vec::new();
        for channel in channels {
            if outcomes.contains_key(channel) || pending.iter().any(|(c, _, _)| c == channel) {
                continue;
            }
            let already = notice
                .channels
                .get(channel)
                .map(|c| c.dispatched_at.is_some())
                .unwrap_or(false);
            if already {
                outcomes.insert(*channel, ChannelOutcome::AlreadyDispatched);
                continue;
            }
            let Some(provider) = self.providers.get(channel) else {
                outcomes.insert(*channel, ChannelOutcome::NoProvider);
                continue;
            };
            let Some(destination) = employee.as_ref().and_then(|e| e.destination(*channel)) else {
                outcomes.insert(*channel, ChannelOutcome::NoDestination);
                continue;
            };
            if !self.with_breaker(*channel, |b| b.should_allow(now))? {
                tracing::warn!(
                    notice_id = %notice_id,
                    channel = %channel,
                    "circuit open, dispatch skipped"
                );
                outcomes.insert(*channel, ChannelOutcome::CircuitOpen);
                continue;
            }
            let request = DispatchRequest {
                notice_id: notice_id.clone(),
                destination: destination.to_string(),
                subject: format!("Notice {} from {}", notice_id, notice.content.company_id),
                content_hash: notice.content_hash,
            };
            pending.push((*channel, provider.clone(), request));
        }

        let timeout = self.policy.timeout;
        let results = join_all(pending.into_iter().map(|(channel, provider, request)| async move {
            let result = match tokio::time::timeout(timeout, provider.dispatch(&request)).await {
                Ok(result) => result,
                Err(_) => Err(HeraldError::ProviderTimeout(channel.to_string())),
            };
            (channel, result)
        }))
        .await;

        for (channel, result) in results {
            let outcome = match result {
                Ok(message_id) => {
                    self.with_breaker(channel, |b| b.record_success(now))?;
                    self.record_dispatch(notice_id, channel, message_id, now)?
                }
                Err(e) => {
                    self.with_breaker(channel, |b| b.record_failure(now))?;
                    tracing::warn!(
                        notice_id = %notice_id,
                        channel = %channel,
                        error = %e,
                        "dispatch failed"
                    );
                    ChannelOutcome::Failed {
                        reason: if matches!(e, HeraldError::ProviderTimeout(_)) {
                            "provider timeout".into()
                        } else {
                            "provider error".into()
                        },
                    }
                }
            };
            outcomes.insert(channel, outcome);
        }

        Ok(DispatchReport {
            notice_id: notice_id.clone(),
            channels: outcomes,
        })
    }

    fn record_dispatch(
        &self,
        notice_id: &NoticeId,
        channel: Channel,
        message_id: ProviderMessageId,
        now: Timestamp,
    ) -> DeliveryResult<ChannelOutcome> {
        let mutation = NoticeMutation::Dispatch {
            channel,
            provider_message_id: message_id.clone(),
            at: now,
        };
        match self.notices.apply_mutation(notice_id, &mutation)? {
            MutationOutcome::Applied => {
                self.audit.append(AuditEvent::new(
                    AuditEventKind::NoticeDispatched {
                        notice_id: notice_id.clone(),
                        channel,
                    },
                    now,
                ))?;
                tracing::info!(
                    notice_id = %notice_id,
                    channel = %channel,
                    message_id = %message_id,
                    "notice dispatched"
                );
                Ok(ChannelOutcome::Sent {
                    message_id,
                    at: now,
                })
            }
            MutationOutcome::AlreadySet => Ok(ChannelOutcome::AlreadyDispatched),
            MutationOutcome::Rejected(reason) => {
                tracing::warn!(
                    notice_id = %notice_id,
                    channel = %channel,
                    reason = %reason,
                    "dispatch not recorded"
                );
                Err(DeliveryError::TerminalState)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{draft_notice, seed_employee, AuditLog, Behavior, FakeProvider};
    use herald_core::LifecycleState;
    use herald_store::MemoryStore;

    fn dispatcher(
        store: &Arc<MemoryStore>,
        email: &Arc<FakeProvider>,
        sms: &Arc<FakeProvider>,
    ) -> Dispatcher {
        Dispatcher::new(
            store.clone(),
            store.clone(),
            Arc::new(AuditLog::default()),
            DispatchPolicy {
                timeout: Duration::from_secs(2),
                breaker_threshold: 2,
                breaker_recovery_secs: 60,
            },
        )
        .with_provider(email.clone())
        .with_provider(sms.clone())
    }

    #[tokio::test]
    async fn test_dispatch_records_each_channel() {
        let store = Arc::new(MemoryStore::new());
        seed_employee(&store);
        let notice = draft_notice(&store, "n-1");
        let email = Arc::new(FakeProvider::new(Channel::Email));
        let sms = Arc::new(FakeProvider::new(Channel::Sms));
        let d = dispatcher(&store, &email, &sms);

        let now = Timestamp::from_seconds(100);
        let report = d
            .dispatch(&notice.id, &[Channel::Email, Channel::Sms], now)
            .await
            .unwrap();
        assert_eq!(report.sent(), 2);

        let stored = store.get_notice(&notice.id).unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Dispatched);
        assert_eq!(stored.channels[&Channel::Sms].dispatched_at, Some(now));
        assert_eq!(
            email.dispatched.lock().unwrap()[0].destination,
            "worker@example.com"
        );

        let again = d
            .dispatch(&notice.id, &[Channel::Email], Timestamp::from_seconds(200))
            .await
            .unwrap();
        assert_eq!(
            again.channels[&Channel::Email],
            ChannelOutcome::AlreadyDispatched
        );
        assert_eq!(email.dispatched.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_channel_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        seed_employee(&store);
        let notice = draft_notice(&store, "n-1");
        let email = Arc::new(FakeProvider::new(Channel::Email));
        let sms = Arc::new(FakeProvider::new(Channel::Sms));
        sms.set_dispatch(Behavior::Hang);
        let d = dispatcher(&store, &email, &sms);

        let report = d
            .dispatch(
                &notice.id,
                &[Channel::Email, Channel::Sms],
                Timestamp::from_seconds(100),
            )
            .await
            .unwrap();
        assert!(matches!(
            report.channels[&Channel::Email],
            ChannelOutcome::Sent { .. }
        ));
        assert_eq!(
            report.channels[&Channel::Sms],
            ChannelOutcome::Failed {
                reason: "provider timeout".into()
            }
        );
        let stored = store.get_notice(&notice.id).unwrap().unwrap();
        assert!(!stored.channels.contains_key(&Channel::Sms));
    }

    #[tokio::test]
    async fn test_breaker_opens_per_channel() {
        let store = Arc::new(MemoryStore::new());
        seed_employee(&store);
        let email = Arc::new(FakeProvider::new(Channel::Email));
        let sms = Arc::new(FakeProvider::new(Channel::Sms));
        sms.set_dispatch(Behavior::Fail);
        let d = dispatcher(&store, &email, &sms);

        for id in ["n-1", "n-2"] {
            let notice = draft_notice(&store, id);
            d.dispatch(&notice.id, &[Channel::Sms], Timestamp::from_seconds(10))
                .await
                .unwrap();
        }
        let notice = draft_notice(&store, "n-3");
        let report = d
            .dispatch(
                &notice.id,
                &[Channel::Sms, Channel::Email],
                Timestamp::from_seconds(20),
            )
            .await
            .unwrap();
        assert_eq!(report.channels[&Channel::Sms], ChannelOutcome::CircuitOpen);
        assert!(matches!(
            report.channels[&Channel::Email],
            ChannelOutcome::Sent { .. }
        ));

        sms.set_dispatch(Behavior::Ok);
        let report = d
            .dispatch(&notice.id, &[Channel::Sms], Timestamp::from_seconds(90))
            .await
            .unwrap();
        assert!(matches!(
            report.channels[&Channel::Sms],
            ChannelOutcome::Sent { .. }
        ));
        let health = d.health().unwrap();
        assert_eq!(health[&Channel::Sms].total_failures, 2);
    }

    #[tokio::test]
    async fn test_missing_provider_destination_and_notice() {
        let store = Arc::new(MemoryStore::new());
        let notice = draft_notice(&store, "n-1");
        let email = Arc::new(FakeProvider::new(Channel::Email));
        let sms = Arc::new(FakeProvider::new(Channel::Sms));
        let d = dispatcher(&store, &email, &sms);

        let report = d
            .dispatch(
                &notice.id,
                &[Channel::Email, Channel::Whatsapp],
                Timestamp::from_seconds(1),
            )
            .await
            .unwrap();
        assert_eq!(report.channels[&Channel::Email], ChannelOutcome::NoDestination);
        assert_eq!(report.channels[&Channel::Whatsapp], ChannelOutcome::NoProvider);
        assert_eq!(report.sent(), 0);

        assert_eq!(
            d.dispatch(&NoticeId::new("missing"), &[Channel::Email], Timestamp::from_seconds(1))
                .await,
            Err(DeliveryError::NotFound)
        );
    }
}
