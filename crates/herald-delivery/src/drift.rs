//! Drift correction.
//!
//! Providers occasionally lose webhooks. This job selects dispatched notices
//! that are old enough to have been opened but show no open yet, still
//! inside the lookback window, and asks each provider's pull API for the
//! message's events. Recovered events are applied with the provider's own
//! timestamp.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use herald_core::{
    AuditChainWriter, Channel, DeliveryLog, DeliveryProvider, EventKind, HeraldError, Notice,
    NoticeFilter, NoticeRepository, OpenSource, ProviderEvent, ReconciliationRun, RunId,
    RunOutcome, Timestamp, SECONDS_PER_DAY, SECONDS_PER_HOUR,
};

use crate::error::DeliveryResult;
use crate::ingest::{apply_provider_event, EventEffect};

const MAX_ERROR_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct DriftPolicy {
    /// Dispatches younger than this are left to the webhooks.
    pub min_age_secs: u64,
    /// Dispatches older than this are no longer reconciled.
    pub lookback_secs: u64,
    pub batch_limit: usize,
    pub timeout: Duration,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self {
            min_age_secs: 2 * SECONDS_PER_HOUR,
            lookback_secs: 7 * SECONDS_PER_DAY,
            batch_limit: 500,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct DriftCorrector {
    notices: Arc<dyn NoticeRepository>,
    log: Arc<dyn DeliveryLog>,
    audit: Arc<dyn AuditChainWriter>,
    providers: HashMap<Channel, Arc<dyn DeliveryProvider>>,
    policy: DriftPolicy,
}

struct NoticeResult {
    recovered: u32,
    error: Option<String>,
}

impl DriftCorrector {
    pub fn new(
        notices: Arc<dyn NoticeRepository>,
        log: Arc<dyn DeliveryLog>,
        audit: Arc<dyn AuditChainWriter>,
        policy: DriftPolicy,
    ) -> Self {
        Self {
            notices,
            log,
            audit,
            providers: HashMap::new(),
            policy,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn DeliveryProvider>) -> Self {
        self.providers.insert(provider.channel(), provider);
        self
    }

    /// One reconciliation pass. Errors are counted per notice and never stop
    /// the batch; a run record is appended whatever happens.
    pub async fn run(&self, now: Timestamp) -> DeliveryResult<ReconciliationRun> {
        let started = Instant::now();
        let filter = NoticeFilter::AwaitingOpen {
            dispatched_before: now.minus_seconds(self.policy.min_age_secs),
            dispatched_after: now.minus_seconds(self.policy.lookback_secs),
        };

        let mut reviewed = 0u32;
        let mut recovered = 0u32;
        let mut errors = 0u32;
        let mut samples = Vec::new();

        match self.notices.select_notices(&filter, self.policy.batch_limit) {
            Ok(candidates) => {
                for notice in &candidates {
                    reviewed += 1;
                    let result = self.reconcile_notice(notice, now).await;
                    recovered += result.recovered;
                    if let Some(error) = result.error {
                        errors += 1;
                        if samples.len() < MAX_ERROR_SAMPLES {
                            samples.push(format!("{}: {}", notice.id, error));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "drift correction selection failed");
                errors += 1;
                samples.push(format!("selection: {}", e));
            }
        }

        let elapsed = started.elapsed();
        let run = ReconciliationRun {
            id: RunId::generate(),
            started_at: now,
            finished_at: now.plus_seconds(elapsed.as_secs()),
            duration_ms: elapsed.as_millis() as u64,
            reviewed,
            recovered,
            errors,
            outcome: RunOutcome::classify(reviewed, recovered, errors),
            error_samples: samples,
        };
        self.log.append_reconciliation_run(&run)?;

        if errors > 0 {
            tracing::warn!(
                run_id = %run.id,
                reviewed,
                recovered,
                errors,
                "drift correction finished with errors"
            );
        } else {
            tracing::info!(run_id = %run.id, reviewed, recovered, "drift correction finished");
        }
        Ok(run)
    }

    async fn reconcile_notice(&self, notice: &Notice, now: Timestamp) -> NoticeResult {
        let mut result = NoticeResult {
            recovered: 0,
            error: None,
        };
        for (channel, message_id) in notice.dispatched_channels() {
            let Some(provider) = self.providers.get(&channel) else {
                continue;
            };
            let fetched = match tokio::time::timeout(
                self.policy.timeout,
                provider.fetch_events(&message_id),
            )
            .await
            {
                Ok(fetched) => fetched,
                Err(_) => Err(HeraldError::ProviderTimeout(channel.to_string())),
            };
            let events = match fetched {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(
                        notice_id = %notice.id,
                        channel = %channel,
                        error = %e,
                        "provider pull failed"
                    );
                    result
                        .error
                        .get_or_insert_with(|| format!("{}: {}", channel, e));
                    continue;
                }
            };

            for event in milestone_events(events) {
                match apply_provider_event(
                    self.notices.as_ref(),
                    self.log.as_ref(),
                    self.audit.as_ref(),
                    &notice.id,
                    channel,
                    &event,
                    OpenSource::Reconciliation,
                    now,
                ) {
                    Ok(EventEffect::Applied) => result.recovered += 1,
                    Ok(_) => {}
                    Err(e) => {
                        result
                            .error
                            .get_or_insert_with(|| format!("{}: {}", channel, e));
                    }
                }
            }
        }
        result
    }
}

/// The earliest event of each milestone kind. Engagement noise from the
/// pull API is left alone; the webhooks already carried it.
fn milestone_events(events: Vec<ProviderEvent>) -> Vec<ProviderEvent> {
    let mut earliest: HashMap<EventKind, ProviderEvent> = HashMap::new();
    for event in events {
        let kind = match event.kind {
            EventKind::Delivered | EventKind::Opened => event.kind,
            EventKind::Bounced | EventKind::Failed => EventKind::Failed,
            _ => continue,
        };
        match earliest.get(&kind) {
            Some(existing) if existing.occurred_at <= event.occurred_at => {}
            _ => {
                earliest.insert(kind, event);
            }
        }
    }
    let mut picked: Vec<ProviderEvent> = earliest.into_values().collect();
    picked.sort_by_key(|e| e.occurred_at);
    picked
}
