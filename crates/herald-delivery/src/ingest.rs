//! Webhook ingestion.
//!
//! Every inbound payload is hashed and recorded before anything else, valid
//! signature or not. Events are then applied through conditional mutations,
//! so duplicates and out-of-order deliveries cannot regress a notice.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use herald_core::{
    sha256, AccessContext, AuditChainWriter, AuditEvent, AuditEventKind, Channel, DeliveryLog,
    EngagementEvent, EventKind, MutationOutcome, NoticeId, NoticeMutation, NoticeRepository,
    OpenSource, ProviderEvent, Timestamp, WebhookRecord, WebhookRecordId,
};

use crate::error::{DeliveryError, DeliveryResult};
use crate::events::{parse_events, WebhookSource};
use crate::signature::{SignatureHeaders, SignatureVerdict, WebhookVerifier};

/// One inbound callback as seen by a receiver.
#[derive(Debug, Clone)]
pub struct InboundWebhook<'a> {
    pub source: WebhookSource,
    pub body: &'a [u8],
    pub headers: SignatureHeaders,
    pub origin: AccessContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub record_id: Option<WebhookRecordId>,
    pub signature_valid: bool,
    pub events: u32,
    pub skipped: u32,
    pub applied: u32,
    pub duplicates: u32,
    pub unmatched: u32,
    pub ignored: u32,
    pub engagement: u32,
    /// Events that failed to apply; the rest of the batch still runs.
    pub errors: u32,
}

pub struct WebhookIngestor {
    notices: Arc<dyn NoticeRepository>,
    log: Arc<dyn DeliveryLog>,
    audit: Arc<dyn AuditChainWriter>,
    verifiers: HashMap<WebhookSource, WebhookVerifier>,
    strict: bool,
}

impl WebhookIngestor {
    pub fn new(
        notices: Arc<dyn NoticeRepository>,
        log: Arc<dyn DeliveryLog>,
        audit: Arc<dyn AuditChainWriter>,
        strict: bool,
    ) -> Self {
        Self {
            notices,
            log,
            audit,
            verifiers: HashMap::new(),
            strict,
        }
    }

    pub fn with_verifier(mut self, source: WebhookSource, verifier: WebhookVerifier) -> Self {
        self.verifiers.insert(source, verifier);
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    fn channels(source: WebhookSource) -> &'static [Channel] {
        match source {
            WebhookSource::Email => &[Channel::Email],
            WebhookSource::Sms => &[Channel::Sms, Channel::Whatsapp],
        }
    }

    /// Record, verify and apply one payload.
    ///
    /// Returns `InvalidSignature` only under strict enforcement, after the
    /// record is written and with no mutation applied.
    pub fn ingest(
        &self,
        webhook: &InboundWebhook<'_>,
        now: Timestamp,
    ) -> DeliveryResult<IngestReport> {
        let verdict = match self.verifiers.get(&webhook.source) {
            Some(verifier) => verifier.verify(&webhook.headers, webhook.body, now),
            None => SignatureVerdict::Invalid("no verifier configured"),
        };
        let rejected = self.strict && !verdict.is_valid();

        let record = WebhookRecord {
            id: WebhookRecordId::generate(),
            provider: Self::channels(webhook.source)[0],
            received_at: now,
            payload_hash: sha256(webhook.body),
            payload_len: webhook.body.len() as u64,
            signature_valid: verdict.is_valid(),
            signature_detail: verdict.detail(),
            rejected,
            origin: webhook.origin.clone(),
        };
        self.log.append_webhook(&record)?;

        if !verdict.is_valid() {
            tracing::warn!(
                source = webhook.source.as_str(),
                record_id = %record.id,
                payload_hash = %record.payload_hash,
                verdict = ?verdict,
                strict = self.strict,
                "webhook signature verification failed"
            );
        }
        if rejected {
            return Err(DeliveryError::InvalidSignature);
        }

        let batch = parse_events(webhook.source, webhook.body, now)?;
        let mut report = IngestReport {
            record_id: Some(record.id.clone()),
            signature_valid: verdict.is_valid(),
            events: batch.events.len() as u32,
            skipped: batch.skipped,
            ..Default::default()
        };
        for event in &batch.events {
            if let Err(e) = self.apply_event(webhook.source, event, now, &mut report) {
                tracing::error!(
                    record_id = %record.id,
                    message_id = %event.message_id,
                    kind = event.kind.as_str(),
                    error = %e,
                    "webhook event failed to apply"
                );
                report.errors += 1;
            }
        }

        tracing::info!(
            source = webhook.source.as_str(),
            record_id = %record.id,
            events = report.events,
            applied = report.applied,
            duplicates = report.duplicates,
            unmatched = report.unmatched,
            errors = report.errors,
            "webhook ingested"
        );
        Ok(report)
    }

    fn locate(
        &self,
        source: WebhookSource,
        event: &ProviderEvent,
    ) -> DeliveryResult<Option<(Channel, NoticeId)>> {
        for channel in Self::channels(source) {
            if let Some(id) = self.notices.find_by_message(*channel, &event.message_id)? {
                return Ok(Some((*channel, id)));
            }
        }
        Ok(None)
    }

    fn apply_event(
        &self,
        source: WebhookSource,
        event: &ProviderEvent,
        now: Timestamp,
        report: &mut IngestReport,
    ) -> DeliveryResult<()> {
        let Some((channel, notice_id)) = self.locate(source, event)? else {
            tracing::debug!(message_id = %event.message_id, "event for unknown message");
            report.unmatched += 1;
            return Ok(());
        };

        let outcome = apply_provider_event(
            self.notices.as_ref(),
            self.log.as_ref(),
            self.audit.as_ref(),
            &notice_id,
            channel,
            event,
            OpenSource::Webhook,
            now,
        )?;
        match outcome {
            EventEffect::Applied => report.applied += 1,
            EventEffect::Duplicate => report.duplicates += 1,
            EventEffect::Ignored => report.ignored += 1,
            EventEffect::Engagement => report.engagement += 1,
        }
        Ok(())
    }
}

/// What one provider event did to its notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventEffect {
    Applied,
    Duplicate,
    /// Refused by the notice (terminal state, channel never dispatched).
    Ignored,
    /// Appended to the engagement stream only.
    Engagement,
}

/// Apply one provider event to a notice. Shared by webhook ingestion and
/// drift correction; the two differ only in the recorded open source.
#[allow(clippy::too_many_arguments)]
pub fn apply_provider_event(
    notices: &dyn NoticeRepository,
    log: &dyn DeliveryLog,
    audit: &dyn AuditChainWriter,
    notice_id: &NoticeId,
    channel: Channel,
    event: &ProviderEvent,
    source: OpenSource,
    now: Timestamp,
) -> DeliveryResult<EventEffect> {
    let mutation = match event.kind {
        EventKind::Delivered => NoticeMutation::Delivered {
            channel,
            at: event.occurred_at,
        },
        EventKind::Opened => NoticeMutation::FirstOpen {
            channel,
            at: event.occurred_at,
            source,
        },
        EventKind::Bounced | EventKind::Failed => NoticeMutation::ChannelFailed {
            channel,
            at: event.occurred_at,
            reason: event
                .detail
                .clone()
                .unwrap_or_else(|| event.kind.as_str().to_string()),
        },
        EventKind::Clicked | EventKind::Processed | EventKind::Deferred => {
            log.append_engagement(&EngagementEvent {
                notice_id: notice_id.clone(),
                channel,
                message_id: event.message_id.clone(),
                kind: event.kind,
                occurred_at: event.occurred_at,
                recorded_at: now,
                detail: event.detail.clone(),
            })?;
            audit.append(AuditEvent::new(
                AuditEventKind::Engagement {
                    notice_id: notice_id.clone(),
                    channel,
                    kind: event.kind,
                    occurred_at: event.occurred_at,
                },
                now,
            ))?;
            return Ok(EventEffect::Engagement);
        }
    };

    let fallback_already_set = match &mutation {
        NoticeMutation::ChannelFailed { .. } => notices
            .get_notice(notice_id)?
            .map(|n| n.physical_fallback_required)
            .unwrap_or(false),
        _ => true,
    };

    match notices.apply_mutation(notice_id, &mutation)? {
        MutationOutcome::Applied => {
            match event.kind {
                EventKind::Opened => {
                    tracing::info!(
                        notice_id = %notice_id,
                        channel = %channel,
                        source = ?source,
                        "first open recorded"
                    );
                    if source == OpenSource::Reconciliation {
                        audit.append(AuditEvent::new(
                            AuditEventKind::OpenRecovered {
                                notice_id: notice_id.clone(),
                                channel,
                                occurred_at: event.occurred_at,
                            },
                            now,
                        ))?;
                    }
                }
                EventKind::Bounced | EventKind::Failed => {
                    tracing::warn!(
                        notice_id = %notice_id,
                        channel = %channel,
                        kind = event.kind.as_str(),
                        "channel delivery failed"
                    );
                    audit.append(AuditEvent::new(
                        AuditEventKind::ChannelFailed {
                            notice_id: notice_id.clone(),
                            channel,
                        },
                        now,
                    ))?;
                    if !fallback_already_set {
                        audit.append(AuditEvent::new(
                            AuditEventKind::PhysicalFallbackActivated {
                                notice_id: notice_id.clone(),
                            },
                            now,
                        ))?;
                    }
                }
                _ => {
                    tracing::info!(notice_id = %notice_id, channel = %channel, "delivery recorded");
                }
            }
            Ok(EventEffect::Applied)
        }
        MutationOutcome::AlreadySet => Ok(EventEffect::Duplicate),
        MutationOutcome::Rejected(reason) => {
            tracing::debug!(notice_id = %notice_id, reason = %reason, "provider event ignored");
            Ok(EventEffect::Ignored)
        }
    }
}
