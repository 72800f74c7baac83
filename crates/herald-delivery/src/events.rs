//! Provider payload parsing.
//!
//! The email provider posts batched JSON arrays; the SMS provider posts one
//! status object (or an array of them) per callback. Both normalize into
//! [`ProviderEvent`]s. Entries that cannot be attributed to a message or an
//! event kind are skipped and counted, never guessed.

use serde::Deserialize;
use serde_json::Value;

use herald_core::{EventKind, ProviderEvent, ProviderMessageId, Timestamp};

use crate::error::{DeliveryError, DeliveryResult};

/// Which receiver a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookSource {
    Email,
    Sms,
}

impl WebhookSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookSource::Email => "email",
            WebhookSource::Sms => "sms",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBatch {
    pub events: Vec<ProviderEvent>,
    pub skipped: u32,
}

#[derive(Debug, Deserialize)]
struct EmailEntry {
    #[serde(alias = "sg_message_id", alias = "messageId")]
    message_id: Option<String>,
    event: Option<String>,
    timestamp: Option<Value>,
    reason: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SmsEntry {
    message_sid: Option<String>,
    message_status: Option<String>,
    timestamp: Option<Value>,
    error_code: Option<Value>,
}

pub fn email_event_kind(name: &str) -> Option<EventKind> {
    match name.trim().to_ascii_lowercase().as_str() {
        "processed" | "sent" => Some(EventKind::Processed),
        "deferred" => Some(EventKind::Deferred),
        "delivered" => Some(EventKind::Delivered),
        "open" | "opened" => Some(EventKind::Opened),
        "click" | "clicked" => Some(EventKind::Clicked),
        "bounce" | "bounced" | "dropped" => Some(EventKind::Bounced),
        "failed" | "blocked" => Some(EventKind::Failed),
        _ => None,
    }
}

pub fn sms_event_kind(status: &str) -> Option<EventKind> {
    match status.trim().to_ascii_lowercase().as_str() {
        "accepted" | "queued" | "sending" | "sent" => Some(EventKind::Processed),
        "delivered" => Some(EventKind::Delivered),
        "read" => Some(EventKind::Opened),
        "undelivered" => Some(EventKind::Bounced),
        "failed" => Some(EventKind::Failed),
        _ => None,
    }
}

/// Provider timestamps arrive as epoch seconds (number or string) or RFC 3339.
fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_u64().map(Timestamp::from_seconds),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .ok()
            .map(Timestamp::from_seconds)
            .or_else(|| Timestamp::parse_rfc3339(s)),
        _ => None,
    }
}

fn entries<T: for<'de> Deserialize<'de>>(body: &[u8]) -> DeliveryResult<Vec<T>> {
    let value: Value = serde_json::from_slice(body).map_err(|_| DeliveryError::MalformedPayload)?;
    let items = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => return Err(DeliveryError::MalformedPayload),
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(|_| DeliveryError::MalformedPayload))
        .collect()
}

/// Parse a payload. An entry without a provider timestamp falls back to
/// `received_at` so that nothing the provider reported is lost.
pub fn parse_events(
    source: WebhookSource,
    body: &[u8],
    received_at: Timestamp,
) -> DeliveryResult<ParsedBatch> {
    let mut batch = ParsedBatch::default();
    let mut push = |message_id: Option<String>,
                    kind: Option<EventKind>,
                    at: Option<&Value>,
                    detail: Option<String>| {
        match (message_id.filter(|m| !m.trim().is_empty()), kind) {
            (Some(message_id), Some(kind)) => {
                let occurred_at = at.and_then(parse_timestamp).unwrap_or_else(|| {
                    tracing::debug!(message_id = %message_id, "event without provider timestamp");
                    received_at
                });
                batch.events.push(ProviderEvent {
                    message_id: ProviderMessageId::new(message_id.trim()),
                    kind,
                    occurred_at,
                    detail,
                });
            }
            _ => batch.skipped += 1,
        }
    };

    match source {
        WebhookSource::Email => {
            for entry in entries::<EmailEntry>(body)? {
                let kind = entry.event.as_deref().and_then(email_event_kind);
                push(
                    entry.message_id,
                    kind,
                    entry.timestamp.as_ref(),
                    entry.reason.or(entry.url),
                );
            }
        }
        WebhookSource::Sms => {
            for entry in entries::<SmsEntry>(body)? {
                let kind = entry.message_status.as_deref().and_then(sms_event_kind);
                let detail = entry.error_code.map(|code| match code {
                    Value::String(s) => format!("error code {s}"),
                    other => format!("error code {other}"),
                });
                push(entry.message_sid, kind, entry.timestamp.as_ref(), detail);
            }
        }
    }
    Ok(batch)
}
