//! Delivery Reconciliation Engine
//!
//! Everything between handing a notice to its channels and knowing what
//! happened to it: multi-channel dispatch behind per-channel circuit
//! breakers, authenticated webhook ingestion with an always-written audit
//! record, drift correction against the providers' pull APIs, and the
//! subsidiarity job that escalates unopened notices to physical delivery.

pub mod circuit_breaker;
pub mod dispatch;
pub mod drift;
pub mod error;
pub mod events;
pub mod ingest;
pub mod signature;
pub mod subsidiarity;

#[cfg(test)]
pub(crate) mod testing;

pub use circuit_breaker::{ChannelHealth, CircuitBreaker, CircuitState};
pub use dispatch::{ChannelOutcome, DispatchPolicy, DispatchReport, Dispatcher};
pub use drift::{DriftCorrector, DriftPolicy};
pub use error::{DeliveryError, DeliveryResult};
pub use events::{parse_events, ParsedBatch, WebhookSource};
pub use ingest::{apply_provider_event, EventEffect, InboundWebhook, IngestReport, WebhookIngestor};
pub use signature::{
    parse_public_key, sign_ed25519, sign_timestamped, sign_url_body, SignatureHeaders,
    SignatureVerdict, WebhookSecret, WebhookVerifier, TIMESTAMP_TOLERANCE_SECONDS,
};
pub use subsidiarity::{activate_physical_fallback, SubsidiarityReport, SUBSIDIARITY_GRACE_SECS};
