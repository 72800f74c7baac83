//! Provider wiring.
//!
//! Two families implement the capability contracts: sandbox providers that
//! never leave the process (development, demos and tests), and a JSON bridge
//! that forwards every call to a companion service holding the real
//! provider accounts.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use herald_core::{
    sha256, Anchor, BiometricProvider, BiometricReference, BlockchainNotary, Channel, ContentHash,
    DeliveryProvider, DispatchRequest, FaceMatch, HeraldError, HeraldResult, LivenessResult,
    NoticeId, NotaryStatus, PendingProof, ProviderEvent, ProviderMessageId, SignedToken,
    TimestampAuthority, Timestamp,
};

use crate::config::{ProviderMode, ProvidersConfig};
use crate::error::{RootError, RootResult};

/// Every provider the application talks to.
#[derive(Clone)]
pub struct ProviderSet {
    pub delivery: Vec<Arc<dyn DeliveryProvider>>,
    pub biometric: Arc<dyn BiometricProvider>,
    pub tsa: Arc<dyn TimestampAuthority>,
    pub notary: Option<Arc<dyn BlockchainNotary>>,
}

impl ProviderSet {
    pub fn from_config(config: &ProvidersConfig, timeout: Duration) -> RootResult<Self> {
        match config.mode {
            ProviderMode::Sandbox => Ok(SandboxProviders::new().provider_set()),
            ProviderMode::Bridge => {
                let url = config
                    .bridge_url
                    .as_deref()
                    .ok_or_else(|| RootError::Config("bridge mode needs bridge_url".into()))?;
                let bridge = Arc::new(BridgeClient::new(url, config.bridge_token.clone(), timeout)?);
                Ok(Self {
                    delivery: Channel::ALL
                        .iter()
                        .map(|&channel| {
                            Arc::new(BridgeDelivery {
                                channel,
                                bridge: bridge.clone(),
                            }) as Arc<dyn DeliveryProvider>
                        })
                        .collect(),
                    biometric: bridge.clone(),
                    tsa: bridge.clone(),
                    notary: Some(bridge),
                })
            }
        }
    }
}

fn poisoned() -> HeraldError {
    HeraldError::Internal("sandbox lock poisoned".into())
}

// ---------------------------------------------------------------------------
// Sandbox delivery
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Outbox {
    dispatched: Vec<(ProviderMessageId, DispatchRequest)>,
    events: HashMap<ProviderMessageId, Vec<ProviderEvent>>,
    codes: Vec<(String, String)>,
    failing: bool,
}

/// Accepts every message and keeps it in memory. Events for the pull API
/// are fed in with [`SandboxDelivery::record_event`].
pub struct SandboxDelivery {
    channel: Channel,
    outbox: Mutex<Outbox>,
}

impl SandboxDelivery {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            outbox: Mutex::new(Outbox::default()),
        }
    }

    fn outbox(&self) -> HeraldResult<MutexGuard<'_, Outbox>> {
        self.outbox.lock().map_err(|_| poisoned())
    }

    /// Make every following call fail, as an unreachable provider would.
    pub fn set_failing(&self, failing: bool) -> HeraldResult<()> {
        self.outbox()?.failing = failing;
        Ok(())
    }

    pub fn message_for(&self, notice_id: &NoticeId) -> HeraldResult<Option<ProviderMessageId>> {
        Ok(self
            .outbox()?
            .dispatched
            .iter()
            .find(|(_, request)| &request.notice_id == notice_id)
            .map(|(id, _)| id.clone()))
    }

    pub fn dispatched_count(&self) -> HeraldResult<usize> {
        Ok(self.outbox()?.dispatched.len())
    }

    pub fn record_event(&self, event: ProviderEvent) -> HeraldResult<()> {
        self.outbox()?
            .events
            .entry(event.message_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    fn down(&self) -> HeraldError {
        HeraldError::Provider(format!("{} sandbox down", self.channel.as_str()))
    }

    /// Last code handed to this channel.
    pub fn last_code(&self) -> HeraldResult<Option<String>> {
        Ok(self.outbox()?.codes.last().map(|(_, code)| code.clone()))
    }
}

#[async_trait]
impl DeliveryProvider for SandboxDelivery {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn dispatch(&self, request: &DispatchRequest) -> HeraldResult<ProviderMessageId> {
        let mut outbox = self.outbox()?;
        if outbox.failing {
            return Err(self.down());
        }
        let id = ProviderMessageId::new(format!(
            "sbx-{}-{}",
            self.channel.as_str(),
            outbox.dispatched.len() + 1
        ));
        outbox.dispatched.push((id.clone(), request.clone()));
        tracing::debug!(channel = ?self.channel, notice_id = %request.notice_id, "sandbox dispatch");
        Ok(id)
    }

    async fn fetch_events(
        &self,
        message_id: &ProviderMessageId,
    ) -> HeraldResult<Vec<ProviderEvent>> {
        let outbox = self.outbox()?;
        if outbox.failing {
            return Err(self.down());
        }
        Ok(outbox.events.get(message_id).cloned().unwrap_or_default())
    }

    async fn send_code(&self, destination: &str, code: &str) -> HeraldResult<ProviderMessageId> {
        let mut outbox = self.outbox()?;
        if outbox.failing {
            return Err(self.down());
        }
        outbox.codes.push((destination.to_string(), code.to_string()));
        Ok(ProviderMessageId::new(format!("sbx-code-{}", outbox.codes.len())))
    }
}

// ---------------------------------------------------------------------------
// Sandbox biometrics, time-stamps and notary
// ---------------------------------------------------------------------------

/// Session ids name the face they captured: `<face>` or `<face>:<nonce>`.
/// `camera-error` fails like a provider outage and `spoof:<face>` fails
/// liveness.
pub struct SandboxBiometrics;

pub const SANDBOX_CAMERA_ERROR: &str = "camera-error";

#[async_trait]
impl BiometricProvider for SandboxBiometrics {
    async fn verify_liveness(&self, session_id: &str) -> HeraldResult<LivenessResult> {
        if session_id == SANDBOX_CAMERA_ERROR {
            return Err(HeraldError::Provider("capture session failed".into()));
        }
        let (live, rest) = match session_id.strip_prefix("spoof:") {
            Some(rest) => (false, rest),
            None => (true, session_id),
        };
        let face = rest.split(':').next().unwrap_or(rest);
        Ok(LivenessResult {
            is_live: live,
            confidence: if live { 0.99 } else { 0.2 },
            reference: BiometricReference(face.to_string()),
        })
    }

    async fn compare_faces(
        &self,
        reference_a: &BiometricReference,
        reference_b: &BiometricReference,
    ) -> HeraldResult<FaceMatch> {
        let similarity = if reference_a == reference_b { 99.1 } else { 12.0 };
        Ok(FaceMatch { similarity })
    }
}

pub struct SandboxTsa;

#[async_trait]
impl TimestampAuthority for SandboxTsa {
    async fn stamp(&self, hash: &ContentHash) -> HeraldResult<SignedToken> {
        let token = sha256(format!("sandbox-tsa:{}", hash.to_hex()).as_bytes());
        Ok(SignedToken {
            authority: "sandbox-tsa".into(),
            token: token.to_hex(),
            stamped_at: Timestamp::now(),
        })
    }
}

/// Confirms a submission on its n-th query, or never.
pub struct SandboxNotary {
    confirm_on: Option<u32>,
    queries: Mutex<HashMap<String, u32>>,
}

impl SandboxNotary {
    pub fn new(confirm_on: Option<u32>) -> Self {
        Self {
            confirm_on,
            queries: Mutex::new(HashMap::new()),
        }
    }

    pub fn queries(&self, handle: &str) -> HeraldResult<u32> {
        let queries = self.queries.lock().map_err(|_| poisoned())?;
        Ok(queries.get(handle).copied().unwrap_or(0))
    }
}

#[async_trait]
impl BlockchainNotary for SandboxNotary {
    async fn submit(&self, hash: &ContentHash) -> HeraldResult<PendingProof> {
        Ok(PendingProof {
            handle: format!("sbx-{}", hash.to_hex()),
        })
    }

    async fn query(&self, proof: &PendingProof) -> HeraldResult<NotaryStatus> {
        let mut queries = self.queries.lock().map_err(|_| poisoned())?;
        let count = queries.entry(proof.handle.clone()).or_insert(0);
        *count += 1;
        let confirmed = self.confirm_on.is_some_and(|n| *count >= n);
        Ok(NotaryStatus {
            confirmed,
            anchor: confirmed.then(|| Anchor {
                block_height: 800_000 + u64::from(*count),
                block_hash: sha256(proof.handle.as_bytes()).to_hex(),
            }),
        })
    }
}

/// The sandbox family with typed handles kept for inspection.
pub struct SandboxProviders {
    pub email: Arc<SandboxDelivery>,
    pub sms: Arc<SandboxDelivery>,
    pub whatsapp: Arc<SandboxDelivery>,
    pub biometric: Arc<SandboxBiometrics>,
    pub tsa: Arc<SandboxTsa>,
    pub notary: Arc<SandboxNotary>,
}

impl SandboxProviders {
    pub fn new() -> Self {
        Self::with_notary(SandboxNotary::new(Some(1)))
    }

    pub fn with_notary(notary: SandboxNotary) -> Self {
        Self {
            email: Arc::new(SandboxDelivery::new(Channel::Email)),
            sms: Arc::new(SandboxDelivery::new(Channel::Sms)),
            whatsapp: Arc::new(SandboxDelivery::new(Channel::Whatsapp)),
            biometric: Arc::new(SandboxBiometrics),
            tsa: Arc::new(SandboxTsa),
            notary: Arc::new(notary),
        }
    }

    pub fn delivery(&self, channel: Channel) -> &Arc<SandboxDelivery> {
        match channel {
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
            Channel::Whatsapp => &self.whatsapp,
        }
    }

    pub fn provider_set(&self) -> ProviderSet {
        ProviderSet {
            delivery: vec![
                self.email.clone() as Arc<dyn DeliveryProvider>,
                self.sms.clone(),
                self.whatsapp.clone(),
            ],
            biometric: self.biometric.clone(),
            tsa: self.tsa.clone(),
            notary: Some(self.notary.clone()),
        }
    }
}

impl Default for SandboxProviders {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// HTTP bridge
// ---------------------------------------------------------------------------

/// JSON-over-HTTP client for the provider bridge.
pub struct BridgeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct MessageIdResponse {
    message_id: ProviderMessageId,
}

impl BridgeClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> RootResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RootError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> HeraldResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                HeraldError::ProviderTimeout(path.to_string())
            } else {
                HeraldError::Provider(format!("{}: {}", path, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(path, status = %status, "bridge call failed");
            return Err(HeraldError::Provider(format!(
                "{} returned {}: {}",
                path,
                status,
                text.chars().take(200).collect::<String>()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| HeraldError::Provider(format!("{}: invalid response: {}", path, e)))
    }
}

struct BridgeDelivery {
    channel: Channel,
    bridge: Arc<BridgeClient>,
}

#[async_trait]
impl DeliveryProvider for BridgeDelivery {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn dispatch(&self, request: &DispatchRequest) -> HeraldResult<ProviderMessageId> {
        let path = format!("/delivery/{}/dispatch", self.channel.as_str());
        let response: MessageIdResponse = self.bridge.post(&path, request).await?;
        Ok(response.message_id)
    }

    async fn fetch_events(
        &self,
        message_id: &ProviderMessageId,
    ) -> HeraldResult<Vec<ProviderEvent>> {
        let path = format!("/delivery/{}/events", self.channel.as_str());
        self.bridge
            .post(&path, &json!({ "message_id": message_id }))
            .await
    }

    async fn send_code(&self, destination: &str, code: &str) -> HeraldResult<ProviderMessageId> {
        let path = format!("/delivery/{}/codes", self.channel.as_str());
        let response: MessageIdResponse = self
            .bridge
            .post(&path, &json!({ "destination": destination, "code": code }))
            .await?;
        Ok(response.message_id)
    }
}

#[async_trait]
impl BiometricProvider for BridgeClient {
    async fn verify_liveness(&self, session_id: &str) -> HeraldResult<LivenessResult> {
        self.post("/biometric/liveness", &json!({ "session_id": session_id }))
            .await
    }

    async fn compare_faces(
        &self,
        reference_a: &BiometricReference,
        reference_b: &BiometricReference,
    ) -> HeraldResult<FaceMatch> {
        self.post(
            "/biometric/compare",
            &json!({ "reference_a": reference_a, "reference_b": reference_b }),
        )
        .await
    }
}

#[async_trait]
impl TimestampAuthority for BridgeClient {
    async fn stamp(&self, hash: &ContentHash) -> HeraldResult<SignedToken> {
        self.post("/tsa/stamp", &json!({ "hash": hash })).await
    }
}

#[async_trait]
impl BlockchainNotary for BridgeClient {
    async fn submit(&self, hash: &ContentHash) -> HeraldResult<PendingProof> {
        self.post("/notary/submit", &json!({ "hash": hash })).await
    }

    async fn query(&self, proof: &PendingProof) -> HeraldResult<NotaryStatus> {
        self.post("/notary/query", proof).await
    }
}
