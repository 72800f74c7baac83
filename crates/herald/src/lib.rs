//! Herald: certified delivery of disciplinary notices.
//!
//! This crate wires the component crates into one application: the
//! integrity ledger, the gatekeeper, the delivery reconciliation engine and
//! the lifecycle jobs, behind an axum HTTP surface and a clap CLI.

pub mod config;
pub mod error;
pub mod http;
pub mod jobs;
pub mod providers;

use std::sync::Arc;
use std::time::Duration;

use herald_core::{
    AuditChainWriter, AuditPersistence, BiometricRepository, CodeRepository, DeliveryLog,
    EmployeeDirectory, GateRepository, IntegrityRepository, Notice, NoticeId, NoticeRepository,
    Timestamp,
};
use herald_delivery::{
    activate_physical_fallback, parse_public_key, DispatchPolicy, Dispatcher, DriftCorrector,
    DriftPolicy, WebhookIngestor, WebhookSecret, WebhookSource, WebhookVerifier,
};
use herald_gate::{AccessKey, CodePolicy, GatePolicy, GateStores, Gatekeeper};
use herald_ledger::{AuditChain, DualTimestamper, Ledger, LedgerSigner, ProofPoller};
use herald_lifecycle::{promote_due_notices, status_view, Issuer, NoticeStatus};
use herald_store::{MemoryStore, SqliteStore};

use crate::config::{RootConfig, SignatureScheme, StorageBackend, WebhookConfig};
use crate::error::{RootError, RootResult};
use crate::jobs::{Job, JobOutcome, JobRunner};
use crate::providers::ProviderSet;

/// Everything a backing store has to provide.
pub trait HeraldStore:
    NoticeRepository
    + EmployeeDirectory
    + CodeRepository
    + GateRepository
    + BiometricRepository
    + DeliveryLog
    + IntegrityRepository
    + AuditPersistence
    + 'static
{
}

impl<T> HeraldStore for T where
    T: NoticeRepository
        + EmployeeDirectory
        + CodeRepository
        + GateRepository
        + BiometricRepository
        + DeliveryLog
        + IntegrityRepository
        + AuditPersistence
        + 'static
{
}

/// Shared application state.
pub struct HeraldApp {
    pub config: RootConfig,
    pub notices: Arc<dyn NoticeRepository>,
    pub employees: Arc<dyn EmployeeDirectory>,
    pub log: Arc<dyn DeliveryLog>,
    pub audit: Arc<AuditChain>,
    pub ledger: Arc<Ledger>,
    pub gatekeeper: Gatekeeper,
    pub dispatcher: Dispatcher,
    pub ingestor: WebhookIngestor,
    pub drift: DriftCorrector,
    pub issuer: Issuer,
    pub access_key: AccessKey,
    pub jobs: JobRunner,
}

/// Build the application from configuration, with the providers it names.
pub fn initialize(config: RootConfig) -> RootResult<HeraldApp> {
    let timeout = Duration::from_secs(config.delivery.provider_timeout_secs);
    let providers = ProviderSet::from_config(&config.providers, timeout)?;
    initialize_with(config, providers)
}

/// Build the application with an explicit provider set.
pub fn initialize_with(config: RootConfig, providers: ProviderSet) -> RootResult<HeraldApp> {
    config.validate()?;
    config.ensure_secrets()?;
    match config.database.backend {
        StorageBackend::Memory => assemble(config, Arc::new(MemoryStore::new()), providers),
        StorageBackend::Sqlite => {
            if let Some(parent) = config.database.path.parent() {
                std::fs::create_dir_all(parent).map_err(RootError::Io)?;
            }
            let path = config.database.path.to_string_lossy().to_string();
            let store = SqliteStore::open(&path)?;
            tracing::info!(path = %path, "opened sqlite store");
            assemble(config, Arc::new(store), providers)
        }
    }
}

fn optional_secret(value: &Option<String>) -> RootResult<Option<WebhookSecret>> {
    value
        .as_deref()
        .map(|s| WebhookSecret::new(s.as_bytes()))
        .transpose()
        .map_err(|_| RootError::Config("webhook secret must not be empty".into()))
}

fn required<T>(value: Option<T>, what: &str) -> RootResult<T> {
    value.ok_or_else(|| RootError::Config(format!("webhook scheme needs {}", what)))
}

/// Translate one receiver's configuration into a verifier.
pub fn webhook_verifier(config: &WebhookConfig) -> RootResult<Option<WebhookVerifier>> {
    let verifier = match config.scheme {
        SignatureScheme::None => return Ok(None),
        SignatureScheme::HmacTimestamped => WebhookVerifier::HmacTimestamped {
            current: required(optional_secret(&config.secret)?, "secret")?,
            previous: optional_secret(&config.previous_secret)?,
        },
        SignatureScheme::HmacUrlBody => WebhookVerifier::HmacUrlBody {
            url: required(config.url.clone(), "url")?,
            current: required(optional_secret(&config.secret)?, "secret")?,
            previous: optional_secret(&config.previous_secret)?,
        },
        SignatureScheme::Ed25519 => {
            let parse = |value: &str| {
                parse_public_key(value)
                    .map_err(|_| RootError::Config("invalid webhook public key".into()))
            };
            WebhookVerifier::Ed25519 {
                current: parse(required(config.public_key.as_deref(), "public_key")?)?,
                previous: config.previous_public_key.as_deref().map(parse).transpose()?,
            }
        }
    };
    Ok(Some(verifier))
}

fn assemble<S: HeraldStore>(
    config: RootConfig,
    store: Arc<S>,
    providers: ProviderSet,
) -> RootResult<HeraldApp> {
    let audit = Arc::new(AuditChain::with_persistence(store.clone())?);
    if !audit.verify_chain()? {
        tracing::error!("persisted audit chain does not verify");
    }

    let signer = Arc::new(LedgerSigner::from_hex(
        &config.ledger.signing_seed,
        config.ledger.signer_identity.clone(),
    )?);
    let ledger_timeout = Duration::from_secs(config.ledger.provider_timeout_secs);
    let poller = providers.notary.clone().map(|notary| {
        ProofPoller::new(
            notary,
            config.ledger.poll_retry_cap,
            config.ledger.maturation_secs,
            ledger_timeout,
        )
    });
    let ledger = Arc::new(Ledger::new(
        store.clone(),
        store.clone(),
        audit.clone(),
        DualTimestamper::new(
            Some(providers.tsa.clone()),
            providers.notary.clone(),
            ledger_timeout,
        ),
        poller,
        signer,
    ));

    let gate_policy = GatePolicy {
        code: CodePolicy::new(config.gate.code_max_attempts, config.gate.code_ttl_secs),
        comprehension_attempts: config.gate.comprehension_attempts,
        provider_timeout: Duration::from_secs(config.gate.provider_timeout_secs),
    };
    let mut gatekeeper = Gatekeeper::new(
        GateStores {
            notices: store.clone(),
            employees: store.clone(),
            codes: store.clone(),
            gates: store.clone(),
            biometrics: store.clone(),
            audit: audit.clone(),
        },
        gate_policy,
    )
    .with_biometric_provider(providers.biometric.clone());

    let delivery_timeout = Duration::from_secs(config.delivery.provider_timeout_secs);
    let mut dispatcher = Dispatcher::new(
        store.clone(),
        store.clone(),
        audit.clone(),
        DispatchPolicy {
            timeout: delivery_timeout,
            breaker_threshold: config.delivery.breaker_threshold,
            breaker_recovery_secs: config.delivery.breaker_recovery_secs,
        },
    );
    let mut drift = DriftCorrector::new(
        store.clone(),
        store.clone(),
        audit.clone(),
        DriftPolicy {
            min_age_secs: config.delivery.drift_min_age_secs,
            lookback_secs: config.delivery.drift_lookback_secs,
            batch_limit: config.jobs.batch_limit,
            timeout: delivery_timeout,
        },
    );
    for provider in &providers.delivery {
        gatekeeper = gatekeeper.with_code_provider(provider.clone());
        dispatcher = dispatcher.with_provider(provider.clone());
        drift = drift.with_provider(provider.clone());
    }

    let mut ingestor = WebhookIngestor::new(
        store.clone(),
        store.clone(),
        audit.clone(),
        config.delivery.strict_signatures,
    );
    let receivers = [
        (WebhookSource::Email, &config.delivery.email_webhook),
        (WebhookSource::Sms, &config.delivery.sms_webhook),
    ];
    for (source, receiver) in receivers {
        match webhook_verifier(receiver)? {
            Some(verifier) => ingestor = ingestor.with_verifier(source, verifier),
            None => tracing::warn!(
                source = source.as_str(),
                "no webhook signature scheme configured, callbacks will be flagged"
            ),
        }
    }

    let issuer = Issuer::new(store.clone(), audit.clone(), ledger.clone());
    let access_key = AccessKey::from_secret(&config.gate.access_key);
    let jobs = JobRunner::new(&config.jobs);

    Ok(HeraldApp {
        notices: store.clone(),
        employees: store.clone(),
        log: store,
        audit,
        ledger,
        gatekeeper,
        dispatcher,
        ingestor,
        drift,
        issuer,
        access_key,
        jobs,
        config,
    })
}

impl HeraldApp {
    pub fn notice(&self, id: &NoticeId) -> RootResult<Notice> {
        self.notices
            .get_notice(id)?
            .ok_or_else(|| RootError::NotFound(format!("notice {}", id)))
    }

    /// Issue an accessor session token bound to the notice and its tenant.
    pub fn issue_access_token(
        &self,
        id: &NoticeId,
        now: Timestamp,
    ) -> RootResult<(String, Timestamp)> {
        let notice = self.notice(id)?;
        let expires_at = now.plus_seconds(self.config.gate.access_token_ttl_secs);
        let token = self
            .access_key
            .issue(id, &notice.content.company_id, expires_at)?;
        Ok((token, expires_at))
    }

    /// Check an accessor token before any gate logic runs.
    pub fn authorize(&self, token: &str, id: &NoticeId, now: Timestamp) -> RootResult<Notice> {
        let claims = self
            .access_key
            .verify(token, id, now)
            .map_err(|_| RootError::Unauthorized)?;
        let notice = self.notice(id)?;
        if claims.company_id != notice.content.company_id {
            tracing::warn!(notice_id = %id, "access token issued for another tenant");
            return Err(RootError::Forbidden);
        }
        Ok(notice)
    }

    pub fn status(&self, id: &NoticeId, now: Timestamp) -> RootResult<NoticeStatus> {
        Ok(status_view(&self.notice(id)?, now))
    }

    /// Run a job unless its current window was already taken.
    pub async fn run_job(&self, job: Job, now: Timestamp) -> RootResult<JobOutcome> {
        let Some(window) = self.jobs.claim(job, now)? else {
            return Ok(JobOutcome::Skipped {
                job,
                window: self.jobs.window(job, now),
            });
        };
        match self.execute(job, now).await {
            Ok(report) => Ok(JobOutcome::Ran {
                job,
                window,
                report,
            }),
            Err(e) => {
                self.jobs.release(job, window)?;
                Err(e)
            }
        }
    }

    async fn execute(&self, job: Job, now: Timestamp) -> RootResult<serde_json::Value> {
        let limit = self.config.jobs.batch_limit;
        tracing::info!(job = %job, "job started");
        let report = match job {
            Job::DriftCorrection => serde_json::to_value(self.drift.run(now).await?)?,
            Job::Subsidiarity => serde_json::to_value(activate_physical_fallback(
                self.notices.as_ref(),
                self.audit.as_ref(),
                now,
                limit,
            )?)?,
            Job::Firmness => serde_json::to_value(promote_due_notices(
                self.notices.as_ref(),
                self.audit.as_ref(),
                now,
                limit,
            )?)?,
            Job::ProofPoll => serde_json::to_value(self.ledger.poll_pending_proofs(now).await?)?,
        };
        Ok(report)
    }
}
