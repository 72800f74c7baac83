use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use herald_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, BlockchainNotary, DocumentKind, HeraldError,
    IntegrityMutation, IntegrityRecord, IntegrityRepository, NoticeId, NoticeMutation,
    NoticeRepository, ProofState, Timestamp,
};

use crate::error::LedgerResult;

/// Default cap on notary polls before a proof is marked failed.
pub const DEFAULT_MAX_POLLS: u32 = 10;

/// Default minimum age of a pending proof before it is polled.
pub const DEFAULT_MATURATION_SECS: u64 = 3_600;

/// Per-batch cap on proofs examined by one run.
const POLL_BATCH_LIMIT: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
    pub examined: u32,
    pub confirmed: u32,
    pub failed: u32,
    pub still_pending: u32,
    pub errors: u32,
}

/// Scheduled poller for pending blockchain proofs.
pub struct ProofPoller {
    notary: Arc<dyn BlockchainNotary>,
    max_polls: u32,
    maturation_secs: u64,
    timeout: Duration,
}

impl ProofPoller {
    pub fn new(
        notary: Arc<dyn BlockchainNotary>,
        max_polls: u32,
        maturation_secs: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            notary,
            max_polls,
            maturation_secs,
            timeout,
        }
    }

    /// Poll every pending proof older than the maturation window. A provider
    /// error counts as an unconfirmed poll, so a dead notary still reaches
    /// the cap. One record's failure never aborts the batch.
    pub async fn poll_pending_proofs(
        &self,
        integrity: &dyn IntegrityRepository,
        notices: &dyn NoticeRepository,
        audit: &dyn AuditChainWriter,
        now: Timestamp,
    ) -> LedgerResult<PollReport> {
        let cutoff = now.minus_seconds(self.maturation_secs);
        let pending = integrity.pending_proofs(cutoff, POLL_BATCH_LIMIT)?;
        let mut report = PollReport::default();

        for record in pending {
            report.examined += 1;
            match self.poll_one(integrity, notices, audit, &record, now).await {
                Ok(ProofState::Confirmed) => report.confirmed += 1,
                Ok(ProofState::Failed) => report.failed += 1,
                Ok(_) => report.still_pending += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(document = %record.document, error = %e, "proof poll failed");
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            confirmed = report.confirmed,
            failed = report.failed,
            "proof poll finished"
        );
        Ok(report)
    }

    async fn poll_one(
        &self,
        integrity: &dyn IntegrityRepository,
        notices: &dyn NoticeRepository,
        audit: &dyn AuditChainWriter,
        record: &IntegrityRecord,
        now: Timestamp,
    ) -> LedgerResult<ProofState> {
        let handle = match &record.blockchain.handle {
            Some(h) => h,
            None => return Ok(record.blockchain.state),
        };

        let queried = match tokio::time::timeout(self.timeout, self.notary.query(handle)).await {
            Ok(result) => result,
            Err(_) => Err(HeraldError::ProviderTimeout("blockchain notary".into())),
        };

        let mutation = match queried {
            Ok(status) if status.confirmed => match status.anchor {
                Some(anchor) => IntegrityMutation::ConfirmBlockchain { anchor, at: now },
                None => IntegrityMutation::PollUnconfirmed {
                    at: now,
                    max_attempts: self.max_polls,
                },
            },
            Ok(_) => IntegrityMutation::PollUnconfirmed {
                at: now,
                max_attempts: self.max_polls,
            },
            Err(e) => {
                tracing::debug!(document = %record.document, error = %e, "notary query failed");
                IntegrityMutation::PollUnconfirmed {
                    at: now,
                    max_attempts: self.max_polls,
                }
            }
        };

        let outcome = integrity.apply_integrity(&record.document, &mutation)?;
        let updated = integrity
            .get_integrity(&record.document)?
            .map(|r| r.blockchain.state)
            .unwrap_or(record.blockchain.state);

        let resolved = matches!(updated, ProofState::Confirmed | ProofState::Failed);
        if outcome.is_applied() && resolved {
            audit.append(AuditEvent::new(
                AuditEventKind::ProofResolved {
                    document: record.document.clone(),
                    confirmed: updated == ProofState::Confirmed,
                },
                now,
            ))?;
            if record.document.kind == DocumentKind::Notice {
                notices.apply_mutation(
                    &NoticeId::new(record.document.id.as_str()),
                    &NoticeMutation::SyncProof {
                        notary_token: None,
                        blockchain: updated,
                    },
                )?;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditChain;
    use crate::timestamping::fakes::{FakeNotary, FakeTsa};
    use crate::timestamping::DualTimestamper;
    use herald_core::{ContentHash, DocumentRef, IntegrityRecord};
    use herald_store::MemoryStore;

    async fn submitted(store: &MemoryStore, notary: Arc<FakeNotary>) -> DocumentRef {
        let doc = DocumentRef::new(DocumentKind::WitnessStatement, "w-1");
        store
            .insert_integrity(&IntegrityRecord::new(
                doc.clone(),
                ContentHash([8; 32]),
                Timestamp::from_seconds(0),
            ))
            .unwrap();
        DualTimestamper::new(
            Some(Arc::new(FakeTsa { fail: false })),
            Some(notary),
            Duration::from_secs(5),
        )
        .request_timestamp(store, &doc, Timestamp::from_seconds(1_000))
        .await
        .unwrap();
        doc
    }

    #[tokio::test]
    async fn test_unconfirmed_proof_fails_after_cap_but_document_stays_valid() {
        let store = MemoryStore::new();
        let audit = AuditChain::new();
        let notary = Arc::new(FakeNotary::new(0));
        let doc = submitted(&store, notary.clone()).await;
        let poller = ProofPoller::new(notary.clone(), 10, 3_600, Duration::from_secs(5));

        for i in 0..10u64 {
            let now = Timestamp::from_seconds(10_000 + i * 3_600);
            poller
                .poll_pending_proofs(&store, &store, &audit, now)
                .await
                .unwrap();
        }

        let record = store.get_integrity(&doc).unwrap().unwrap();
        assert_eq!(record.blockchain.state, ProofState::Failed);
        assert_eq!(record.blockchain.attempts, 10);
        assert_eq!(record.tsa_state, ProofState::Confirmed);
        assert!(record.is_legally_valid());
        assert_eq!(audit.len(), 1);

        let after = poller
            .poll_pending_proofs(&store, &store, &audit, Timestamp::from_seconds(100_000))
            .await
            .unwrap();
        assert_eq!(after.examined, 0);
    }

    #[tokio::test]
    async fn test_maturation_window_respected() {
        let store = MemoryStore::new();
        let audit = AuditChain::new();
        let notary = Arc::new(FakeNotary::new(1));
        submitted(&store, notary.clone()).await;
        let poller = ProofPoller::new(notary.clone(), 10, 3_600, Duration::from_secs(5));

        let early = poller
            .poll_pending_proofs(&store, &store, &audit, Timestamp::from_seconds(1_500))
            .await
            .unwrap();
        assert_eq!(early.examined, 0);

        let mature = poller
            .poll_pending_proofs(&store, &store, &audit, Timestamp::from_seconds(4_600))
            .await
            .unwrap();
        assert_eq!(mature.confirmed, 1);
    }

    #[tokio::test]
    async fn test_confirmation_stores_anchor() {
        let store = MemoryStore::new();
        let audit = AuditChain::new();
        let notary = Arc::new(FakeNotary::new(2));
        let doc = submitted(&store, notary.clone()).await;
        let poller = ProofPoller::new(notary.clone(), 10, 0, Duration::from_secs(5));

        let first = poller
            .poll_pending_proofs(&store, &store, &audit, Timestamp::from_seconds(2_000))
            .await
            .unwrap();
        assert_eq!(first.still_pending, 1);
        let second = poller
            .poll_pending_proofs(&store, &store, &audit, Timestamp::from_seconds(3_000))
            .await
            .unwrap();
        assert_eq!(second.confirmed, 1);

        let record = store.get_integrity(&doc).unwrap().unwrap();
        assert_eq!(record.blockchain.anchor.unwrap().block_height, 840_000);
        assert_eq!(record.blockchain.resolved_at, Some(Timestamp::from_seconds(3_000)));
    }
}
