use std::sync::Arc;
use std::time::Duration;

use herald_core::{
    BlockchainNotary, ContentHash, DocumentRef, HeraldError, HeraldResult, IntegrityMutation,
    IntegrityRepository, PendingProof, ProofState, SignedToken, Timestamp, TimestampAuthority,
};

use crate::error::{LedgerError, LedgerResult};

/// State of both proofs after a time-stamp request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofHandle {
    pub document: DocumentRef,
    pub tsa: ProofState,
    pub blockchain: ProofState,
    pub pending: Option<PendingProof>,
    pub notary_token: Option<String>,
}

/// Submits a hash to the time-stamp authority and the blockchain notary
/// concurrently, each call bounded by its own timeout.
pub struct DualTimestamper {
    tsa: Option<Arc<dyn TimestampAuthority>>,
    notary: Option<Arc<dyn BlockchainNotary>>,
    timeout: Duration,
}

async fn bounded<T>(
    timeout: Duration,
    what: &str,
    fut: impl std::future::Future<Output = HeraldResult<T>>,
) -> HeraldResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(HeraldError::ProviderTimeout(what.to_string())),
    }
}

impl DualTimestamper {
    pub fn new(
        tsa: Option<Arc<dyn TimestampAuthority>>,
        notary: Option<Arc<dyn BlockchainNotary>>,
        timeout: Duration,
    ) -> Self {
        Self {
            tsa,
            notary,
            timeout,
        }
    }

    async fn stamp(&self, hash: &ContentHash) -> Option<HeraldResult<SignedToken>> {
        match &self.tsa {
            Some(tsa) => Some(bounded(self.timeout, "time-stamp authority", tsa.stamp(hash)).await),
            None => None,
        }
    }

    async fn submit(&self, hash: &ContentHash) -> Option<HeraldResult<PendingProof>> {
        match &self.notary {
            Some(notary) => {
                Some(bounded(self.timeout, "blockchain notary", notary.submit(hash)).await)
            }
            None => None,
        }
    }

    /// Request both proofs for a registered document. Provider failures are
    /// recorded on the integrity record, never returned as errors; the caller
    /// only sees storage failures.
    pub async fn request_timestamp(
        &self,
        repo: &dyn IntegrityRepository,
        document: &DocumentRef,
        now: Timestamp,
    ) -> LedgerResult<ProofHandle> {
        let record = repo
            .get_integrity(document)?
            .ok_or_else(|| LedgerError::NotFound(document.key()))?;
        let hash = record.content_hash;

        let (stamped, submitted) = tokio::join!(self.stamp(&hash), self.submit(&hash));

        match stamped {
            Some(Ok(token)) => {
                repo.apply_integrity(document, &IntegrityMutation::AttachTsaToken { token })?;
            }
            Some(Err(e)) => {
                tracing::warn!(document = %document, error = %e, "time-stamp authority failed");
                repo.apply_integrity(
                    document,
                    &IntegrityMutation::TsaFailed {
                        reason: e.to_string(),
                    },
                )?;
            }
            None => {}
        }

        match submitted {
            Some(Ok(handle)) => {
                repo.apply_integrity(
                    document,
                    &IntegrityMutation::SubmitBlockchain { handle, at: now },
                )?;
            }
            Some(Err(e)) => {
                tracing::warn!(document = %document, error = %e, "blockchain submission failed");
                repo.apply_integrity(
                    document,
                    &IntegrityMutation::BlockchainSubmitFailed {
                        at: now,
                        reason: e.to_string(),
                    },
                )?;
            }
            None => {}
        }

        let record = repo
            .get_integrity(document)?
            .ok_or_else(|| LedgerError::NotFound(document.key()))?;
        Ok(ProofHandle {
            document: document.clone(),
            tsa: record.tsa_state,
            blockchain: record.blockchain.state,
            pending: record.blockchain.handle.clone(),
            notary_token: record.tsa_token.map(|t| t.token),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::{FakeNotary, FakeTsa};
    use super::*;
    use herald_core::{DocumentKind, IntegrityRecord};
    use herald_store::MemoryStore;

    fn registered(store: &MemoryStore) -> DocumentRef {
        let doc = DocumentRef::new(DocumentKind::EvidenceFile, "ev-1");
        store
            .insert_integrity(&IntegrityRecord::new(
                doc.clone(),
                ContentHash([3; 32]),
                Timestamp::from_seconds(1),
            ))
            .unwrap();
        doc
    }

    #[tokio::test]
    async fn test_both_proofs_requested() {
        let store = MemoryStore::new();
        let doc = registered(&store);
        let stamper = DualTimestamper::new(
            Some(Arc::new(FakeTsa { fail: false })),
            Some(Arc::new(FakeNotary::new(1))),
            Duration::from_secs(5),
        );
        let handle = stamper
            .request_timestamp(&store, &doc, Timestamp::from_seconds(10))
            .await
            .unwrap();
        assert_eq!(handle.tsa, ProofState::Confirmed);
        assert_eq!(handle.blockchain, ProofState::Pending);
        assert!(handle.pending.is_some());
        assert!(handle.notary_token.is_some());
    }

    #[tokio::test]
    async fn test_tsa_failure_is_recorded_not_thrown() {
        let store = MemoryStore::new();
        let doc = registered(&store);
        let stamper =
            DualTimestamper::new(Some(Arc::new(FakeTsa { fail: true })), None, Duration::from_secs(5));
        let handle = stamper
            .request_timestamp(&store, &doc, Timestamp::from_seconds(10))
            .await
            .unwrap();
        assert_eq!(handle.tsa, ProofState::Failed);
        assert_eq!(handle.blockchain, ProofState::Absent);
        let record = store.get_integrity(&doc).unwrap().unwrap();
        assert!(record.tsa_failure.unwrap().contains("tsa unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notary_timeout_does_not_block_tsa() {
        let store = MemoryStore::new();
        let doc = registered(&store);
        let mut notary = FakeNotary::new(1);
        notary.hang = true;
        let stamper = DualTimestamper::new(
            Some(Arc::new(FakeTsa { fail: false })),
            Some(Arc::new(notary)),
            Duration::from_secs(2),
        );
        let handle = stamper
            .request_timestamp(&store, &doc, Timestamp::from_seconds(10))
            .await
            .unwrap();
        assert_eq!(handle.tsa, ProofState::Confirmed);
        assert_eq!(handle.blockchain, ProofState::Failed);
    }
}
