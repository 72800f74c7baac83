//! Integrity Ledger
//!
//! Canonical content hashing for every evidentiary document, dual
//! time-stamping (time-stamp authority token plus a blockchain anchor that
//! matures over time), detached Ed25519 signatures, public verification and
//! the hash-chained audit log.
//!
//! [`Ledger`] ties the pieces to the repositories; each piece is also usable
//! on its own.

pub mod audit;
pub mod canonical;
pub mod error;
pub mod poller;
pub mod signature;
pub mod signer;
pub mod timestamping;
pub mod verify;

pub use audit::{AuditChain, AuditEntry};
pub use canonical::{compute_hash, notice_document, CanonicalDocument, FieldValue};
pub use error::{LedgerError, LedgerResult};
pub use poller::{PollReport, ProofPoller};
pub use signature::{apply_digital_signature, verify_signature_block};
pub use signer::LedgerSigner;
pub use timestamping::{DualTimestamper, ProofHandle};
pub use verify::{ProofStatus, VerificationResult};

use std::sync::Arc;

use herald_core::{
    AccessContext, AuditChainWriter, AuditEvent, AuditEventKind, ContentHash, DocumentKind,
    DocumentRef, IntegrityRecord, IntegrityRepository, NoticeId, NoticeMutation,
    NoticeRepository, SignatureBlock, Timestamp,
};

pub struct Ledger {
    integrity: Arc<dyn IntegrityRepository>,
    notices: Arc<dyn NoticeRepository>,
    audit: Arc<dyn AuditChainWriter>,
    timestamper: DualTimestamper,
    poller: Option<ProofPoller>,
    signer: Arc<LedgerSigner>,
}

impl Ledger {
    pub fn new(
        integrity: Arc<dyn IntegrityRepository>,
        notices: Arc<dyn NoticeRepository>,
        audit: Arc<dyn AuditChainWriter>,
        timestamper: DualTimestamper,
        poller: Option<ProofPoller>,
        signer: Arc<LedgerSigner>,
    ) -> Self {
        Self {
            integrity,
            notices,
            audit,
            timestamper,
            poller,
            signer,
        }
    }

    pub fn signer(&self) -> &LedgerSigner {
        &self.signer
    }

    /// Hash a document and store its integrity record. A document can be
    /// registered once.
    pub fn register_document(
        &self,
        document: DocumentRef,
        canonical: &CanonicalDocument,
        at: Timestamp,
    ) -> LedgerResult<IntegrityRecord> {
        let hash = canonical.compute_hash(&at);
        self.register_hash(document, hash, at)
    }

    /// Store an integrity record for an already computed hash.
    pub fn register_hash(
        &self,
        document: DocumentRef,
        hash: ContentHash,
        at: Timestamp,
    ) -> LedgerResult<IntegrityRecord> {
        let record = IntegrityRecord::new(document.clone(), hash, at);
        if !self.integrity.insert_integrity(&record)? {
            return Err(LedgerError::AlreadyRegistered(document.key()));
        }
        self.audit.append(AuditEvent::new(
            AuditEventKind::DocumentRegistered {
                document: document.clone(),
                content_hash: hash,
            },
            at,
        ))?;
        tracing::info!(document = %document, hash = %hash, "document registered");
        Ok(record)
    }

    pub fn record(&self, document: &DocumentRef) -> LedgerResult<Option<IntegrityRecord>> {
        Ok(self.integrity.get_integrity(document)?)
    }

    /// Request both time-stamps. For a notice document the proof fields on
    /// the notice itself are synced as well.
    pub async fn timestamp_document(
        &self,
        document: &DocumentRef,
        now: Timestamp,
    ) -> LedgerResult<ProofHandle> {
        let handle = self
            .timestamper
            .request_timestamp(self.integrity.as_ref(), document, now)
            .await?;
        if document.kind == DocumentKind::Notice {
            self.notices.apply_mutation(
                &NoticeId::new(document.id.as_str()),
                &NoticeMutation::SyncProof {
                    notary_token: handle.notary_token.clone(),
                    blockchain: handle.blockchain,
                },
            )?;
        }
        Ok(handle)
    }

    pub fn sign_document(
        &self,
        document: &DocumentRef,
        now: Timestamp,
    ) -> LedgerResult<SignatureBlock> {
        let block = apply_digital_signature(
            self.integrity.as_ref(),
            self.signer.as_ref(),
            self.signer.identity(),
            document,
            now,
        )?;
        self.audit.append(AuditEvent::new(
            AuditEventKind::DocumentSigned {
                document: document.clone(),
                signer: block.signer.clone(),
            },
            now,
        ))?;
        Ok(block)
    }

    pub fn verify_hash(
        &self,
        queried: &str,
        caller: AccessContext,
        now: Timestamp,
    ) -> LedgerResult<VerificationResult> {
        verify::verify_hash(
            self.integrity.as_ref(),
            self.audit.as_ref(),
            queried,
            caller,
            now,
        )
    }

    pub fn verify_document(
        &self,
        document: &DocumentRef,
        candidate: &ContentHash,
        caller: AccessContext,
        now: Timestamp,
    ) -> LedgerResult<VerificationResult> {
        verify::verify_document(
            self.integrity.as_ref(),
            self.audit.as_ref(),
            document,
            candidate,
            caller,
            now,
        )
    }

    /// Scheduled proof polling. Without a notary there is nothing to poll.
    pub async fn poll_pending_proofs(&self, now: Timestamp) -> LedgerResult<PollReport> {
        match &self.poller {
            Some(poller) => {
                poller
                    .poll_pending_proofs(
                        self.integrity.as_ref(),
                        self.notices.as_ref(),
                        self.audit.as_ref(),
                        now,
                    )
                    .await
            }
            None => Ok(PollReport::default()),
        }
    }
}
