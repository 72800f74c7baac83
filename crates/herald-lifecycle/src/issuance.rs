//! Issuing notices and registering other evidentiary documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use herald_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, DocumentId, DocumentKind, DocumentRef,
    IntegrityRecord, Notice, NoticeContent, NoticeId, NoticeRepository, ProofState, Timestamp,
};
use herald_ledger::{notice_document, CanonicalDocument, Ledger};

use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedNotice {
    pub notice: Notice,
    pub tsa: ProofState,
    pub blockchain: ProofState,
}

pub struct Issuer {
    notices: Arc<dyn NoticeRepository>,
    audit: Arc<dyn AuditChainWriter>,
    ledger: Arc<Ledger>,
}

impl Issuer {
    pub fn new(
        notices: Arc<dyn NoticeRepository>,
        audit: Arc<dyn AuditChainWriter>,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            notices,
            audit,
            ledger,
        }
    }

    /// Hash the content, persist the draft, register its integrity record
    /// and request both time-stamps. Time-stamp provider failures are kept on
    /// the integrity record and do not fail issuance.
    pub async fn create_notice(
        &self,
        content: NoticeContent,
        now: Timestamp,
    ) -> LifecycleResult<IssuedNotice> {
        validate_content(&content)?;

        let id = NoticeId::generate();
        let hash = notice_document(&content).compute_hash(&now);
        let notice = Notice::draft(id.clone(), content, hash, now, None);
        self.notices.insert_notice(&notice)?;
        self.audit.append(AuditEvent::new(
            AuditEventKind::NoticeCreated {
                notice_id: id.clone(),
                content_hash: hash,
            },
            now,
        ))?;
        tracing::info!(notice_id = %id, hash = %hash, "notice created");

        let document = DocumentRef::new(DocumentKind::Notice, id.as_str());
        self.ledger.register_hash(document.clone(), hash, now)?;
        let proof = self.ledger.timestamp_document(&document, now).await?;

        let notice = self
            .notices
            .get_notice(&id)?
            .ok_or(LifecycleError::NotFound)?;
        Ok(IssuedNotice {
            notice,
            tsa: proof.tsa,
            blockchain: proof.blockchain,
        })
    }

    /// Register any non-notice evidentiary document from its JSON fields.
    pub async fn register_document(
        &self,
        kind: DocumentKind,
        id: Option<DocumentId>,
        fields: &Value,
        now: Timestamp,
    ) -> LifecycleResult<IntegrityRecord> {
        if kind == DocumentKind::Notice {
            return Err(LifecycleError::InvalidDocument(
                "notices are issued, not registered".into(),
            ));
        }
        let canonical = CanonicalDocument::from_json(kind, fields)?;
        if canonical.fields().is_empty() {
            return Err(LifecycleError::InvalidDocument("no fields".into()));
        }

        let id = id.unwrap_or_else(DocumentId::generate);
        let document = DocumentRef::new(kind, id.as_str());
        self.ledger.register_document(document.clone(), &canonical, now)?;
        self.ledger.timestamp_document(&document, now).await?;
        self.ledger
            .record(&document)?
            .ok_or(LifecycleError::NotFound)
    }
}

fn validate_content(content: &NoticeContent) -> LifecycleResult<()> {
    let required = [
        ("employee_id", content.employee_id.as_str()),
        ("company_id", content.company_id.as_str()),
        ("sanction_type", content.sanction_type.as_str()),
        ("body", content.body.as_str()),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(LifecycleError::InvalidDocument(format!("{name} is empty")));
        }
    }
    Ok(())
}
