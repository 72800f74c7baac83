//! Public, unauthenticated hash verification.
//!
//! Every query is logged with the caller's metadata. A mismatch is a normal
//! negative result, and reveals nothing about stored documents.

use serde::{Deserialize, Serialize};

use herald_core::{
    constant_time_eq, AccessContext, Anchor, AuditChainWriter, AuditEvent, AuditEventKind,
    ContentHash, DocumentRef, IntegrityRecord, IntegrityRepository, ProofState, Timestamp,
    VerificationQuery,
};

use crate::error::LedgerResult;

/// Longest query string kept in the log.
const MAX_QUERY_LEN: usize = 128;

/// Proof status disclosed only for a matching hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStatus {
    pub document: DocumentRef,
    pub hashed_at: Timestamp,
    pub tsa: ProofState,
    pub blockchain: ProofState,
    pub anchor: Option<Anchor>,
    pub signed: bool,
    pub legally_valid: bool,
}

impl ProofStatus {
    fn of(record: &IntegrityRecord) -> Self {
        Self {
            document: record.document.clone(),
            hashed_at: record.hashed_at,
            tsa: record.tsa_state,
            blockchain: record.blockchain.state,
            anchor: record.blockchain.anchor.clone(),
            signed: record.signature.is_some(),
            legally_valid: record.is_legally_valid(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub matched: bool,
    pub proof_status: Option<ProofStatus>,
}

impl VerificationResult {
    fn no_match() -> Self {
        Self {
            matched: false,
            proof_status: None,
        }
    }
}

fn log_query(
    repo: &dyn IntegrityRepository,
    audit: &dyn AuditChainWriter,
    queried: &str,
    document: Option<DocumentRef>,
    matched: bool,
    caller: AccessContext,
    now: Timestamp,
) -> LedgerResult<()> {
    repo.append_verification_query(&VerificationQuery {
        at: now,
        queried_hash: queried.to_string(),
        document,
        matched,
        caller,
    })?;
    audit.append(AuditEvent::new(
        AuditEventKind::VerificationQueried {
            queried_hash: queried.to_string(),
            matched,
        },
        now,
    ))?;
    Ok(())
}

/// Look up a hash against every registered document. Malformed input is
/// simply a non-match.
pub fn verify_hash(
    repo: &dyn IntegrityRepository,
    audit: &dyn AuditChainWriter,
    queried: &str,
    caller: AccessContext,
    now: Timestamp,
) -> LedgerResult<VerificationResult> {
    let normalized: String = queried
        .trim()
        .chars()
        .take(MAX_QUERY_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    let record = match ContentHash::from_hex(&normalized) {
        Some(hash) => repo.find_integrity_by_hash(&hash)?,
        None => None,
    };

    let result = match &record {
        Some(r) => VerificationResult {
            matched: true,
            proof_status: Some(ProofStatus::of(r)),
        },
        None => VerificationResult::no_match(),
    };
    tracing::info!(matched = result.matched, "verification query");
    log_query(
        repo,
        audit,
        &normalized,
        record.map(|r| r.document),
        result.matched,
        caller,
        now,
    )?;
    Ok(result)
}

/// Compare a candidate hash against one known document.
pub fn verify_document(
    repo: &dyn IntegrityRepository,
    audit: &dyn AuditChainWriter,
    document: &DocumentRef,
    candidate: &ContentHash,
    caller: AccessContext,
    now: Timestamp,
) -> LedgerResult<VerificationResult> {
    let record = repo.get_integrity(document)?;
    let result = match &record {
        Some(r) if constant_time_eq(&r.content_hash.0, &candidate.0) => VerificationResult {
            matched: true,
            proof_status: Some(ProofStatus::of(r)),
        },
        _ => VerificationResult::no_match(),
    };
    log_query(
        repo,
        audit,
        &candidate.to_hex(),
        Some(document.clone()),
        result.matched,
        caller,
        now,
    )?;
    Ok(result)
}
