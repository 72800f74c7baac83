//! Integrity records: one per evidentiary document.
//!
//! A record carries the canonical content hash plus optional proofs: a
//! time-stamp authority token, a blockchain anchoring proof that matures
//! over time, and a detached signature. Proofs are write-once.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::notice::{MutationOutcome, ProofState, RejectReason};
use crate::types::{ContentHash, DocumentId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Notice,
    WitnessStatement,
    EvidenceFile,
    DischargeResponse,
    LogEntry,
    ExportBundle,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Notice => "notice",
            DocumentKind::WitnessStatement => "witness_statement",
            DocumentKind::EvidenceFile => "evidence_file",
            DocumentKind::DischargeResponse => "discharge_response",
            DocumentKind::LogEntry => "log_entry",
            DocumentKind::ExportBundle => "export_bundle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub kind: DocumentKind,
    pub id: DocumentId,
}

impl DocumentRef {
    pub fn new(kind: DocumentKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: DocumentId::new(id),
        }
    }

    /// Stable storage key, `<kind>/<id>`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.id)
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Signed token issued by a time-stamp authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedToken {
    pub authority: String,
    /// Opaque token bytes, base64.
    pub token: String,
    pub stamped_at: Timestamp,
}

/// Where a blockchain notary anchored a hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub block_height: u64,
    pub block_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingProof {
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainProof {
    pub state: ProofState,
    pub handle: Option<PendingProof>,
    pub submitted_at: Option<Timestamp>,
    pub attempts: u32,
    pub last_polled_at: Option<Timestamp>,
    pub anchor: Option<Anchor>,
    pub resolved_at: Option<Timestamp>,
    pub failure_reason: Option<String>,
}

impl BlockchainProof {
    pub fn absent() -> Self {
        Self {
            state: ProofState::Absent,
            handle: None,
            submitted_at: None,
            attempts: 0,
            last_polled_at: None,
            anchor: None,
            resolved_at: None,
            failure_reason: None,
        }
    }
}

/// Detached signature over the canonical envelope
/// `{documentId, hash, signer, timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    pub document: DocumentRef,
    pub hash: ContentHash,
    pub signer: String,
    pub signed_at: Timestamp,
    /// Exact bytes that were signed, as UTF-8 JSON.
    pub envelope: String,
    /// Ed25519 public key, hex.
    pub public_key: String,
    /// Ed25519 signature, base64.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub document: DocumentRef,
    pub content_hash: ContentHash,
    pub hashed_at: Timestamp,
    pub tsa_state: ProofState,
    pub tsa_token: Option<SignedToken>,
    pub tsa_failure: Option<String>,
    pub blockchain: BlockchainProof,
    pub signature: Option<SignatureBlock>,
    pub version: u64,
}

impl IntegrityRecord {
    pub fn new(document: DocumentRef, content_hash: ContentHash, hashed_at: Timestamp) -> Self {
        Self {
            document,
            content_hash,
            hashed_at,
            tsa_state: ProofState::Absent,
            tsa_token: None,
            tsa_failure: None,
            blockchain: BlockchainProof::absent(),
            signature: None,
            version: 0,
        }
    }

    /// A document stays legally valid as long as one proof holds or nothing
    /// has been attempted yet; a failed anchor alone never invalidates it.
    pub fn is_legally_valid(&self) -> bool {
        self.tsa_state == ProofState::Confirmed
            || self.blockchain.state == ProofState::Confirmed
            || self.tsa_state != ProofState::Failed
    }

    pub fn apply(&mut self, mutation: &IntegrityMutation) -> MutationOutcome {
        let outcome = match mutation {
            IntegrityMutation::AttachTsaToken { token } => {
                if self.tsa_state == ProofState::Confirmed {
                    MutationOutcome::AlreadySet
                } else {
                    self.tsa_token = Some(token.clone());
                    self.tsa_state = ProofState::Confirmed;
                    self.tsa_failure = None;
                    MutationOutcome::Applied
                }
            }
            IntegrityMutation::TsaFailed { reason } => match self.tsa_state {
                ProofState::Confirmed | ProofState::Failed => MutationOutcome::AlreadySet,
                _ => {
                    self.tsa_state = ProofState::Failed;
                    self.tsa_failure = Some(reason.clone());
                    MutationOutcome::Applied
                }
            },
            IntegrityMutation::SubmitBlockchain { handle, at } => {
                if self.blockchain.state != ProofState::Absent {
                    MutationOutcome::AlreadySet
                } else {
                    self.blockchain.state = ProofState::Pending;
                    self.blockchain.handle = Some(handle.clone());
                    self.blockchain.submitted_at = Some(*at);
                    MutationOutcome::Applied
                }
            }
            IntegrityMutation::BlockchainSubmitFailed { at, reason } => {
                if self.blockchain.state != ProofState::Absent {
                    MutationOutcome::AlreadySet
                } else {
                    self.blockchain.state = ProofState::Failed;
                    self.blockchain.resolved_at = Some(*at);
                    self.blockchain.failure_reason = Some(reason.clone());
                    MutationOutcome::Applied
                }
            }
            IntegrityMutation::PollUnconfirmed { at, max_attempts } => {
                if self.blockchain.state != ProofState::Pending {
                    MutationOutcome::AlreadySet
                } else {
                    self.blockchain.attempts += 1;
                    self.blockchain.last_polled_at = Some(*at);
                    if self.blockchain.attempts >= *max_attempts {
                        self.blockchain.state = ProofState::Failed;
                        self.blockchain.resolved_at = Some(*at);
                        self.blockchain.failure_reason =
                            Some(format!("unconfirmed after {} polls", self.blockchain.attempts));
                    }
                    MutationOutcome::Applied
                }
            }
            IntegrityMutation::ConfirmBlockchain { anchor, at } => {
                if self.blockchain.state != ProofState::Pending {
                    MutationOutcome::AlreadySet
                } else {
                    self.blockchain.attempts += 1;
                    self.blockchain.last_polled_at = Some(*at);
                    self.blockchain.state = ProofState::Confirmed;
                    self.blockchain.anchor = Some(anchor.clone());
                    self.blockchain.resolved_at = Some(*at);
                    MutationOutcome::Applied
                }
            }
            IntegrityMutation::AttachSignature { block } => {
                if self.signature.is_some() {
                    MutationOutcome::Rejected(RejectReason::AlreadySigned)
                } else {
                    self.signature = Some(block.clone());
                    MutationOutcome::Applied
                }
            }
        };

        if outcome.is_applied() {
            self.version += 1;
        }
        outcome
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityMutation {
    AttachTsaToken { token: SignedToken },
    TsaFailed { reason: String },
    SubmitBlockchain { handle: PendingProof, at: Timestamp },
    BlockchainSubmitFailed { at: Timestamp, reason: String },
    PollUnconfirmed { at: Timestamp, max_attempts: u32 },
    ConfirmBlockchain { anchor: Anchor, at: Timestamp },
    AttachSignature { block: SignatureBlock },
}
