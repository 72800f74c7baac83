//! Detached Ed25519 signatures over a canonical envelope
//! `{document_id, hash, signer, timestamp}`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

use herald_core::{
    ContentHash, DocumentRef, IntegrityMutation, IntegrityRepository, MutationOutcome,
    RejectReason, SignatureBlock, Signer, Timestamp,
};

use crate::error::{LedgerError, LedgerResult};
use crate::signer::verify_detached;

/// Field order here is the signed byte order.
#[derive(Serialize)]
struct Envelope<'a> {
    document_id: &'a str,
    hash: String,
    signer: &'a str,
    timestamp: String,
}

pub fn envelope_json(
    document: &DocumentRef,
    hash: &ContentHash,
    signer: &str,
    signed_at: &Timestamp,
) -> LedgerResult<String> {
    let key = document.key();
    let envelope = Envelope {
        document_id: &key,
        hash: hash.to_hex(),
        signer,
        timestamp: signed_at.to_rfc3339(),
    };
    serde_json::to_string(&envelope).map_err(|e| LedgerError::Encoding(e.to_string()))
}

/// Sign a registered document once. A second signature is refused.
pub fn apply_digital_signature(
    repo: &dyn IntegrityRepository,
    signer: &dyn Signer,
    signer_identity: &str,
    document: &DocumentRef,
    now: Timestamp,
) -> LedgerResult<SignatureBlock> {
    let record = repo
        .get_integrity(document)?
        .ok_or_else(|| LedgerError::NotFound(document.key()))?;
    if record.signature.is_some() {
        return Err(LedgerError::AlreadySigned(document.key()));
    }

    let envelope = envelope_json(document, &record.content_hash, signer_identity, &now)?;
    let signature = signer.sign_ed25519(envelope.as_bytes())?;
    let block = SignatureBlock {
        document: document.clone(),
        hash: record.content_hash,
        signer: signer_identity.to_string(),
        signed_at: now,
        envelope,
        public_key: hex::encode(signer.public_key_ed25519()),
        signature: BASE64.encode(signature),
    };

    match repo.apply_integrity(
        document,
        &IntegrityMutation::AttachSignature {
            block: block.clone(),
        },
    )? {
        MutationOutcome::Applied => {
            tracing::info!(document = %document, "document signed");
            Ok(block)
        }
        MutationOutcome::Rejected(RejectReason::AlreadySigned) => {
            Err(LedgerError::AlreadySigned(document.key()))
        }
        other => Err(LedgerError::Storage(format!(
            "unexpected signature outcome: {:?}",
            other
        ))),
    }
}

/// Check that a block's envelope matches its fields and that the signature
/// verifies under the embedded public key.
pub fn verify_signature_block(block: &SignatureBlock) -> bool {
    let expected = match envelope_json(&block.document, &block.hash, &block.signer, &block.signed_at)
    {
        Ok(e) => e,
        Err(_) => return false,
    };
    if expected != block.envelope {
        return false;
    }
    let public_key: [u8; 32] = match hex::decode(&block.public_key)
        .ok()
        .and_then(|b| b.try_into().ok())
    {
        Some(k) => k,
        None => return false,
    };
    let signature: [u8; 64] = match BASE64
        .decode(&block.signature)
        .ok()
        .and_then(|b| b.try_into().ok())
    {
        Some(s) => s,
        None => return false,
    };
    verify_detached(&public_key, block.envelope.as_bytes(), &signature)
}
