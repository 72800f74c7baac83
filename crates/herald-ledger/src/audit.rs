use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard};

use herald_core::{
    AuditChainWriter, AuditEvent, AuditHash, AuditPersistence, HeraldError, HeraldResult,
};

/// Hash-chained append-only audit log.
///
/// Each entry includes the hash of the previous entry for tamper evidence.
/// The chain can be verified by recomputing all hashes from the genesis entry.
///
/// When constructed with [`AuditChain::with_persistence`], every appended
/// entry is written through before it joins the in-memory chain, and the
/// chain is reloaded from the store on startup.
pub struct AuditChain {
    entries: Mutex<Vec<AuditEntry>>,
    persistence: Option<Arc<dyn AuditPersistence>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub event: AuditEvent,
    pub hash: AuditHash,
}

impl AuditChain {
    /// In-memory chain, no persistence.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            persistence: None,
        }
    }

    /// Chain backed by durable storage. Existing entries are loaded as-is;
    /// call `verify_chain` to check them.
    pub fn with_persistence(persistence: Arc<dyn AuditPersistence>) -> HeraldResult<Self> {
        let entries = persistence
            .load_audit_entries()?
            .into_iter()
            .map(|(hash, event)| AuditEntry { event, hash })
            .collect();
        Ok(Self {
            entries: Mutex::new(entries),
            persistence: Some(persistence),
        })
    }

    fn lock(&self) -> HeraldResult<MutexGuard<'_, Vec<AuditEntry>>> {
        self.entries
            .lock()
            .map_err(|e| HeraldError::Storage(format!("audit lock poisoned: {}", e)))
    }

    /// Compute the hash of an audit event including the previous hash.
    fn compute_hash(event: &AuditEvent, previous: Option<&AuditHash>) -> HeraldResult<AuditHash> {
        let mut hasher = Sha256::new();

        if let Some(prev) = previous {
            hasher.update(prev.0);
        }

        hasher.update(event.timestamp.seconds_since_epoch.to_le_bytes());
        hasher.update(event.timestamp.nanoseconds.to_le_bytes());

        let kind_bytes = serde_json::to_vec(&event.kind)?;
        hasher.update(&kind_bytes);

        let hash = hasher.finalize();
        let mut result = [0u8; 32];
        result.copy_from_slice(&hash);
        Ok(AuditHash(result))
    }

    /// Recompute every link of an exported chain.
    pub fn verify_entries(entries: &[AuditEntry]) -> HeraldResult<bool> {
        let mut previous: Option<&AuditHash> = None;
        for entry in entries {
            if entry.event.previous_hash.as_ref() != previous {
                return Ok(false);
            }
            if Self::compute_hash(&entry.event, previous)? != entry.hash {
                return Ok(false);
            }
            previous = Some(&entry.hash);
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, oldest first (for export).
    pub fn entries(&self) -> HeraldResult<Vec<AuditEntry>> {
        Ok(self.lock()?.clone())
    }
}

impl Default for AuditChain {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditChainWriter for AuditChain {
    fn append(&self, mut event: AuditEvent) -> HeraldResult<AuditHash> {
        let mut entries = self.lock()?;

        let previous = entries.last().map(|e| &e.hash);
        event.previous_hash = previous.cloned();
        let hash = Self::compute_hash(&event, previous)?;

        if let Some(persistence) = &self.persistence {
            persistence.persist_audit_entry(&hash, &event)?;
        }

        tracing::debug!(hash = %hash, "audit entry appended");
        entries.push(AuditEntry {
            event,
            hash: hash.clone(),
        });
        Ok(hash)
    }

    fn verify_chain(&self) -> HeraldResult<bool> {
        let entries = self.lock()?;
        Self::verify_entries(&entries)
    }

    fn head(&self) -> HeraldResult<Option<AuditHash>> {
        Ok(self.lock()?.last().map(|e| e.hash.clone()))
    }

    fn recent(&self, limit: usize) -> HeraldResult<Vec<AuditEvent>> {
        let entries = self.lock()?;
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].iter().map(|e| e.event.clone()).collect())
    }
}
