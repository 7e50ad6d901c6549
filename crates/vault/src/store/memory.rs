//! [`MemoryStore`]: in-process implementation of every storage trait.
//!
//! Each collection sits behind its own `tokio::sync::RwLock`. Writes complete
//! before the lock is released, so every subsequent read observes them.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use common::model::{AuditEntry, ConsentGrant, IdentityRecord};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AuditFilter, AuditPage, AuditStore, ConsentStore, IdentityStore, Page, StoreError,
};

/// Thread-safe in-memory store.
///
/// Cheap to clone; clones share the same underlying collections.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    grants: Arc<RwLock<HashMap<Uuid, ConsentGrant>>>,
    /// Insertion order is preserved so equal timestamps sort deterministically.
    audit: Arc<RwLock<Vec<AuditEntry>>>,
    identities: Arc<RwLock<HashMap<String, IdentityRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of audit entries held.
    pub async fn audit_len(&self) -> usize {
        self.audit.read().await.len()
    }
}

fn newest_first(mut grants: Vec<ConsentGrant>) -> Vec<ConsentGrant> {
    grants.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    grants
}

#[async_trait]
impl ConsentStore for MemoryStore {
    async fn insert_grant(&self, grant: ConsentGrant) -> Result<(), StoreError> {
        let mut grants = self.grants.write().await;
        if grants.contains_key(&grant.id) {
            return Err(StoreError::Conflict(format!("grant {} already exists", grant.id)));
        }
        grants.insert(grant.id, grant);
        Ok(())
    }

    async fn get_grant(&self, id: Uuid) -> Result<Option<ConsentGrant>, StoreError> {
        Ok(self.grants.read().await.get(&id).cloned())
    }

    async fn revoke_grant(&self, id: Uuid) -> Result<Option<ConsentGrant>, StoreError> {
        let mut grants = self.grants.write().await;
        Ok(grants.get_mut(&id).map(|grant| {
            grant.revoked = true;
            grant.clone()
        }))
    }

    async fn grants_between(
        &self,
        subject_id: &str,
        grantee_id: &str,
    ) -> Result<Vec<ConsentGrant>, StoreError> {
        let grants = self.grants.read().await;
        Ok(newest_first(
            grants
                .values()
                .filter(|g| g.subject_id == subject_id && g.grantee_id == grantee_id)
                .cloned()
                .collect(),
        ))
    }

    async fn grants_for_subject(&self, subject_id: &str) -> Result<Vec<ConsentGrant>, StoreError> {
        let grants = self.grants.read().await;
        Ok(newest_first(
            grants
                .values()
                .filter(|g| g.subject_id == subject_id)
                .cloned()
                .collect(),
        ))
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let mut audit = self.audit.write().await;
        if audit.iter().any(|e| e.id == entry.id) {
            return Err(StoreError::Conflict(format!("audit entry {} already exists", entry.id)));
        }
        audit.push(entry);
        Ok(())
    }

    async fn get_audit(&self, id: Uuid) -> Result<Option<AuditEntry>, StoreError> {
        Ok(self.audit.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn set_ledger_ref(&self, id: Uuid, ledger_ref: &str) -> Result<(), StoreError> {
        let mut audit = self.audit.write().await;
        let entry = audit
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("audit entry {id}")))?;
        if entry.ledger_ref.is_some() {
            return Err(StoreError::Conflict(format!(
                "audit entry {id} is already ledger-anchored"
            )));
        }
        entry.ledger_ref = Some(ledger_ref.to_owned());
        Ok(())
    }

    async fn query_audit(&self, filter: &AuditFilter, page: Page) -> Result<AuditPage, StoreError> {
        let audit = self.audit.read().await;
        // Reverse insertion order first so the stable sort keeps later inserts
        // ahead of earlier ones when timestamps tie.
        let mut matching: Vec<&AuditEntry> =
            audit.iter().rev().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let total = matching.len();
        let entries = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok(AuditPage { entries, total })
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn insert_identity(&self, record: IdentityRecord) -> Result<(), StoreError> {
        let mut identities = self.identities.write().await;
        if identities.contains_key(&record.lookup_hash) {
            return Err(StoreError::Conflict("lookup hash already registered".into()));
        }
        identities.insert(record.lookup_hash.clone(), record);
        Ok(())
    }

    async fn find_identity(&self, lookup_hash: &str) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.identities.read().await.get(lookup_hash).cloned())
    }
}
