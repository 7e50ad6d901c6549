//! Persistence collaborator interfaces.
//!
//! The core never talks to a database directly. It needs atomic per-entity
//! create/update, read-your-writes consistency (a revoke must be visible to
//! the next verify from any caller), and a uniqueness constraint on identity
//! lookup hashes. [`MemoryStore`] is the in-process reference implementation.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    model::{AuditAction, AuditEntry, ConsentGrant, IdentityRecord},
    TrustError,
};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The record to update does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The backend failed or is unreachable.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for TrustError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(_) => TrustError::Validation(e.to_string()),
            StoreError::NotFound(_) => TrustError::NotFound(e.to_string()),
            StoreError::Backend(_) => TrustError::Unavailable(e.to_string()),
        }
    }
}

/// Storage for consent grants. Grants are never deleted.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    async fn insert_grant(&self, grant: ConsentGrant) -> Result<(), StoreError>;

    async fn get_grant(&self, id: Uuid) -> Result<Option<ConsentGrant>, StoreError>;

    /// Set `revoked = true` and return the updated grant, or `None` if absent.
    async fn revoke_grant(&self, id: Uuid) -> Result<Option<ConsentGrant>, StoreError>;

    /// Every grant from `subject_id` to `grantee_id`, in any state.
    async fn grants_between(
        &self,
        subject_id: &str,
        grantee_id: &str,
    ) -> Result<Vec<ConsentGrant>, StoreError>;

    /// Every grant issued by `subject_id`, in any state.
    async fn grants_for_subject(&self, subject_id: &str) -> Result<Vec<ConsentGrant>, StoreError>;
}

/// Filters applied by [`AuditStore::query_audit`]. `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Inclusive lower bound on `timestamp`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `timestamp`.
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor.as_ref().map_or(true, |a| *a == entry.actor)
            && self.action.map_or(true, |a| a == entry.action)
            && self
                .resource_type
                .as_ref()
                .map_or(true, |t| *t == entry.resource_type)
            && self
                .resource_id
                .as_ref()
                .map_or(true, |r| *r == entry.resource_id)
            && self.since.map_or(true, |s| entry.timestamp >= s)
            && self.until.map_or(true, |u| entry.timestamp < u)
    }
}

/// Offset/limit pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 500;

    /// Clamp `limit` into `1..=MAX_LIMIT`.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_LIMIT)
    }
}

/// One page of audit entries plus the total number of matches.
#[derive(Debug, Clone)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    pub total: usize,
}

/// Storage for audit entries. Entries are immutable apart from a one-time
/// ledger reference back-fill.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;

    async fn get_audit(&self, id: Uuid) -> Result<Option<AuditEntry>, StoreError>;

    /// Record the ledger reference for `id`. Fails with
    /// [`StoreError::Conflict`] if a reference is already set.
    async fn set_ledger_ref(&self, id: Uuid, ledger_ref: &str) -> Result<(), StoreError>;

    /// Matching entries, most recent first.
    async fn query_audit(&self, filter: &AuditFilter, page: Page) -> Result<AuditPage, StoreError>;
}

/// Storage for protected identity numbers.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Insert a record. Fails with [`StoreError::Conflict`] if the lookup hash
    /// is already present.
    async fn insert_identity(&self, record: IdentityRecord) -> Result<(), StoreError>;

    async fn find_identity(&self, lookup_hash: &str) -> Result<Option<IdentityRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(Page::new(0, 0).limit, 1);
        assert_eq!(Page::new(0, 10_000).limit, Page::MAX_LIMIT);
        assert_eq!(Page::default().limit, Page::DEFAULT_LIMIT);
    }

    #[test]
    fn empty_filter_matches_everything() {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            actor: "doctor-7".into(),
            action: AuditAction::IdentityViewed,
            resource_type: "patient".into(),
            resource_id: "patient-1".into(),
            timestamp: Utc::now(),
            local_hash: String::new(),
            ledger_ref: None,
        };
        assert!(AuditFilter::default().matches(&entry));
        let filter = AuditFilter {
            actor: Some("pharmacist-2".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));
    }
}
