//! External ledger collaborator.
//!
//! The ledger is an append-only key → hash store. Audit anchoring uses
//! [`Ledger::submit`] and [`Ledger::verify`]; the remaining operations serve
//! the dispensing workflow, which registers physical items and marks them
//! consumed exactly once.

use std::collections::HashMap;

use async_trait::async_trait;
use common::{model::AuditAction, TrustError};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::crypto::{random_token, sha256_hex};

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger could not be reached.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The ledger refused the write (duplicate id, unknown item, double spend).
    #[error("ledger rejected request: {0}")]
    Rejected(String),
}

impl From<LedgerError> for TrustError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Unavailable(_) => TrustError::Unavailable(e.to_string()),
            LedgerError::Rejected(_) => TrustError::Validation(e.to_string()),
        }
    }
}

/// What the ledger holds for an anchored audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub action: AuditAction,
    pub hash: String,
    pub timestamp_secs: i64,
    /// Identity of the writer as recorded by the ledger.
    pub submitter: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Anchor an audit hash. Returns the ledger's transaction reference.
    async fn submit(
        &self,
        audit_id: Uuid,
        action: AuditAction,
        hash: &str,
        timestamp_secs: i64,
    ) -> Result<String, LedgerError>;

    /// Fetch what was anchored for `audit_id`, if anything.
    async fn verify(&self, audit_id: Uuid) -> Result<Option<LedgerRecord>, LedgerError>;

    /// Register a dispensable item and return its reference.
    async fn register(&self, name: &str, batch: &str) -> Result<String, LedgerError>;

    async fn is_consumed(&self, item_ref: &str) -> Result<bool, LedgerError>;

    /// Mark an item consumed. A second call for the same item is rejected.
    async fn mark_consumed(&self, item_ref: &str) -> Result<(), LedgerError>;
}

#[derive(Debug, Default)]
struct Item {
    consumed: bool,
}

/// In-process append-only ledger.
///
/// Records are never overwritten: resubmitting an audit id or re-registering
/// an item is rejected.
#[derive(Debug)]
pub struct InMemoryLedger {
    submitter: String,
    records: RwLock<HashMap<Uuid, LedgerRecord>>,
    items: RwLock<HashMap<String, Item>>,
}

impl InMemoryLedger {
    pub fn new(submitter: impl Into<String>) -> Self {
        Self {
            submitter: submitter.into(),
            records: RwLock::new(HashMap::new()),
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new("vault")
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn submit(
        &self,
        audit_id: Uuid,
        action: AuditAction,
        hash: &str,
        timestamp_secs: i64,
    ) -> Result<String, LedgerError> {
        let mut records = self.records.write().await;
        if records.contains_key(&audit_id) {
            return Err(LedgerError::Rejected(format!("{audit_id} already anchored")));
        }
        records.insert(
            audit_id,
            LedgerRecord {
                action,
                hash: hash.to_owned(),
                timestamp_secs,
                submitter: self.submitter.clone(),
            },
        );
        Ok(format!("0x{}", random_token(32)))
    }

    async fn verify(&self, audit_id: Uuid) -> Result<Option<LedgerRecord>, LedgerError> {
        Ok(self.records.read().await.get(&audit_id).cloned())
    }

    async fn register(&self, name: &str, batch: &str) -> Result<String, LedgerError> {
        if name.is_empty() || batch.is_empty() {
            return Err(LedgerError::Rejected("name and batch are required".into()));
        }
        let item_ref = sha256_hex(format!("{name}\n{batch}").as_bytes());
        let mut items = self.items.write().await;
        if items.contains_key(&item_ref) {
            return Err(LedgerError::Rejected("item already registered".into()));
        }
        items.insert(item_ref.clone(), Item::default());
        Ok(item_ref)
    }

    async fn is_consumed(&self, item_ref: &str) -> Result<bool, LedgerError> {
        Ok(self
            .items
            .read()
            .await
            .get(item_ref)
            .is_some_and(|item| item.consumed))
    }

    async fn mark_consumed(&self, item_ref: &str) -> Result<(), LedgerError> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(item_ref)
            .ok_or_else(|| LedgerError::Rejected("unknown item".into()))?;
        if item.consumed {
            return Err(LedgerError::Rejected("item already consumed".into()));
        }
        item.consumed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_is_append_only() {
        let ledger = InMemoryLedger::default();
        let id = Uuid::new_v4();
        let tx = ledger
            .submit(id, AuditAction::MedicineDispensed, "abc", 1_700_000_000)
            .await
            .unwrap();
        assert!(tx.starts_with("0x"));

        assert!(matches!(
            ledger.submit(id, AuditAction::MedicineDispensed, "def", 1_700_000_001).await,
            Err(LedgerError::Rejected(_))
        ));
        let record = ledger.verify(id).await.unwrap().unwrap();
        assert_eq!(record.hash, "abc");
        assert_eq!(record.submitter, "vault");
        assert!(ledger.verify(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn items_are_consumed_once() {
        let ledger = InMemoryLedger::default();
        let item = ledger.register("amoxicillin 500mg", "B-1042").await.unwrap();
        assert!(!ledger.is_consumed(&item).await.unwrap());

        ledger.mark_consumed(&item).await.unwrap();
        assert!(ledger.is_consumed(&item).await.unwrap());
        assert!(matches!(
            ledger.mark_consumed(&item).await,
            Err(LedgerError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_and_unknown_items_rejected() {
        let ledger = InMemoryLedger::default();
        ledger.register("paracetamol", "B-7").await.unwrap();
        assert!(ledger.register("paracetamol", "B-7").await.is_err());
        assert!(ledger.mark_consumed("missing").await.is_err());
        assert!(!ledger.is_consumed("missing").await.unwrap());
    }
}
