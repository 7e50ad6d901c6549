//! Two-tier audit logging.
//!
//! Tier 1 writes every [`AuditEntry`] to the local store before
//! [`AuditTrail::log`] returns. Tier 2 anchors the entry's hash to the
//! [`Ledger`] for critical actions only, in a background task bounded by
//! `LEDGER_TIMEOUT_MS`. A tier-2 failure is logged and counted; it never
//! removes the local entry or fails the caller.

pub mod ledger;

pub use ledger::{InMemoryLedger, Ledger, LedgerError, LedgerRecord};

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, SubsecRound, Utc};
use common::{
    model::{AuditAction, AuditEntry},
    TrustError,
};
use opentelemetry::{global, metrics::Counter, KeyValue};
use serde::Serialize;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::crypto::sha256_hex;
use crate::store::{AuditFilter, AuditPage, AuditStore, Page, StoreError};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("{0}")]
    Validation(&'static str),

    #[error("audit entry {0} not found")]
    NotFound(Uuid),

    /// The ledger could not be consulted. Distinct from a hash mismatch.
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AuditError> for TrustError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::Validation(_) => TrustError::Validation(e.to_string()),
            AuditError::NotFound(_) => TrustError::NotFound(e.to_string()),
            AuditError::LedgerUnavailable(_) => TrustError::Unavailable(e.to_string()),
            AuditError::Store(s) => s.into(),
        }
    }
}

/// An action to record.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub actor: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

/// Result of [`AuditTrail::verify_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityReport {
    /// Local hash recomputes and matches the ledger.
    Verified { ledger_ref: String },
    /// Local hash recomputes; the entry was never anchored.
    NotAnchored,
    /// The stored entry no longer matches its own hash.
    LocalMismatch,
    /// The ledger holds a different hash or action for this entry.
    LedgerMismatch,
    /// The entry claims a ledger reference the ledger does not know.
    LedgerMissing,
}

impl IntegrityReport {
    pub fn is_tampered(&self) -> bool {
        matches!(
            self,
            IntegrityReport::LocalMismatch
                | IntegrityReport::LedgerMismatch
                | IntegrityReport::LedgerMissing
        )
    }
}

/// Field order here is the canonical hash order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalFields<'a> {
    actor: &'a str,
    action: AuditAction,
    resource_type: &'a str,
    resource_id: &'a str,
    timestamp: i64,
}

fn canonical_hash(
    actor: &str,
    action: AuditAction,
    resource_type: &str,
    resource_id: &str,
    timestamp: DateTime<Utc>,
) -> String {
    let fields = CanonicalFields {
        actor,
        action,
        resource_type,
        resource_id,
        timestamp: timestamp.timestamp_millis(),
    };
    // Serialising a struct of strings and an i64 cannot fail.
    let json = serde_json::to_vec(&fields).unwrap_or_default();
    sha256_hex(&json)
}

fn entry_hash(entry: &AuditEntry) -> String {
    canonical_hash(
        &entry.actor,
        entry.action,
        &entry.resource_type,
        &entry.resource_id,
        entry.timestamp,
    )
}

pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    ledger: Arc<dyn Ledger>,
    ledger_timeout: Duration,
    tracker: TaskTracker,
    failures: Arc<AtomicU64>,
    failure_counter: Counter<u64>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("ledger_timeout", &self.ledger_timeout)
            .field("pending", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl AuditTrail {
    pub fn new(
        store: Arc<dyn AuditStore>,
        ledger: Arc<dyn Ledger>,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            ledger_timeout,
            tracker: TaskTracker::new(),
            failures: Arc::new(AtomicU64::new(0)),
            failure_counter: global::meter("vault")
                .u64_counter("audit.ledger.anchor_failures")
                .with_description("Critical audit entries that could not be anchored")
                .init(),
        }
    }

    /// Record `event` locally and, for critical actions, schedule ledger
    /// anchoring.
    ///
    /// Returns once the local write completes. The returned entry has no
    /// `ledger_ref` yet; it is back-filled when anchoring succeeds.
    ///
    /// # Errors
    ///
    /// Fails only if the event is incomplete or the local write fails.
    pub async fn log(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        if event.actor.is_empty() {
            return Err(AuditError::Validation("audit actor must not be empty"));
        }
        if event.resource_type.is_empty() {
            return Err(AuditError::Validation("audit resource type must not be empty"));
        }

        let timestamp = Utc::now().trunc_subsecs(3);
        let local_hash = canonical_hash(
            &event.actor,
            event.action,
            &event.resource_type,
            &event.resource_id,
            timestamp,
        );
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            actor: event.actor,
            action: event.action,
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            timestamp,
            local_hash,
            ledger_ref: None,
        };
        self.store.insert_audit(entry.clone()).await?;
        debug!(audit_id = %entry.id, action = %entry.action, "audit entry recorded");

        if entry.action.is_critical() {
            self.anchor(&entry);
        }
        Ok(entry)
    }

    fn anchor(&self, entry: &AuditEntry) {
        let store = Arc::clone(&self.store);
        let ledger = Arc::clone(&self.ledger);
        let failures = Arc::clone(&self.failures);
        let counter = self.failure_counter.clone();
        let timeout = self.ledger_timeout;
        let id = entry.id;
        let action = entry.action;
        let hash = entry.local_hash.clone();
        let timestamp_secs = entry.timestamp.timestamp();

        self.tracker.spawn(async move {
            let submitted =
                tokio::time::timeout(timeout, ledger.submit(id, action, &hash, timestamp_secs))
                    .await;
            let failure = match submitted {
                Ok(Ok(tx_ref)) => match store.set_ledger_ref(id, &tx_ref).await {
                    Ok(()) => {
                        info!(audit_id = %id, %action, tx_ref = %tx_ref, "audit entry anchored");
                        return;
                    }
                    Err(e) => format!("back-fill failed: {e}"),
                },
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", timeout.as_millis()),
            };
            failures.fetch_add(1, Ordering::Relaxed);
            counter.add(1, &[KeyValue::new("action", action.as_str())]);
            warn!(audit_id = %id, %action, error = %failure, "ledger anchoring failed");
        });
    }

    /// Wait for all in-flight anchoring tasks.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of anchoring attempts that failed or timed out since startup.
    pub fn anchoring_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub async fn get(&self, id: Uuid) -> Result<AuditEntry, AuditError> {
        self.store
            .get_audit(id)
            .await?
            .ok_or(AuditError::NotFound(id))
    }

    /// Recompute the entry's hash and compare it with the ledger's copy.
    ///
    /// An entry without a ledger reference reports
    /// [`IntegrityReport::NotAnchored`]; that is informational, not a failure.
    ///
    /// # Errors
    ///
    /// [`AuditError::LedgerUnavailable`] if the ledger cannot be consulted
    /// within the configured timeout.
    pub async fn verify_integrity(&self, id: Uuid) -> Result<IntegrityReport, AuditError> {
        let entry = self.get(id).await?;

        if entry_hash(&entry) != entry.local_hash {
            error!(audit_id = %id, "audit entry does not match its local hash");
            return Ok(IntegrityReport::LocalMismatch);
        }
        let Some(ledger_ref) = entry.ledger_ref else {
            return Ok(IntegrityReport::NotAnchored);
        };

        let record = tokio::time::timeout(self.ledger_timeout, self.ledger.verify(id))
            .await
            .map_err(|_| AuditError::LedgerUnavailable("timed out".into()))?
            .map_err(|e| AuditError::LedgerUnavailable(e.to_string()))?;

        let report = match record {
            None => IntegrityReport::LedgerMissing,
            Some(r) if r.hash != entry.local_hash || r.action != entry.action => {
                IntegrityReport::LedgerMismatch
            }
            Some(_) => IntegrityReport::Verified { ledger_ref },
        };
        if report.is_tampered() {
            error!(audit_id = %id, ?report, "audit entry disagrees with ledger");
        }
        Ok(report)
    }

    /// Entries matching `filter`, most recent first.
    pub async fn query(&self, filter: &AuditFilter, page: Page) -> Result<AuditPage, AuditError> {
        Ok(self.store.query_audit(filter, page).await?)
    }
}
