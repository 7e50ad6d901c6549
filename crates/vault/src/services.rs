//! Composition root.
//!
//! [`Vault`] owns one instance of every component, built once from a
//! validated [`Config`]. Components share a single [`KeyManager`]; nothing in
//! the crate reaches for global state.
//!
//! The audited helpers at the bottom compose components the way a transport
//! layer would, recording every outcome through the [`AuditTrail`]. A failure
//! to write the audit entry is logged and never changes the caller's result.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use common::{
    model::{AuditAction, ConsentGrant, IdentityRecord, Scope},
    TrustError,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditTrail, InMemoryLedger, Ledger};
use crate::config::{Config, ConfigError};
use crate::consent::{ConsentDecision, ConsentManager, IssuedConsent};
use crate::credentials::{CredentialError, CredentialManager, IssuedToken};
use crate::crypto::FieldCipher;
use crate::identity::{IdentityTokenizer, Pseudonym};
use crate::keys::KeyManager;
use crate::qr::{SecureTokenCodec, VerifiedQr};
use crate::store::{AuditStore, ConsentStore, IdentityStore, MemoryStore};

/// Actor recorded when a request carries no verifiable identity.
const UNKNOWN_ACTOR: &str = "anonymous";

/// External collaborators the core depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub consent_store: Arc<dyn ConsentStore>,
    pub audit_store: Arc<dyn AuditStore>,
    pub identity_store: Arc<dyn IdentityStore>,
    pub ledger: Arc<dyn Ledger>,
}

impl Collaborators {
    /// In-process store and ledger, for standalone runs and tests.
    pub fn in_memory() -> Self {
        let store = MemoryStore::new();
        Self {
            consent_store: Arc::new(store.clone()),
            audit_store: Arc::new(store.clone()),
            identity_store: Arc::new(store),
            ledger: Arc::new(InMemoryLedger::default()),
        }
    }
}

/// Every trust-core component, built once per process.
#[derive(Clone)]
pub struct Vault {
    pub keys: Arc<KeyManager>,
    pub cipher: FieldCipher,
    pub identity: IdentityTokenizer,
    pub credentials: CredentialManager,
    pub consent: ConsentManager,
    pub qr: SecureTokenCodec,
    pub audit: Arc<AuditTrail>,
    identity_store: Arc<dyn IdentityStore>,
}

impl Vault {
    /// Build all components from `cfg`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the master key cannot be installed or any
    /// setting fails validation. No component is usable in that case.
    pub fn from_config(cfg: &Config, collaborators: Collaborators) -> Result<Self, ConfigError> {
        let keys = KeyManager::from_hex(cfg.master_encryption_key.expose()).map_err(|e| {
            ConfigError::Invalid {
                name: "MASTER_ENCRYPTION_KEY",
                reason: e.to_string(),
            }
        })?;
        keys.validate_config(cfg)?;
        let keys = Arc::new(keys);

        let vault = Self {
            cipher: FieldCipher::new(Arc::clone(&keys)),
            identity: IdentityTokenizer::new(Arc::clone(&keys)),
            credentials: CredentialManager::from_config(cfg),
            consent: ConsentManager::from_config(cfg, collaborators.consent_store),
            qr: SecureTokenCodec::new(Arc::clone(&keys)),
            audit: Arc::new(AuditTrail::new(
                collaborators.audit_store,
                collaborators.ledger,
                Duration::from_millis(cfg.ledger_timeout_ms),
            )),
            identity_store: collaborators.identity_store,
            keys,
        };
        info!(
            pbkdf2_iterations = cfg.pbkdf2_iterations,
            ledger_timeout_ms = cfg.ledger_timeout_ms,
            "trust core initialised"
        );
        Ok(vault)
    }

    /// Protect and persist an identity number on behalf of `actor`.
    pub async fn register_identity(
        &self,
        actor: &str,
        raw: &str,
    ) -> Result<IdentityRecord, TrustError> {
        let record = self
            .identity
            .register(self.identity_store.as_ref(), raw)
            .await?;
        self.record(actor, AuditAction::IdentityRegistered, "identity", &record.lookup_hash)
            .await;
        Ok(record)
    }

    /// Check a password and, on success, issue an access/refresh pair.
    ///
    /// Success and failure are both audited. Failure is reported as a generic
    /// invalid-credential error.
    pub async fn login(
        &self,
        subject: &str,
        role: &str,
        password: &str,
        stored_hash: &str,
    ) -> Result<(IssuedToken, IssuedToken), TrustError> {
        if !self.credentials.verify_password(password, stored_hash) {
            self.record(subject, AuditAction::LoginFailed, "session", subject)
                .await;
            return Err(CredentialError::Invalid.into());
        }
        let access = self.credentials.issue_access_token(subject, role)?;
        let refresh = self.credentials.issue_refresh_token(subject, role)?;
        self.record(subject, AuditAction::LoginSucceeded, "session", subject)
            .await;
        Ok((access, refresh))
    }

    /// Decrypt a stored identity record for `actor`. Every successful view is
    /// audited and anchored.
    pub async fn view_identity(
        &self,
        actor: &str,
        record: &IdentityRecord,
    ) -> Result<Pseudonym, TrustError> {
        let pseudonym = self.identity.decrypt_stored(&record.encrypted_token)?;
        self.record(actor, AuditAction::IdentityViewed, "identity", &record.lookup_hash)
            .await;
        Ok(pseudonym)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// A rejected refresh token is audited as a failed login.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<IssuedToken, TrustError> {
        let claims = match self.credentials.verify_refresh_token(refresh_token) {
            Ok(claims) => claims,
            Err(e) => {
                self.record(UNKNOWN_ACTOR, AuditAction::LoginFailed, "session", "")
                    .await;
                return Err(e.into());
            }
        };
        let access = self.credentials.issue_access_token(&claims.sub, &claims.role)?;
        self.record(&claims.sub, AuditAction::SessionRefreshed, "session", &claims.jti)
            .await;
        Ok(access)
    }

    /// Grant `grantee` delegated access to `subject`'s data.
    pub async fn grant_consent(
        &self,
        subject: &str,
        grantee: &str,
        scopes: BTreeSet<Scope>,
        ttl_minutes: u32,
    ) -> Result<IssuedConsent, TrustError> {
        let issued = self
            .consent
            .grant(subject, grantee, scopes, ttl_minutes)
            .await?;
        let grant_id = issued.grant.id.to_string();
        self.record(subject, AuditAction::ConsentGranted, "consent", &grant_id)
            .await;
        Ok(issued)
    }

    /// Revoke a grant on behalf of `actor`.
    pub async fn revoke_consent(
        &self,
        actor: &str,
        grant_id: Uuid,
    ) -> Result<ConsentGrant, TrustError> {
        let grant = self.consent.revoke(grant_id).await?;
        self.record(actor, AuditAction::ConsentRevoked, "consent", &grant_id.to_string())
            .await;
        Ok(grant)
    }

    /// Verify a consent bearer token presented by `grantee`.
    ///
    /// Both outcomes are audited: [`AuditAction::ConsentVerified`] against the
    /// grant id, [`AuditAction::ConsentDenied`] against the denial reason.
    pub async fn authorize(
        &self,
        grantee: &str,
        consent_token: &str,
        required: &BTreeSet<Scope>,
    ) -> Result<ConsentGrant, TrustError> {
        let decision = self.consent.verify(consent_token, required).await?;
        match &decision {
            ConsentDecision::Granted(grant) => {
                let grant_id = grant.id.to_string();
                self.record(grantee, AuditAction::ConsentVerified, "consent", &grant_id)
                    .await;
            }
            ConsentDecision::Denied(reason) => {
                self.record(grantee, AuditAction::ConsentDenied, "consent", reason.as_str())
                    .await;
            }
        }
        decision.into_result()
    }

    /// Seal `payload` into a QR token for the resource `resource_id`.
    ///
    /// Issuance is recorded as [`AuditAction::PrescriptionCreated`] against
    /// the blind lookup hash of `resource_id`, never the id itself.
    pub async fn issue_qr<T: Serialize>(
        &self,
        actor: &str,
        resource_type: &str,
        resource_id: &str,
        payload: &T,
    ) -> Result<String, TrustError> {
        let blind_id = self.qr.lookup_hash(resource_id)?;
        let token = self.qr.create(payload, resource_type)?;
        self.record(actor, AuditAction::PrescriptionCreated, resource_type, &blind_id)
            .await;
        Ok(token)
    }

    /// Open a QR token scanned by `actor`.
    ///
    /// Every scan is audited. Malformed tokens are recorded the same way as
    /// tamper signals; only the error mapping differs.
    pub async fn scan_qr<T: DeserializeOwned>(
        &self,
        actor: &str,
        token: &str,
        resource_type: &str,
    ) -> Result<VerifiedQr<T>, TrustError> {
        match self.qr.verify(token, resource_type) {
            Ok(verified) => {
                let action = AuditAction::PrescriptionVerified;
                self.record(actor, action, resource_type, &verified.nonce)
                    .await;
                Ok(verified)
            }
            Err(e) => {
                self.record(actor, AuditAction::QrVerificationFailed, resource_type, "")
                    .await;
                Err(e.into())
            }
        }
    }

    /// Wait for pending audit anchoring before shutdown.
    pub async fn shutdown(&self) {
        self.audit.flush().await;
        info!(
            anchoring_failures = self.audit.anchoring_failures(),
            "audit trail flushed"
        );
    }

    async fn record(
        &self,
        actor: &str,
        action: AuditAction,
        resource_type: &str,
        resource_id: &str,
    ) {
        let event = AuditEvent::new(actor, action, resource_type, resource_id);
        if let Err(e) = self.audit.log(event).await {
            warn!(%action, error = %e, "audit entry could not be written");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::audit::IntegrityReport;
    use crate::store::{AuditFilter, Page};

    fn vault() -> Vault {
        let mut cfg = test_config();
        cfg.pbkdf2_iterations = 1_000;
        Vault::from_config(&cfg, Collaborators::in_memory()).unwrap()
    }

    async fn actions(vault: &Vault) -> Vec<AuditAction> {
        vault
            .audit
            .query(&AuditFilter::default(), Page::default())
            .await
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    #[test]
    fn bad_master_key_is_fatal() {
        let mut cfg = test_config();
        cfg.master_encryption_key = crate::config::Secret::new("zz".repeat(32));
        assert!(matches!(
            Vault::from_config(&cfg, Collaborators::in_memory()),
            Err(ConfigError::Invalid { name: "MASTER_ENCRYPTION_KEY", .. })
        ));
    }

    #[tokio::test]
    async fn components_share_one_key_manager() {
        let vault = vault();
        assert!(vault.keys.is_ready());
        assert!(Arc::strong_count(&vault.keys) >= 4);
    }

    #[tokio::test]
    async fn register_identity_is_audited_and_unique() {
        let vault = vault();
        vault.register_identity("clerk-1", "4901 5420 3517").await.unwrap();
        assert!(matches!(
            vault.register_identity("clerk-1", "490154203517").await,
            Err(TrustError::Validation(_))
        ));
        assert_eq!(actions(&vault).await, [AuditAction::IdentityRegistered]);
    }

    #[tokio::test]
    async fn login_records_success_and_failure() {
        let vault = vault();
        let stored = vault.credentials.hash_password("s3cret!").unwrap();

        assert!(matches!(
            vault.login("user-1", "doctor", "wrong", &stored).await,
            Err(TrustError::SecurityViolation(_))
        ));
        let (access, _) = vault.login("user-1", "doctor", "s3cret!", &stored).await.unwrap();
        assert_eq!(
            vault.credentials.verify_access_token(&access.token).unwrap().sub,
            "user-1"
        );
        assert_eq!(
            actions(&vault).await,
            [AuditAction::LoginSucceeded, AuditAction::LoginFailed]
        );
    }

    async fn count(vault: &Vault, action: AuditAction) -> usize {
        let filter = AuditFilter {
            action: Some(action),
            ..AuditFilter::default()
        };
        vault
            .audit
            .query(&filter, Page::new(0, Page::MAX_LIMIT))
            .await
            .unwrap()
            .entries
            .len()
    }

    /// After shutdown every critical entry carries a ledger reference that
    /// the ledger confirms.
    async fn assert_critical_anchored(vault: &Vault) {
        let page = vault
            .audit
            .query(&AuditFilter::default(), Page::default())
            .await
            .unwrap();
        let critical: Vec<_> = page.entries.iter().filter(|e| e.action.is_critical()).collect();
        assert!(!critical.is_empty());
        for entry in critical {
            assert!(entry.ledger_ref.is_some(), "{} was not anchored", entry.action);
            assert!(matches!(
                vault.audit.verify_integrity(entry.id).await.unwrap(),
                IntegrityReport::Verified { .. }
            ));
        }
    }

    #[tokio::test]
    async fn consent_lifecycle_is_audited_and_anchored() {
        let vault = vault();
        let required: BTreeSet<Scope> = [Scope::ViewIdentityNumber].into_iter().collect();
        let issued = vault
            .grant_consent("patient-1", "doctor-7", required.clone(), 30)
            .await
            .unwrap();
        assert!(vault.authorize("doctor-7", &issued.token, &required).await.is_ok());

        vault.revoke_consent("patient-1", issued.grant.id).await.unwrap();
        assert!(matches!(
            vault.authorize("doctor-7", &issued.token, &required).await,
            Err(TrustError::Forbidden(_))
        ));
        assert_eq!(
            actions(&vault).await,
            [
                AuditAction::ConsentDenied,
                AuditAction::ConsentRevoked,
                AuditAction::ConsentVerified,
                AuditAction::ConsentGranted,
            ]
        );

        vault.shutdown().await;
        assert_critical_anchored(&vault).await;
    }

    #[tokio::test]
    async fn rejected_grant_is_not_audited() {
        let vault = vault();
        assert!(matches!(
            vault.grant_consent("patient-1", "doctor-7", BTreeSet::new(), 30).await,
            Err(TrustError::Validation(_))
        ));
        assert!(matches!(
            vault.revoke_consent("patient-1", Uuid::new_v4()).await,
            Err(TrustError::NotFound(_))
        ));
        assert!(actions(&vault).await.is_empty());
    }

    #[tokio::test]
    async fn identity_view_is_audited_and_anchored() {
        let vault = vault();
        let record = vault.register_identity("clerk-1", "490154203517").await.unwrap();
        let pseudonym = vault.view_identity("doctor-7", &record).await.unwrap();
        assert!(pseudonym == vault.identity.tokenize("490154203517").unwrap());

        let entries = vault
            .audit
            .query(&AuditFilter::default(), Page::default())
            .await
            .unwrap()
            .entries;
        assert_eq!(entries[0].action, AuditAction::IdentityViewed);
        assert_eq!(entries[0].actor, "doctor-7");
        assert_eq!(entries[0].resource_id, record.lookup_hash);

        vault.shutdown().await;
        assert_critical_anchored(&vault).await;
    }

    #[tokio::test]
    async fn refresh_records_success_and_failure() {
        let vault = vault();
        let stored = vault.credentials.hash_password("s3cret!").unwrap();
        let (_, refresh) = vault.login("user-1", "doctor", "s3cret!", &stored).await.unwrap();

        let access = vault.refresh_session(&refresh.token).await.unwrap();
        assert_eq!(
            vault.credentials.verify_access_token(&access.token).unwrap().role,
            "doctor"
        );
        assert!(matches!(
            vault.refresh_session(&access.token).await,
            Err(TrustError::SecurityViolation(_))
        ));
        assert_eq!(
            actions(&vault).await,
            [
                AuditAction::LoginFailed,
                AuditAction::SessionRefreshed,
                AuditAction::LoginSucceeded,
            ]
        );
    }

    #[tokio::test]
    async fn qr_issue_and_scan_are_audited() {
        let vault = vault();
        let token = vault
            .issue_qr("doctor-7", "prescription", "rx-1", &"rx-1")
            .await
            .unwrap();
        let opened: VerifiedQr<String> =
            vault.scan_qr("pharmacist-3", &token, "prescription").await.unwrap();
        assert_eq!(opened.payload, "rx-1");

        assert!(matches!(
            vault.scan_qr::<String>("pharmacist-3", &token, "medicine").await,
            Err(TrustError::SecurityViolation(_))
        ));
        assert!(matches!(
            vault.scan_qr::<String>("pharmacist-3", "garbage", "prescription").await,
            Err(TrustError::Validation(_))
        ));
        assert_eq!(
            actions(&vault).await,
            [
                AuditAction::QrVerificationFailed,
                AuditAction::QrVerificationFailed,
                AuditAction::PrescriptionVerified,
                AuditAction::PrescriptionCreated,
            ]
        );

        let created = vault
            .audit
            .query(
                &AuditFilter {
                    action: Some(AuditAction::PrescriptionCreated),
                    ..AuditFilter::default()
                },
                Page::default(),
            )
            .await
            .unwrap()
            .entries;
        assert_eq!(created[0].resource_id, vault.qr.lookup_hash("rx-1").unwrap());
        assert_ne!(created[0].resource_id, "rx-1");

        vault.shutdown().await;
        assert_critical_anchored(&vault).await;
    }

    #[tokio::test]
    async fn every_rejected_scan_leaves_an_entry() {
        let vault = vault();
        let token = vault.qr.create(&"rx-1", "prescription").unwrap();
        let mut rejected = 0;
        for (i, original) in token.char_indices().step_by(7) {
            let replacement = if original == 'A' { 'B' } else { 'A' };
            let mut mutated = token.clone();
            mutated.replace_range(i..i + 1, &replacement.to_string());
            let scanned = vault
                .scan_qr::<String>("pharmacist-3", &mutated, "prescription")
                .await;
            assert!(scanned.is_err(), "mutation at {i} was accepted");
            rejected += 1;
        }
        assert_eq!(count(&vault, AuditAction::QrVerificationFailed).await, rejected);
    }

    #[tokio::test]
    async fn shutdown_flushes_anchoring() {
        let vault = vault();
        let event = AuditEvent::new(
            "pharmacist-3",
            AuditAction::MedicineDispensed,
            "prescription",
            "rx-1",
        );
        let entry = vault.audit.log(event).await.unwrap();
        vault.shutdown().await;
        assert!(vault.audit.get(entry.id).await.unwrap().ledger_ref.is_some());
    }
}
