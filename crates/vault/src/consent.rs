//! Scope-limited, time-bound delegation grants.
//!
//! A grant is persisted first; the bearer token returned to the caller only
//! names the grant and its expiry. Authority lives in the stored record, so
//! verification always re-reads it: a revoke takes effect immediately, even
//! for tokens whose embedded expiry has not yet passed.
//!
//! Consent tokens are HS256 JWTs signed with a secret independent of the
//! session-token secrets and carried in
//! [`CONSENT_TOKEN_HEADER`](common::protocol::CONSENT_TOKEN_HEADER).

use std::{collections::BTreeSet, fmt, sync::Arc};

use chrono::{Duration, Utc};
use common::{
    model::{ConsentGrant, Scope},
    TrustError,
};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::store::{ConsentStore, StoreError};

const ISSUER: &str = "vault";
const AUDIENCE: &str = "vault-consent";

#[derive(Debug, Error)]
pub enum ConsentError {
    /// Empty scopes, out-of-range TTL, or blank ids.
    #[error("{0}")]
    Validation(String),

    /// The grant to revoke does not exist.
    #[error("consent grant {0} not found")]
    NotFound(Uuid),

    #[error("consent token signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ConsentError> for TrustError {
    fn from(e: ConsentError) -> Self {
        match e {
            ConsentError::Validation(msg) => TrustError::Validation(msg),
            ConsentError::NotFound(_) => TrustError::NotFound(e.to_string()),
            ConsentError::Signing(msg) => TrustError::Internal(msg),
            ConsentError::Store(s) => s.into(),
        }
    }
}

/// Why a consent check did not authorise the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// The token is unparseable, badly signed, or inconsistent with its grant.
    Malformed,
    /// No grant exists for the token or the subject/grantee pair.
    NotFound,
    Revoked,
    Expired,
    InsufficientScope { missing: BTreeSet<Scope> },
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::Malformed => "malformed",
            DenialReason::NotFound => "not-found",
            DenialReason::Revoked => "revoked",
            DenialReason::Expired => "expired",
            DenialReason::InsufficientScope { .. } => "insufficient-scope",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a consent check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentDecision {
    Granted(ConsentGrant),
    Denied(DenialReason),
}

impl ConsentDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, ConsentDecision::Granted(_))
    }

    /// Convert into the common error taxonomy for callers that only need
    /// allow/deny.
    pub fn into_result(self) -> Result<ConsentGrant, TrustError> {
        match self {
            ConsentDecision::Granted(grant) => Ok(grant),
            ConsentDecision::Denied(reason) => Err(match reason {
                DenialReason::Malformed => TrustError::SecurityViolation("consent token".into()),
                DenialReason::NotFound => TrustError::NotFound("consent grant".into()),
                DenialReason::Expired => TrustError::Expired("consent grant".into()),
                DenialReason::Revoked | DenialReason::InsufficientScope { .. } => {
                    TrustError::Forbidden(format!("consent {reason}"))
                }
            }),
        }
    }
}

/// A stored grant and the bearer token that references it.
#[derive(Debug, Clone)]
pub struct IssuedConsent {
    pub grant: ConsentGrant,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConsentClaims {
    /// Grant id.
    jti: String,
    sub: String,
    grantee: String,
    scopes: BTreeSet<Scope>,
    iat: i64,
    exp: i64,
    iss: String,
    aud: String,
}

/// Issues, verifies, and revokes consent grants.
#[derive(Clone)]
pub struct ConsentManager {
    store: Arc<dyn ConsentStore>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    max_ttl_minutes: u32,
}

impl fmt::Debug for ConsentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsentManager")
            .field("max_ttl_minutes", &self.max_ttl_minutes)
            .finish_non_exhaustive()
    }
}

impl ConsentManager {
    pub fn new(store: Arc<dyn ConsentStore>, secret: &[u8], max_ttl_minutes: u32) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = 0;
        Self {
            store,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            max_ttl_minutes,
        }
    }

    pub fn from_config(cfg: &Config, store: Arc<dyn ConsentStore>) -> Self {
        Self::new(
            store,
            cfg.consent_token_secret.expose().as_bytes(),
            cfg.consent_max_ttl_minutes,
        )
    }

    /// Persist a new grant and return it with its signed bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] if `scopes` is empty, `ttl_minutes`
    /// is outside `1..=max`, or either id is blank.
    pub async fn grant(
        &self,
        subject_id: &str,
        grantee_id: &str,
        scopes: BTreeSet<Scope>,
        ttl_minutes: u32,
    ) -> Result<IssuedConsent, ConsentError> {
        if subject_id.trim().is_empty() || grantee_id.trim().is_empty() {
            return Err(ConsentError::Validation(
                "subject and grantee ids are required".into(),
            ));
        }
        if scopes.is_empty() {
            return Err(ConsentError::Validation("at least one scope is required".into()));
        }
        if ttl_minutes == 0 || ttl_minutes > self.max_ttl_minutes {
            return Err(ConsentError::Validation(format!(
                "ttl must be within 1..={} minutes",
                self.max_ttl_minutes
            )));
        }

        let now = Utc::now();
        let grant = ConsentGrant {
            id: Uuid::new_v4(),
            subject_id: subject_id.to_owned(),
            grantee_id: grantee_id.to_owned(),
            scopes,
            created_at: now,
            expires_at: now + Duration::minutes(i64::from(ttl_minutes)),
            revoked: false,
        };
        let token = self.sign(&grant)?;
        self.store.insert_grant(grant.clone()).await?;

        info!(grant_id = %grant.id, scopes = grant.scopes.len(), ttl_minutes, "consent granted");
        Ok(IssuedConsent { grant, token })
    }

    /// Check a bearer token against the stored grant.
    ///
    /// Order: token signature and expiry, grant lookup, grant state as
    /// currently persisted, then `required ⊆ grant.scopes`. Store failures are
    /// errors; every other failure is a [`ConsentDecision::Denied`].
    pub async fn verify(
        &self,
        token: &str,
        required: &BTreeSet<Scope>,
    ) -> Result<ConsentDecision, ConsentError> {
        let claims = match decode::<ConsentClaims>(token, &self.decoding, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => DenialReason::Expired,
                    _ => DenialReason::Malformed,
                };
                return Ok(deny(None, reason));
            }
        };
        let Ok(grant_id) = Uuid::parse_str(&claims.jti) else {
            return Ok(deny(None, DenialReason::Malformed));
        };

        let Some(grant) = self.store.get_grant(grant_id).await? else {
            return Ok(deny(Some(grant_id), DenialReason::NotFound));
        };
        if grant.subject_id != claims.sub || grant.grantee_id != claims.grantee {
            return Ok(deny(Some(grant_id), DenialReason::Malformed));
        }
        if grant.revoked {
            return Ok(deny(Some(grant_id), DenialReason::Revoked));
        }
        if Utc::now() >= grant.expires_at {
            return Ok(deny(Some(grant_id), DenialReason::Expired));
        }

        let missing = grant.missing_scopes(required);
        if !missing.is_empty() {
            return Ok(deny(
                Some(grant_id),
                DenialReason::InsufficientScope { missing },
            ));
        }
        Ok(ConsentDecision::Granted(grant))
    }

    /// Mark a grant revoked. Idempotent; the record is retained.
    pub async fn revoke(&self, grant_id: Uuid) -> Result<ConsentGrant, ConsentError> {
        let grant = self
            .store
            .revoke_grant(grant_id)
            .await?
            .ok_or(ConsentError::NotFound(grant_id))?;
        info!(grant_id = %grant_id, "consent revoked");
        Ok(grant)
    }

    /// Token-free check for server-initiated flows: is there an active grant
    /// from `subject_id` to `grantee_id` covering `required`?
    pub async fn check_direct(
        &self,
        subject_id: &str,
        grantee_id: &str,
        required: &BTreeSet<Scope>,
    ) -> Result<ConsentDecision, ConsentError> {
        let grants = self.store.grants_between(subject_id, grantee_id).await?;
        if grants.is_empty() {
            return Ok(deny(None, DenialReason::NotFound));
        }

        let now = Utc::now();
        let active: Vec<&ConsentGrant> = grants.iter().filter(|g| g.is_active_at(now)).collect();
        if let Some(grant) = active
            .iter()
            .find(|g| g.missing_scopes(required).is_empty())
        {
            return Ok(ConsentDecision::Granted((*grant).clone()));
        }

        let reason = if !active.is_empty() {
            let covered: BTreeSet<Scope> = active
                .iter()
                .flat_map(|g| g.scopes.iter().copied())
                .collect();
            DenialReason::InsufficientScope {
                missing: required.difference(&covered).copied().collect(),
            }
        } else if grants.iter().any(|g| g.revoked && now < g.expires_at) {
            DenialReason::Revoked
        } else {
            DenialReason::Expired
        };
        Ok(deny(None, reason))
    }

    /// Every grant issued by `subject_id`, newest first, including revoked
    /// and expired ones.
    pub async fn list_for_subject(
        &self,
        subject_id: &str,
    ) -> Result<Vec<ConsentGrant>, ConsentError> {
        Ok(self.store.grants_for_subject(subject_id).await?)
    }

    fn sign(&self, grant: &ConsentGrant) -> Result<String, ConsentError> {
        let claims = ConsentClaims {
            jti: grant.id.to_string(),
            sub: grant.subject_id.clone(),
            grantee: grant.grantee_id.clone(),
            scopes: grant.scopes.clone(),
            iat: grant.created_at.timestamp(),
            exp: grant.expires_at.timestamp(),
            iss: ISSUER.to_owned(),
            aud: AUDIENCE.to_owned(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ConsentError::Signing(e.to_string()))
    }
}

fn deny(grant_id: Option<Uuid>, reason: DenialReason) -> ConsentDecision {
    match grant_id {
        Some(id) => warn!(grant_id = %id, reason = %reason, "consent denied"),
        None => warn!(reason = %reason, "consent denied"),
    }
    ConsentDecision::Denied(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const SECRET: &[u8] = b"consent-secret";

    fn scopes(items: &[Scope]) -> BTreeSet<Scope> {
        items.iter().copied().collect()
    }

    fn manager() -> (ConsentManager, MemoryStore) {
        let store = MemoryStore::new();
        (ConsentManager::new(Arc::new(store.clone()), SECRET, 1440), store)
    }

    #[tokio::test]
    async fn grant_then_verify() {
        let (consent, _) = manager();
        let issued = consent
            .grant("patient-1", "doctor-7", scopes(&[Scope::ViewIdentityNumber]), 60)
            .await
            .unwrap();
        assert!(!issued.grant.revoked);

        let decision = consent
            .verify(&issued.token, &scopes(&[Scope::ViewIdentityNumber]))
            .await
            .unwrap();
        assert_eq!(decision, ConsentDecision::Granted(issued.grant));
    }

    #[tokio::test]
    async fn revoke_takes_effect_before_token_expiry() {
        let (consent, store) = manager();
        let required = scopes(&[Scope::ViewIdentityNumber]);
        let issued = consent
            .grant("patient-1", "doctor-7", required.clone(), 60)
            .await
            .unwrap();
        assert!(consent.verify(&issued.token, &required).await.unwrap().is_granted());

        consent.revoke(issued.grant.id).await.unwrap();
        let decision = consent.verify(&issued.token, &required).await.unwrap();
        assert_eq!(decision, ConsentDecision::Denied(DenialReason::Revoked));

        // Retained, not deleted.
        assert!(store.get_grant(issued.grant.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let (consent, _) = manager();
        let issued = consent
            .grant("patient-1", "doctor-7", scopes(&[Scope::ViewPrescriptions]), 10)
            .await
            .unwrap();
        assert!(consent.revoke(issued.grant.id).await.unwrap().revoked);
        assert!(consent.revoke(issued.grant.id).await.unwrap().revoked);
    }

    #[tokio::test]
    async fn revoke_unknown_grant_is_not_found() {
        let (consent, _) = manager();
        assert!(matches!(
            consent.revoke(Uuid::new_v4()).await,
            Err(ConsentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn insufficient_scope_reports_missing() {
        let (consent, _) = manager();
        let issued = consent
            .grant("patient-1", "doctor-7", scopes(&[Scope::ViewPrescriptions]), 60)
            .await
            .unwrap();
        let decision = consent
            .verify(
                &issued.token,
                &scopes(&[Scope::ViewPrescriptions, Scope::ViewLabResults]),
            )
            .await
            .unwrap();
        assert_eq!(
            decision,
            ConsentDecision::Denied(DenialReason::InsufficientScope {
                missing: scopes(&[Scope::ViewLabResults])
            })
        );
    }

    #[tokio::test]
    async fn grant_validation() {
        let (consent, _) = manager();
        let s = scopes(&[Scope::ViewPrescriptions]);
        assert!(matches!(
            consent.grant("patient-1", "doctor-7", BTreeSet::new(), 60).await,
            Err(ConsentError::Validation(_))
        ));
        assert!(matches!(
            consent.grant("patient-1", "doctor-7", s.clone(), 0).await,
            Err(ConsentError::Validation(_))
        ));
        assert!(matches!(
            consent.grant("patient-1", "doctor-7", s.clone(), 1441).await,
            Err(ConsentError::Validation(_))
        ));
        assert!(matches!(
            consent.grant(" ", "doctor-7", s.clone(), 60).await,
            Err(ConsentError::Validation(_))
        ));
        assert!(consent.grant("patient-1", "doctor-7", s, 1440).await.is_ok());
    }

    #[tokio::test]
    async fn malformed_and_foreign_tokens_rejected() {
        let (consent, _) = manager();
        let required = scopes(&[Scope::ViewPrescriptions]);
        assert_eq!(
            consent.verify("not-a-token", &required).await.unwrap(),
            ConsentDecision::Denied(DenialReason::Malformed)
        );

        let (other, _) = {
            let store = MemoryStore::new();
            (ConsentManager::new(Arc::new(store.clone()), b"other-secret", 1440), store)
        };
        let foreign = other
            .grant("patient-1", "doctor-7", required.clone(), 60)
            .await
            .unwrap();
        assert_eq!(
            consent.verify(&foreign.token, &required).await.unwrap(),
            ConsentDecision::Denied(DenialReason::Malformed)
        );
    }

    #[tokio::test]
    async fn token_for_unknown_grant_is_not_found() {
        let (consent, _) = manager();
        let now = Utc::now();
        let phantom = ConsentGrant {
            id: Uuid::new_v4(),
            subject_id: "patient-1".into(),
            grantee_id: "doctor-7".into(),
            scopes: scopes(&[Scope::ViewPrescriptions]),
            created_at: now,
            expires_at: now + Duration::minutes(5),
            revoked: false,
        };
        let token = consent.sign(&phantom).unwrap();
        assert_eq!(
            consent.verify(&token, &phantom.scopes).await.unwrap(),
            ConsentDecision::Denied(DenialReason::NotFound)
        );
    }

    #[tokio::test]
    async fn persisted_expiry_is_enforced() {
        let (consent, store) = manager();
        let past = Utc::now() - Duration::minutes(10);
        let stale = ConsentGrant {
            id: Uuid::new_v4(),
            subject_id: "patient-1".into(),
            grantee_id: "doctor-7".into(),
            scopes: scopes(&[Scope::ViewPrescriptions]),
            created_at: past - Duration::minutes(5),
            expires_at: past,
            revoked: false,
        };
        store.insert_grant(stale.clone()).await.unwrap();
        let token = consent.sign(&stale).unwrap();
        assert_eq!(
            consent.verify(&token, &stale.scopes).await.unwrap(),
            ConsentDecision::Denied(DenialReason::Expired)
        );
        assert_eq!(
            consent
                .check_direct("patient-1", "doctor-7", &stale.scopes)
                .await
                .unwrap(),
            ConsentDecision::Denied(DenialReason::Expired)
        );
    }

    #[tokio::test]
    async fn check_direct_uses_store_only() {
        let (consent, _) = manager();
        let required = scopes(&[Scope::ViewMedicalRecords]);
        assert_eq!(
            consent.check_direct("patient-1", "doctor-7", &required).await.unwrap(),
            ConsentDecision::Denied(DenialReason::NotFound)
        );

        let issued = consent
            .grant("patient-1", "doctor-7", required.clone(), 30)
            .await
            .unwrap();
        assert!(consent
            .check_direct("patient-1", "doctor-7", &required)
            .await
            .unwrap()
            .is_granted());
        assert!(matches!(
            consent
                .check_direct("patient-1", "doctor-7", &scopes(&[Scope::ViewLabResults]))
                .await
                .unwrap(),
            ConsentDecision::Denied(DenialReason::InsufficientScope { .. })
        ));

        consent.revoke(issued.grant.id).await.unwrap();
        assert_eq!(
            consent.check_direct("patient-1", "doctor-7", &required).await.unwrap(),
            ConsentDecision::Denied(DenialReason::Revoked)
        );
    }

    #[tokio::test]
    async fn list_for_subject_includes_revoked() {
        let (consent, _) = manager();
        let s = scopes(&[Scope::ViewPrescriptions]);
        let first = consent.grant("patient-1", "doctor-7", s.clone(), 30).await.unwrap();
        consent.grant("patient-1", "doctor-8", s, 30).await.unwrap();
        consent.revoke(first.grant.id).await.unwrap();

        let grants = consent.list_for_subject("patient-1").await.unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().any(|g| g.revoked));
    }

    #[test]
    fn decision_maps_into_taxonomy() {
        assert!(matches!(
            ConsentDecision::Denied(DenialReason::Revoked).into_result(),
            Err(TrustError::Forbidden(_))
        ));
        assert!(matches!(
            ConsentDecision::Denied(DenialReason::Expired).into_result(),
            Err(TrustError::Expired(_))
        ));
        assert!(matches!(
            ConsentDecision::Denied(DenialReason::Malformed).into_result(),
            Err(TrustError::SecurityViolation(_))
        ));
    }
}
