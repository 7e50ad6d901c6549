//! Password hashing and session-token handling.
//!
//! [`CredentialManager`] owns its secrets: the PBKDF2 iteration count and two
//! independent HMAC secrets for access and refresh tokens. It has no
//! dependency on the [`KeyManager`](crate::keys::KeyManager).
//!
//! Callers should force re-authentication on [`CredentialError::Expired`] and
//! reject outright on [`CredentialError::Invalid`].

pub mod password;
pub mod session;

pub use session::{IssuedToken, SessionClaims, TokenKind};

use std::fmt;

use common::TrustError;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use session::TokenSigner;

#[derive(Debug, Error)]
pub enum CredentialError {
    /// The token verified structurally but is past its `exp`.
    #[error("token expired")]
    Expired,

    /// Bad signature, issuer, audience, algorithm, type, or structure.
    #[error("token invalid")]
    Invalid,

    /// Caller-correctable input problem.
    #[error("{0}")]
    Validation(String),

    /// The JWT library failed to sign.
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl From<CredentialError> for TrustError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Expired => TrustError::Expired(e.to_string()),
            CredentialError::Invalid => TrustError::SecurityViolation(e.to_string()),
            CredentialError::Validation(msg) => TrustError::Validation(msg),
            CredentialError::Signing(msg) => TrustError::Internal(msg),
        }
    }
}

/// Password and session credential handling.
#[derive(Clone)]
pub struct CredentialManager {
    iterations: u32,
    access: TokenSigner,
    refresh: TokenSigner,
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    pub fn new(
        iterations: u32,
        access_secret: &[u8],
        refresh_secret: &[u8],
        access_ttl_secs: u64,
        refresh_ttl_secs: u64,
    ) -> Self {
        Self {
            iterations,
            access: TokenSigner::new(TokenKind::Access, access_secret, access_ttl_secs),
            refresh: TokenSigner::new(TokenKind::Refresh, refresh_secret, refresh_ttl_secs),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.pbkdf2_iterations,
            cfg.access_token_secret.expose().as_bytes(),
            cfg.refresh_token_secret.expose().as_bytes(),
            cfg.access_token_ttl_secs,
            cfg.refresh_token_ttl_secs,
        )
    }

    /// Hash a password for storage.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Validation`] for an empty password.
    pub fn hash_password(&self, password: &str) -> Result<String, CredentialError> {
        if password.is_empty() {
            return Err(CredentialError::Validation("password must not be empty".into()));
        }
        Ok(password::hash_password(password, self.iterations))
    }

    /// Verify `password` against a stored hash. Malformed values are `false`.
    pub fn verify_password(&self, password: &str, stored: &str) -> bool {
        password::verify_password(password, stored, self.iterations)
    }

    /// Whether `stored` was produced with different parameters than the
    /// current configuration and should be replaced after a successful login.
    pub fn needs_rehash(&self, stored: &str) -> bool {
        password::needs_rehash(stored, self.iterations)
    }

    pub fn issue_access_token(
        &self,
        subject: &str,
        role: &str,
    ) -> Result<IssuedToken, CredentialError> {
        self.access.issue(subject, role)
    }

    pub fn issue_refresh_token(
        &self,
        subject: &str,
        role: &str,
    ) -> Result<IssuedToken, CredentialError> {
        self.refresh.issue(subject, role)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<SessionClaims, CredentialError> {
        self.access.verify(token)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<SessionClaims, CredentialError> {
        self.refresh.verify(token)
    }

    /// Exchange a valid refresh token for a new access token.
    pub fn refresh_session(&self, refresh_token: &str) -> Result<IssuedToken, CredentialError> {
        let claims = self.verify_refresh_token(refresh_token)?;
        debug!(jti = %claims.jti, "refresh token exchanged");
        self.issue_access_token(&claims.sub, &claims.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    fn manager() -> CredentialManager {
        let mut cfg = test_config();
        cfg.pbkdf2_iterations = 1_000;
        CredentialManager::from_config(&cfg)
    }

    #[test]
    fn password_round_trip_with_default_iterations() {
        let creds = CredentialManager::from_config(&test_config());
        let stored = creds.hash_password("s3cret!").unwrap();
        assert!(stored.starts_with("10000:"));
        assert!(creds.verify_password("s3cret!", &stored));
        assert!(!creds.verify_password("s3cret?", &stored));
        assert!(!creds.needs_rehash(&stored));
    }

    #[test]
    fn empty_password_rejected() {
        assert!(matches!(
            manager().hash_password(""),
            Err(CredentialError::Validation(_))
        ));
    }

    #[test]
    fn malformed_stored_hash_is_false_not_error() {
        assert!(!manager().verify_password("pw", "garbage"));
    }

    #[test]
    fn access_and_refresh_are_not_interchangeable() {
        let creds = manager();
        let access = creds.issue_access_token("user-1", "doctor").unwrap();
        let refresh = creds.issue_refresh_token("user-1", "doctor").unwrap();

        assert!(creds.verify_access_token(&access.token).is_ok());
        assert!(creds.verify_refresh_token(&refresh.token).is_ok());
        assert!(matches!(
            creds.verify_access_token(&refresh.token),
            Err(CredentialError::Invalid)
        ));
        assert!(matches!(
            creds.verify_refresh_token(&access.token),
            Err(CredentialError::Invalid)
        ));
    }

    #[test]
    fn default_ttls_are_fifteen_minutes_and_seven_days() {
        let creds = manager();
        let access = creds.issue_access_token("user-1", "doctor").unwrap();
        let refresh = creds.issue_refresh_token("user-1", "doctor").unwrap();
        let a = creds.verify_access_token(&access.token).unwrap();
        let r = creds.verify_refresh_token(&refresh.token).unwrap();
        assert_eq!(a.exp - a.iat, 15 * 60);
        assert_eq!(r.exp - r.iat, 7 * 24 * 60 * 60);
    }

    #[test]
    fn refresh_session_issues_access_token() {
        let creds = manager();
        let refresh = creds.issue_refresh_token("user-1", "pharmacist").unwrap();
        let access = creds.refresh_session(&refresh.token).unwrap();
        let claims = creds.verify_access_token(&access.token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role, "pharmacist");
        assert!(creds.refresh_session(&access.token).is_err());
    }

    #[test]
    fn error_taxonomy_mapping() {
        assert!(matches!(
            TrustError::from(CredentialError::Expired),
            TrustError::Expired(_)
        ));
        assert!(matches!(
            TrustError::from(CredentialError::Invalid),
            TrustError::SecurityViolation(_)
        ));
    }
}
