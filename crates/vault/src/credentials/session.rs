//! Access and refresh session tokens.
//!
//! Both token types are HS256 JWTs with a pinned issuer, a per-type audience
//! and a per-type secret, so a leaked refresh secret cannot mint access
//! tokens and vice versa. Verification accepts only HS256; any other `alg`
//! header is rejected.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

use super::CredentialError;
use crate::crypto::random_token;

/// `iss` claim on every session token.
pub const ISSUER: &str = "vault";

/// Bytes of randomness in each token id.
const JTI_LEN: usize = 16;

/// Which of the two session token types a token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn audience(&self) -> &'static str {
        match self {
            TokenKind::Access => "vault-api",
            TokenKind::Refresh => "vault-refresh",
        }
    }
}

/// Claims carried by access and refresh tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub role: String,
    pub typ: TokenKind,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// A freshly signed token and its expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies one token type with its own secret.
#[derive(Clone)]
pub(crate) struct TokenSigner {
    kind: TokenKind,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl TokenSigner {
    pub(crate) fn new(kind: TokenKind, secret: &[u8], ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[kind.audience()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = 0;

        Self {
            kind,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    pub(crate) fn issue(&self, subject: &str, role: &str) -> Result<IssuedToken, CredentialError> {
        self.issue_at(subject, role, Utc::now())
    }

    pub(crate) fn issue_at(
        &self,
        subject: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, CredentialError> {
        if subject.is_empty() {
            return Err(CredentialError::Validation("subject must not be empty".into()));
        }
        let expires_at = Duration::try_seconds(self.ttl_secs)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| CredentialError::Validation("token lifetime out of range".into()))?;
        let claims = SessionClaims {
            sub: subject.to_owned(),
            role: role.to_owned(),
            typ: self.kind,
            jti: random_token(JTI_LEN),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: ISSUER.to_owned(),
            aud: self.kind.audience().to_owned(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        Ok(IssuedToken {
            token,
            jti: claims.jti,
            expires_at,
        })
    }

    pub(crate) fn verify(&self, token: &str) -> Result<SessionClaims, CredentialError> {
        let data = decode::<SessionClaims>(token, &self.decoding, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::Invalid,
            },
        )?;
        if data.claims.typ != self.kind {
            return Err(CredentialError::Invalid);
        }
        Ok(data.claims)
    }
}
