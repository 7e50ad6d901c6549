//! Offline-verifiable QR tokens.
//!
//! A QR token is the URL-safe base64 of a JSON [`SecureQrPackage`]:
//!
//! ```text
//! base64url({ "iv": hex, "authTag": hex, "ciphertext": hex, "signature": hex })
//! ```
//!
//! The payload is encrypted with AES-256-GCM-SIV under a per-resource-type
//! confidentiality subkey, then signed with HMAC-SHA256 under a second,
//! independent subkey. Verification checks the signature before any
//! decryption is attempted.
//!
//! The codec is stateless. Expiry windows and replay/consumption checks are
//! the caller's concern; [`VerifiedQr`] exposes the embedded timestamp and
//! nonce for that purpose.
//!
//! [`SecureQrPackage`]: common::protocol::SecureQrPackage

pub mod codec;

pub use codec::SecureTokenCodec;

use chrono::{DateTime, Duration, Utc};
use common::TrustError;
use thiserror::Error;

use crate::keys::KeyError;

/// Errors produced by the QR codec.
#[derive(Debug, Error)]
pub enum QrError {
    /// The token does not parse into the expected package structure.
    #[error("invalid QR token: {0}")]
    InvalidToken(&'static str),

    /// The HMAC over `iv ‖ authTag ‖ ciphertext` did not verify.
    #[error("QR signature mismatch")]
    SignatureMismatch,

    /// The signature verified but the AEAD tag did not.
    #[error("QR authentication tag mismatch")]
    TagMismatch,

    /// Empty resource type or identifier.
    #[error("{0}")]
    Validation(&'static str),

    /// The payload could not be serialised for sealing.
    #[error("QR payload serialisation failed: {0}")]
    Serialization(String),

    #[error("QR encryption failed")]
    EncryptionFailure,

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl QrError {
    /// Whether this failure indicates tampering rather than a malformed input.
    pub fn is_tamper_signal(&self) -> bool {
        matches!(self, QrError::SignatureMismatch | QrError::TagMismatch)
    }
}

impl From<QrError> for TrustError {
    fn from(e: QrError) -> Self {
        match e {
            QrError::InvalidToken(_) | QrError::Validation(_) => {
                TrustError::Validation(e.to_string())
            }
            QrError::SignatureMismatch | QrError::TagMismatch => {
                TrustError::SecurityViolation(e.to_string())
            }
            QrError::Serialization(_) | QrError::EncryptionFailure => {
                TrustError::Internal(e.to_string())
            }
            QrError::Key(k) => k.into(),
        }
    }
}

/// A decoded, authenticated QR payload.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedQr<T> {
    pub payload: T,
    /// Hex random nonce mixed into every token.
    pub nonce: String,
    /// When the token was created.
    pub issued_at: DateTime<Utc>,
}

impl<T> VerifiedQr<T> {
    /// `true` if the token was created more than `max_age` ago.
    pub fn is_older_than(&self, max_age: Duration) -> bool {
        Utc::now() - self.issued_at > max_age
    }
}
