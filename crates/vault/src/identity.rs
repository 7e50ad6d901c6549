//! Three-layer protection for 12-digit national identity numbers.
//!
//! 1. **Tokenize**: keyed HMAC of the raw number, truncated to 16 bytes. The
//!    result is a deterministic, non-invertible pseudonym.
//! 2. **Encrypt**: the pseudonym (never the raw number) is field-encrypted
//!    with a fresh IV. Decrypting the stored buffer yields only the pseudonym;
//!    the raw number cannot be recovered, not even with the master key.
//! 3. **Hash**: SHA-256 of the pseudonym is the lookup/uniqueness index, so
//!    existence checks never decrypt anything.
//!
//! [`IdentityTokenizer::encrypt_for_storage`] is the only entry point that
//! touches the raw value. Nothing in this module logs or returns it.

use std::{fmt, sync::Arc};

use common::{model::IdentityRecord, TrustError};
use thiserror::Error;
use tracing::debug;

use crate::crypto::{self, CipherError};
use crate::keys::{KeyError, KeyManager};
use crate::store::{IdentityStore, StoreError};

/// Number of digits in a valid identity number.
pub const IDENTITY_NUMBER_DIGITS: usize = 12;

/// Byte length of a pseudonym before hex encoding.
pub const PSEUDONYM_LEN: usize = 16;

const KEY_SUBJECT: &str = "identity-number";
const TOKENIZE_CONTEXT: &str = "tokenize";
const STORAGE_CONTEXT: &str = "storage";

#[derive(Debug, Error)]
pub enum IdentityError {
    /// Input is not exactly [`IDENTITY_NUMBER_DIGITS`] ASCII digits.
    #[error("identity number must be exactly {IDENTITY_NUMBER_DIGITS} digits")]
    InvalidFormat,

    /// A record with the same lookup hash already exists.
    #[error("identity number is already registered")]
    AlreadyRegistered,

    /// A stored buffer decrypted to something that is not a pseudonym.
    #[error("stored identity token is malformed")]
    MalformedStoredToken,

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<IdentityError> for TrustError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::InvalidFormat | IdentityError::AlreadyRegistered => {
                TrustError::Validation(e.to_string())
            }
            IdentityError::MalformedStoredToken => TrustError::Integrity(e.to_string()),
            IdentityError::Cipher(c) => c.into(),
            IdentityError::Key(k) => k.into(),
            IdentityError::Store(s) => s.into(),
        }
    }
}

/// Opaque, non-reversible stand-in for an identity number.
///
/// Hex-encoded, [`PSEUDONYM_LEN`] × 2 characters. Callers must never present
/// it as the real identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Pseudonym(String);

impl Pseudonym {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pseudonym({})", self.0)
    }
}

/// Side-effect-free identity number protection pipeline.
#[derive(Clone, Debug)]
pub struct IdentityTokenizer {
    keys: Arc<KeyManager>,
}

impl IdentityTokenizer {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// Stage 1: validate and compute the pseudonym.
    ///
    /// ASCII whitespace (as in the printed `4901 5420 3517` grouping) is
    /// stripped before the digit check.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidFormat`] unless the remaining input is
    /// exactly [`IDENTITY_NUMBER_DIGITS`] ASCII digits.
    pub fn tokenize(&self, raw: &str) -> Result<Pseudonym, IdentityError> {
        let digits = normalize(raw)?;
        let key = self.keys.derive_key(KEY_SUBJECT, TOKENIZE_CONTEXT)?;
        let mac = crypto::hmac_sha256(key.as_bytes(), digits.as_bytes());
        Ok(Pseudonym(hex::encode(&mac[..PSEUDONYM_LEN])))
    }

    /// Run all three stages and return the record to persist.
    pub fn encrypt_for_storage(&self, raw: &str) -> Result<IdentityRecord, IdentityError> {
        let pseudonym = self.tokenize(raw)?;
        let key = self.keys.derive_key(KEY_SUBJECT, STORAGE_CONTEXT)?;
        let encrypted = crypto::encrypt_field(pseudonym.as_str().as_bytes(), key.as_bytes())?;
        Ok(IdentityRecord {
            encrypted_token: encrypted.to_bytes(),
            lookup_hash: lookup_hash(&pseudonym),
        })
    }

    /// Recompute the lookup hash for `raw` and compare it with `stored_hash`
    /// in constant time. Nothing is decrypted.
    pub fn verify_against_hash(&self, raw: &str, stored_hash: &str) -> Result<bool, IdentityError> {
        let candidate = lookup_hash(&self.tokenize(raw)?);
        Ok(crypto::constant_time_eq(
            candidate.as_bytes(),
            stored_hash.as_bytes(),
        ))
    }

    /// Decrypt a stored buffer. The result is the pseudonym, never the raw
    /// identity number.
    pub fn decrypt_stored(&self, buffer: &[u8]) -> Result<Pseudonym, IdentityError> {
        let key = self.keys.derive_key(KEY_SUBJECT, STORAGE_CONTEXT)?;
        let plaintext = crypto::decrypt_field(buffer, key.as_bytes())?;
        let text = String::from_utf8(plaintext).map_err(|_| IdentityError::MalformedStoredToken)?;
        if text.len() != PSEUDONYM_LEN * 2 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdentityError::MalformedStoredToken);
        }
        Ok(Pseudonym(text))
    }

    /// Protect `raw` and persist the record.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::AlreadyRegistered`] when the store's
    /// uniqueness constraint on the lookup hash rejects the insert.
    pub async fn register(
        &self,
        store: &dyn IdentityStore,
        raw: &str,
    ) -> Result<IdentityRecord, IdentityError> {
        let record = self.encrypt_for_storage(raw)?;
        match store.insert_identity(record.clone()).await {
            Ok(()) => {
                debug!("identity record stored");
                Ok(record)
            }
            Err(StoreError::Conflict(_)) => Err(IdentityError::AlreadyRegistered),
            Err(e) => Err(IdentityError::Store(e)),
        }
    }

    /// Whether a record for `raw` exists, by lookup hash only.
    pub async fn exists(
        &self,
        store: &dyn IdentityStore,
        raw: &str,
    ) -> Result<bool, IdentityError> {
        let hash = lookup_hash(&self.tokenize(raw)?);
        let found = store
            .find_identity(&hash)
            .await
            .map_err(IdentityError::Store)?;
        Ok(found.is_some())
    }
}

/// Display form that reveals only the last four digits: `XXXX XXXX 3517`.
pub fn mask(raw: &str) -> Result<String, IdentityError> {
    let digits = normalize(raw)?;
    Ok(format!("XXXX XXXX {}", &digits[IDENTITY_NUMBER_DIGITS - 4..]))
}

fn normalize(raw: &str) -> Result<String, IdentityError> {
    let digits: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if digits.len() != IDENTITY_NUMBER_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdentityError::InvalidFormat);
    }
    Ok(digits)
}

fn lookup_hash(pseudonym: &Pseudonym) -> String {
    crypto::sha256_hex(pseudonym.as_str().as_bytes())
}
