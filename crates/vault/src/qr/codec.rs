//! Encrypt-then-sign / verify-then-decrypt packaging.

use std::sync::Arc;

use aes_gcm_siv::{
    aead::{AeadInPlace, KeyInit},
    Aes256GcmSiv, Nonce, Tag,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{TimeZone, Utc};
use common::protocol::SecureQrPackage;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use super::{QrError, VerifiedQr};
use crate::crypto::{digest::random_bytes, hmac_sha256_hex, random_token};
use crate::keys::{DerivedKey, KeyManager};

type HmacSha256 = Hmac<Sha256>;

/// Byte length of the AES-GCM-SIV IV.
pub const IV_LEN: usize = 12;

/// Byte length of the AEAD authentication tag.
pub const TAG_LEN: usize = 16;

/// Byte length of the HMAC-SHA256 signature.
pub const SIGNATURE_LEN: usize = 32;

/// Random bytes mixed into each payload so identical payloads never produce
/// identical tokens.
const NONCE_LEN: usize = 16;

const ENCRYPTION_CONTEXT: &str = "encryption";
const SIGNING_CONTEXT: &str = "signing";
const LOOKUP_SUBJECT: &str = "qr:lookup";
const LOOKUP_CONTEXT: &str = "blind-index";

/// What actually gets sealed.
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    payload: T,
    nonce: String,
    /// Unix milliseconds.
    timestamp: i64,
}

/// Seals payloads into QR tokens and opens them again.
#[derive(Clone, Debug)]
pub struct SecureTokenCodec {
    keys: Arc<KeyManager>,
}

impl SecureTokenCodec {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// Seal `payload` for `resource_type` and return the QR token string.
    pub fn create<T: Serialize>(
        &self,
        payload: &T,
        resource_type: &str,
    ) -> Result<String, QrError> {
        let (enc_key, sig_key) = self.subkeys(resource_type)?;

        let envelope = Envelope {
            payload,
            nonce: random_token(NONCE_LEN),
            timestamp: Utc::now().timestamp_millis(),
        };
        let mut buffer =
            serde_json::to_vec(&envelope).map_err(|e| QrError::Serialization(e.to_string()))?;

        let iv = random_bytes(IV_LEN);
        let cipher = Aes256GcmSiv::new_from_slice(enc_key.as_bytes())
            .map_err(|_| QrError::EncryptionFailure)?;
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| QrError::EncryptionFailure)?;

        let signature = signer(&sig_key)?
            .chain_update(&iv)
            .chain_update(tag)
            .chain_update(&buffer)
            .finalize()
            .into_bytes();

        let package = SecureQrPackage {
            iv: hex::encode(&iv),
            auth_tag: hex::encode(tag),
            ciphertext: hex::encode(&buffer),
            signature: hex::encode(signature),
        };
        let json =
            serde_json::to_vec(&package).map_err(|e| QrError::Serialization(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Open a QR token sealed for `resource_type`.
    ///
    /// The signature is checked in constant time before decryption is
    /// attempted. Both a bad signature and a bad tag are tamper signals.
    pub fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        resource_type: &str,
    ) -> Result<VerifiedQr<T>, QrError> {
        let parts = Parts::parse(token)?;
        let (enc_key, sig_key) = self.subkeys(resource_type)?;

        let checked = signer(&sig_key)?
            .chain_update(&parts.iv)
            .chain_update(&parts.tag)
            .chain_update(&parts.ciphertext)
            .verify_slice(&parts.signature);
        if checked.is_err() {
            warn!(resource_type, "QR signature mismatch");
            return Err(QrError::SignatureMismatch);
        }

        let cipher = Aes256GcmSiv::new_from_slice(enc_key.as_bytes())
            .map_err(|_| QrError::EncryptionFailure)?;
        let mut buffer = parts.ciphertext;
        if cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&parts.iv),
                b"",
                &mut buffer,
                Tag::from_slice(&parts.tag),
            )
            .is_err()
        {
            warn!(resource_type, "QR authentication tag mismatch after valid signature");
            return Err(QrError::TagMismatch);
        }

        let envelope: Envelope<T> = serde_json::from_slice(&buffer)
            .map_err(|_| QrError::InvalidToken("payload does not match the expected shape"))?;
        let issued_at = Utc
            .timestamp_millis_opt(envelope.timestamp)
            .single()
            .ok_or(QrError::InvalidToken("timestamp out of range"))?;

        Ok(VerifiedQr {
            payload: envelope.payload,
            nonce: envelope.nonce,
            issued_at,
        })
    }

    /// Blind keyed-hash index for `id`, safe to hand to external
    /// collaborators such as the ledger.
    pub fn lookup_hash(&self, id: &str) -> Result<String, QrError> {
        if id.is_empty() {
            return Err(QrError::Validation("lookup id must not be empty"));
        }
        let key = self.keys.derive_key(LOOKUP_SUBJECT, LOOKUP_CONTEXT)?;
        Ok(hmac_sha256_hex(key.as_bytes(), id.as_bytes()))
    }

    fn subkeys(&self, resource_type: &str) -> Result<(DerivedKey, DerivedKey), QrError> {
        if resource_type.is_empty() {
            return Err(QrError::Validation("resource type must not be empty"));
        }
        let subject = format!("qr:{resource_type}");
        Ok((
            self.keys.derive_key(&subject, ENCRYPTION_CONTEXT)?,
            self.keys.derive_key(&subject, SIGNING_CONTEXT)?,
        ))
    }
}

fn signer(key: &DerivedKey) -> Result<HmacSha256, QrError> {
    <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).map_err(|_| QrError::EncryptionFailure)
}

/// Decoded binary components of a token.
struct Parts {
    iv: Vec<u8>,
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
    signature: Vec<u8>,
}

impl Parts {
    fn parse(token: &str) -> Result<Self, QrError> {
        let json = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| QrError::InvalidToken("not url-safe base64"))?;
        let package: SecureQrPackage = serde_json::from_slice(&json)
            .map_err(|_| QrError::InvalidToken("not a QR package"))?;

        let parts = Self {
            iv: lower_hex(&package.iv)?,
            tag: lower_hex(&package.auth_tag)?,
            ciphertext: lower_hex(&package.ciphertext)?,
            signature: lower_hex(&package.signature)?,
        };
        if parts.iv.len() != IV_LEN
            || parts.tag.len() != TAG_LEN
            || parts.signature.len() != SIGNATURE_LEN
            || parts.ciphertext.is_empty()
        {
            return Err(QrError::InvalidToken("component length"));
        }
        Ok(parts)
    }
}

/// Only the canonical lowercase encoding is accepted, so every token has
/// exactly one textual form.
fn lower_hex(s: &str) -> Result<Vec<u8>, QrError> {
    if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(QrError::InvalidToken("component is not lowercase hex"));
    }
    hex::decode(s).map_err(|_| QrError::InvalidToken("component is not hex"))
}
