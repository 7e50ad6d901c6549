//! AES-256-GCM encryption and decryption of individual fields.
//!
//! Every call draws a fresh 128-bit IV from the OS CSPRNG; an IV is never
//! reused under the same key. The authentication tag is verified during
//! decryption and plaintext is only returned once it has passed.

use std::collections::BTreeMap;
use std::sync::Arc;

use aes_gcm::{
    aead::{
        consts::U16, generic_array::GenericArray, rand_core::RngCore, AeadInPlace, KeyInit, OsRng,
    },
    aes::Aes256,
    AesGcm,
};
use common::TrustError;
use thiserror::Error;

use crate::keys::{KeyError, KeyManager, KEY_LEN};

/// Byte length of the per-field IV.
pub const IV_LEN: usize = 16;

/// Byte length of the GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// Shortest buffer that can hold a field: `IV ‖ Tag` with empty ciphertext.
pub const MIN_FIELD_LEN: usize = IV_LEN + TAG_LEN;

/// AES-256-GCM with a 16-byte nonce.
type FieldAead = AesGcm<Aes256, U16>;

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// Empty plaintext was passed to `encrypt`.
    #[error("plaintext must not be empty")]
    EmptyPlaintext,

    /// The buffer is shorter than `IV ‖ Tag`.
    #[error("encrypted field too short: expected at least {MIN_FIELD_LEN} bytes, got {0}")]
    Truncated(usize),

    /// A transport encoding (hex) could not be decoded.
    #[error("encrypted field is not valid hex")]
    InvalidEncoding,

    /// The authentication tag did not verify: tampered data or wrong key.
    #[error("authentication tag mismatch")]
    IntegrityFailure,

    /// The AEAD refused to encrypt (input beyond the GCM length limit).
    #[error("aead encryption failed")]
    EncryptionFailure,

    /// Decrypted bytes were expected to be UTF-8 text.
    #[error("decrypted field is not valid UTF-8")]
    NotUtf8,

    /// Key derivation for the field failed.
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl From<CipherError> for TrustError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::EmptyPlaintext
            | CipherError::Truncated(_)
            | CipherError::InvalidEncoding => TrustError::Validation(e.to_string()),
            CipherError::IntegrityFailure => TrustError::Integrity(e.to_string()),
            CipherError::Key(k) => k.into(),
            CipherError::InvalidKeyLength
            | CipherError::EncryptionFailure
            | CipherError::NotUtf8 => TrustError::Internal(e.to_string()),
        }
    }
}

/// A parsed, encrypted field value.
///
/// The storage representation is `IV(16) ‖ AuthTag(16) ‖ Ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    /// Raw IV bytes.
    pub iv: [u8; IV_LEN],
    /// Raw GCM tag bytes.
    pub tag: [u8; TAG_LEN],
    /// Raw ciphertext bytes (same length as the plaintext).
    pub ciphertext: Vec<u8>,
}

impl EncryptedField {
    /// Encode to the storage byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_FIELD_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Split a storage buffer into its components.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Truncated`] if `bytes` is shorter than
    /// [`MIN_FIELD_LEN`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() < MIN_FIELD_LEN {
            return Err(CipherError::Truncated(bytes.len()));
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[..IV_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[IV_LEN..MIN_FIELD_LEN]);
        Ok(Self {
            iv,
            tag,
            ciphertext: bytes[MIN_FIELD_LEN..].to_vec(),
        })
    }

    /// Hex encoding of [`EncryptedField::to_bytes`], for text columns.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Parse the hex form produced by [`EncryptedField::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(s).map_err(|_| CipherError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }
}

/// Encrypt a plaintext field using AES-256-GCM.
///
/// # Errors
///
/// Returns [`CipherError::EmptyPlaintext`] on empty input and
/// [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
pub fn encrypt_field(plaintext: &[u8], key: &[u8]) -> Result<EncryptedField, CipherError> {
    if plaintext.is_empty() {
        return Err(CipherError::EmptyPlaintext);
    }
    let cipher = build_cipher(key)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
        .map_err(|_| CipherError::EncryptionFailure)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(&tag);
    Ok(EncryptedField {
        iv,
        tag: tag_bytes,
        ciphertext: buffer,
    })
}

/// Decrypt a storage buffer back to plaintext bytes.
///
/// # Errors
///
/// Returns [`CipherError::Truncated`] for buffers shorter than
/// [`MIN_FIELD_LEN`], and [`CipherError::IntegrityFailure`] if the tag does
/// not verify. No plaintext is ever returned on tag failure.
pub fn decrypt_field(bytes: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let field = EncryptedField::from_bytes(bytes)?;
    decrypt_parsed(&field, key)
}

/// Decrypt an already-parsed [`EncryptedField`].
pub fn decrypt_parsed(field: &EncryptedField, key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let mut buffer = field.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&field.iv),
            b"",
            &mut buffer,
            GenericArray::from_slice(&field.tag),
        )
        .map_err(|_| CipherError::IntegrityFailure)?;
    Ok(buffer)
}

fn build_cipher(key: &[u8]) -> Result<FieldAead, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    FieldAead::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}

// ---------------------------------------------------------------------------
// Key-managed field cipher
// ---------------------------------------------------------------------------

/// Field encryption bound to the [`KeyManager`].
///
/// Each call derives the key for `(subject, context)`, so two subjects never
/// share a field key.
#[derive(Clone, Debug)]
pub struct FieldCipher {
    keys: Arc<KeyManager>,
}

impl FieldCipher {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// Encrypt `plaintext` under the key derived for `(subject, context)`.
    pub fn encrypt(
        &self,
        subject: &str,
        context: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedField, CipherError> {
        let key = self.keys.derive_key(subject, context)?;
        encrypt_field(plaintext, key.as_bytes())
    }

    /// Decrypt a storage buffer under the key derived for `(subject, context)`.
    pub fn decrypt(
        &self,
        subject: &str,
        context: &str,
        bytes: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let key = self.keys.derive_key(subject, context)?;
        decrypt_field(bytes, key.as_bytes())
    }

    /// Decrypt a field that is known to hold UTF-8 text.
    pub fn decrypt_string(
        &self,
        subject: &str,
        context: &str,
        bytes: &[u8],
    ) -> Result<String, CipherError> {
        let plaintext = self.decrypt(subject, context, bytes)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::NotUtf8)
    }

    /// Encrypt every value of a name→value map, preserving the names.
    ///
    /// Fails as a whole on the first error; no partial map is returned.
    pub fn encrypt_batch(
        &self,
        subject: &str,
        context: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, EncryptedField>, CipherError> {
        let key = self.keys.derive_key(subject, context)?;
        fields
            .iter()
            .map(|(name, value)| {
                let field = encrypt_field(value.as_bytes(), key.as_bytes())?;
                Ok((name.clone(), field))
            })
            .collect()
    }

    /// Decrypt every value of a name→buffer map back to text.
    pub fn decrypt_batch(
        &self,
        subject: &str,
        context: &str,
        fields: &BTreeMap<String, Vec<u8>>,
    ) -> Result<BTreeMap<String, String>, CipherError> {
        let key = self.keys.derive_key(subject, context)?;
        fields
            .iter()
            .map(|(name, bytes)| {
                let plaintext = decrypt_field(bytes, key.as_bytes())?;
                let text = String::from_utf8(plaintext).map_err(|_| CipherError::NotUtf8)?;
                Ok((name.clone(), text))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::TEST_MASTER_KEY;

    fn random_key() -> Vec<u8> {
        let mut key = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    fn field_cipher() -> FieldCipher {
        FieldCipher::new(Arc::new(KeyManager::from_hex(TEST_MASTER_KEY).unwrap()))
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = random_key();
        let samples: [&[u8]; 3] = [b"a", b"+91 98765 43210", &[0u8; 4096]];
        for plaintext in samples {
            let encrypted = encrypt_field(plaintext, &key).unwrap();
            let decrypted = decrypt_field(&encrypted.to_bytes(), &key).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn storage_layout_is_iv_tag_ciphertext() {
        let key = random_key();
        let encrypted = encrypt_field(b"hello", &key).unwrap();
        let bytes = encrypted.to_bytes();
        assert_eq!(bytes.len(), MIN_FIELD_LEN + 5);
        assert_eq!(&bytes[..IV_LEN], &encrypted.iv);
        assert_eq!(&bytes[IV_LEN..MIN_FIELD_LEN], &encrypted.tag);
    }

    #[test]
    fn fresh_iv_per_call() {
        let key = random_key();
        let a = encrypt_field(b"same", &key).unwrap();
        let b = encrypt_field(b"same", &key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn empty_plaintext_rejected() {
        let key = random_key();
        assert!(matches!(
            encrypt_field(b"", &key),
            Err(CipherError::EmptyPlaintext)
        ));
    }

    #[test]
    fn short_buffer_is_validation_error() {
        let key = random_key();
        let err = decrypt_field(&[0u8; MIN_FIELD_LEN - 1], &key).unwrap_err();
        assert!(matches!(err, CipherError::Truncated(31)));
        assert!(matches!(TrustError::from(err), TrustError::Validation(_)));
    }

    #[test]
    fn wrong_key_fails_integrity() {
        let encrypted = encrypt_field(b"secret", &random_key()).unwrap();
        let err = decrypt_field(&encrypted.to_bytes(), &random_key()).unwrap_err();
        assert!(matches!(err, CipherError::IntegrityFailure));
        assert!(matches!(TrustError::from(err), TrustError::Integrity(_)));
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert!(matches!(
            encrypt_field(b"x", &[0u8; 16]),
            Err(CipherError::InvalidKeyLength)
        ));
    }

    #[test]
    fn any_flipped_bit_in_tag_or_ciphertext_fails() {
        let key = random_key();
        let bytes = encrypt_field(b"tamper me", &key).unwrap().to_bytes();
        for byte in IV_LEN..bytes.len() {
            for bit in 0..8 {
                let mut tampered = bytes.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(decrypt_field(&tampered, &key), Err(CipherError::IntegrityFailure)),
                    "flip at byte {byte} bit {bit} was not detected"
                );
            }
        }
    }

    #[test]
    fn hex_repr_round_trip() {
        let key = random_key();
        let field = encrypt_field(b"hello", &key).unwrap();
        let parsed = EncryptedField::from_hex(&field.to_hex()).unwrap();
        assert_eq!(parsed, field);
        assert!(matches!(
            EncryptedField::from_hex("not-hex"),
            Err(CipherError::InvalidEncoding)
        ));
    }

    #[test]
    fn field_cipher_separates_subjects() {
        let cipher = field_cipher();
        let encrypted = cipher.encrypt("patient-1", "phone", b"9876543210").unwrap();
        let bytes = encrypted.to_bytes();
        assert_eq!(
            cipher.decrypt_string("patient-1", "phone", &bytes).unwrap(),
            "9876543210"
        );
        assert!(matches!(
            cipher.decrypt("patient-2", "phone", &bytes),
            Err(CipherError::IntegrityFailure)
        ));
    }

    #[test]
    fn batch_preserves_names() {
        let cipher = field_cipher();
        let mut fields = BTreeMap::new();
        fields.insert("phone".to_string(), "9876543210".to_string());
        fields.insert("address".to_string(), "12 MG Road".to_string());

        let encrypted = cipher.encrypt_batch("patient-1", "profile", &fields).unwrap();
        assert_eq!(encrypted.len(), 2);

        let buffers: BTreeMap<String, Vec<u8>> = encrypted
            .into_iter()
            .map(|(k, v)| (k, v.to_bytes()))
            .collect();
        let decrypted = cipher.decrypt_batch("patient-1", "profile", &buffers).unwrap();
        assert_eq!(decrypted, fields);
    }

    #[test]
    fn batch_fails_on_empty_value() {
        let cipher = field_cipher();
        let mut fields = BTreeMap::new();
        fields.insert("phone".to_string(), String::new());
        assert!(matches!(
            cipher.encrypt_batch("patient-1", "profile", &fields),
            Err(CipherError::EmptyPlaintext)
        ));
    }
}
