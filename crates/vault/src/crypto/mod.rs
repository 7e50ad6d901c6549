//! Field-level authenticated encryption and hashing primitives.
//!
//! This module is intentionally free of storage and ledger dependencies.
//!
//! # Encrypted field format
//!
//! ```text
//! IV(16) ‖ AuthTag(16) ‖ Ciphertext
//! ```
//!
//! A buffer is never turned back into plaintext without its tag verifying;
//! a tag mismatch is reported as an integrity failure, distinct from
//! structural (length, encoding) errors.

pub mod cipher;
pub mod digest;

pub use cipher::{decrypt_field, encrypt_field, CipherError, EncryptedField, FieldCipher};
pub use digest::{constant_time_eq, hmac_sha256, hmac_sha256_hex, random_token, sha256_hex};
