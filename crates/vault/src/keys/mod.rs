//! Master key loading and per-subject key derivation.
//!
//! # Lifecycle
//!
//! 1. At startup the composition root installs the hex-encoded master key from
//!    configuration. Absent or malformed key material is fatal.
//! 2. The key lives only in process memory behind an [`ArcSwapOption`], so the
//!    hot path reads it without locking.
//! 3. Every other component asks [`KeyManager::derive_key`] for a subject- and
//!    context-specific key; derived keys are recomputed on demand.
//!
//! The manager moves `Uninitialised → Ready` exactly once. There is no runtime
//! rotation path: a second install fails with [`KeyError::RotationUnsupported`].
//!
//! # Security invariants
//!
//! - Key material is **never** written to disk, logged, or included in traces.
//! - Derivation is deterministic: the same `(subject, context)` always yields
//!   the same key, so previously stored ciphertext stays decryptable.

pub mod material;

pub use material::{DerivedKey, MasterKey, KEY_LEN};

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use common::TrustError;
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use tracing::info;

use crate::config::{Config, ConfigError};

/// Errors produced by the key layer.
#[derive(Debug, Error)]
pub enum KeyError {
    /// No master key has been installed yet.
    #[error("master key not yet initialised")]
    NotInitialised,

    /// The supplied master key is not 64 hex characters.
    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),

    /// A master key is already installed and rotation is not supported.
    #[error("master key rotation is not supported")]
    RotationUnsupported,

    /// `subject` or `context` was empty.
    #[error("key derivation input must not be empty: {0}")]
    EmptyDerivationInput(&'static str),

    /// HKDF rejected the requested output length.
    #[error("key derivation failed")]
    Derivation,
}

impl From<KeyError> for TrustError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::NotInitialised => TrustError::Unavailable(e.to_string()),
            KeyError::InvalidMasterKey(_) | KeyError::RotationUnsupported => {
                TrustError::Config(e.to_string())
            }
            KeyError::EmptyDerivationInput(_) => TrustError::Validation(e.to_string()),
            KeyError::Derivation => TrustError::Internal(e.to_string()),
        }
    }
}

/// Holder of the process-wide master key.
#[derive(Debug, Default)]
pub struct KeyManager {
    master: ArcSwapOption<MasterKey>,
}

impl KeyManager {
    /// Create a manager with no key installed.
    pub fn new() -> Self {
        Self {
            master: ArcSwapOption::empty(),
        }
    }

    /// Create a manager and immediately install `master_hex`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidMasterKey`] if the key is malformed.
    pub fn from_hex(master_hex: &str) -> Result<Self, KeyError> {
        let manager = Self::new();
        manager.install(master_hex)?;
        Ok(manager)
    }

    /// Install the master key, moving the manager to `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidMasterKey`] if `master_hex` does not decode
    /// to exactly [`KEY_LEN`] bytes, and [`KeyError::RotationUnsupported`] if a
    /// key is already installed.
    pub fn install(&self, master_hex: &str) -> Result<(), KeyError> {
        let key = parse_master_key(master_hex)?;
        let previous = self
            .master
            .compare_and_swap(&None::<Arc<MasterKey>>, Some(Arc::new(key)));
        if previous.is_some() {
            return Err(KeyError::RotationUnsupported);
        }
        info!("master key installed");
        Ok(())
    }

    /// Returns `true` once a master key is installed.
    pub fn is_ready(&self) -> bool {
        self.master.load().is_some()
    }

    /// Return the immutable master key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotInitialised`] before [`KeyManager::install`].
    pub fn master_key(&self) -> Result<Arc<MasterKey>, KeyError> {
        self.master.load_full().ok_or(KeyError::NotInitialised)
    }

    /// Derive the key for `(subject_id, context)`.
    ///
    /// Extract: `PRK = HMAC-SHA256(key = subject_id, msg = master)`.
    /// Expand: `OKM = HMAC-SHA256(key = PRK, msg = context ‖ 0x01)`.
    ///
    /// This is single-block HKDF-SHA256 with the subject as salt and the
    /// context as info.
    pub fn derive_key(&self, subject_id: &str, context: &str) -> Result<DerivedKey, KeyError> {
        if subject_id.is_empty() {
            return Err(KeyError::EmptyDerivationInput("subject"));
        }
        if context.is_empty() {
            return Err(KeyError::EmptyDerivationInput("context"));
        }
        let master = self.master_key()?;
        let hk = Hkdf::<Sha256>::new(Some(subject_id.as_bytes()), master.as_bytes());
        let mut okm = [0u8; KEY_LEN];
        hk.expand(context.as_bytes(), &mut okm)
            .map_err(|_| KeyError::Derivation)?;
        Ok(DerivedKey::from_bytes(okm))
    }

    /// Check that the master key is installed and every independent signing
    /// secret is present before the system accepts requests.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate_config(&self, cfg: &Config) -> Result<(), ConfigError> {
        if !self.is_ready() {
            return Err(ConfigError::Missing("MASTER_ENCRYPTION_KEY"));
        }
        cfg.validate()
    }
}

fn parse_master_key(master_hex: &str) -> Result<MasterKey, KeyError> {
    let bytes = hex::decode(master_hex.trim())
        .map_err(|e| KeyError::InvalidMasterKey(format!("not valid hex: {e}")))?;
    let arr: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
        KeyError::InvalidMasterKey(format!(
            "expected {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(MasterKey::from_bytes(arr))
}
