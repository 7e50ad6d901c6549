//! Fixed-size key buffers for the master key and keys derived from it.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Byte length of every key in the core (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// The process-wide root secret.
///
/// Zeroed on drop. Never printed, not even in debug builds.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// A per-subject, per-context key computed from the [`MasterKey`].
///
/// Derived keys are recomputed on demand and never persisted.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_material_redacted_in_debug() {
        let mut buf = [0u8; KEY_LEN];
        buf[0] = 0xFF;
        assert!(format!("{:?}", MasterKey::from_bytes(buf)).contains("REDACTED"));
        assert!(format!("{:?}", DerivedKey::from_bytes(buf)).contains("REDACTED"));
    }

    #[test]
    fn zeroize_clears_bytes() {
        let mut key = DerivedKey::from_bytes([0x42; KEY_LEN]);
        key.zeroize();
        assert_eq!(key.as_bytes(), &[0u8; KEY_LEN]);
    }
}
