//! PBKDF2-HMAC-SHA512 password hashing.
//!
//! # Stored format
//!
//! ```text
//! <iterations>:<hex(salt)>:<hex(hash)>
//! ```
//!
//! The iteration count travels with each hash so the configured count can be
//! raised without invalidating existing credentials. Legacy two-part
//! `<salt>:<hash>` values are verified with the currently configured count.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;

use crate::crypto::{constant_time_eq, digest::random_bytes};

/// Random salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Derived hash length in bytes.
pub const HASH_LEN: usize = 64;

/// Hash `password` with a fresh random salt.
pub fn hash_password(password: &str, iterations: u32) -> String {
    let salt = random_bytes(SALT_LEN);
    let hash = derive(password, &salt, iterations);
    format!("{iterations}:{}:{}", hex::encode(salt), hex::encode(hash))
}

/// Re-derive with the stored salt and compare in constant time.
///
/// Malformed stored values verify as `false`; they are never an error.
pub fn verify_password(password: &str, stored: &str, default_iterations: u32) -> bool {
    let Some(parsed) = StoredHash::parse(stored, default_iterations) else {
        return false;
    };
    let candidate = derive(password, &parsed.salt, parsed.iterations);
    constant_time_eq(&candidate, &parsed.hash)
}

/// Whether `stored` should be re-hashed on next successful login: it is in
/// the legacy format, malformed, or uses a different iteration count.
pub fn needs_rehash(stored: &str, iterations: u32) -> bool {
    match StoredHash::parse(stored, iterations) {
        Some(parsed) => parsed.legacy || parsed.iterations != iterations,
        None => true,
    }
}

struct StoredHash {
    iterations: u32,
    salt: Vec<u8>,
    hash: Vec<u8>,
    legacy: bool,
}

impl StoredHash {
    fn parse(stored: &str, default_iterations: u32) -> Option<Self> {
        let parts: Vec<&str> = stored.split(':').collect();
        let (iterations, salt_hex, hash_hex, legacy) = match parts.as_slice() {
            [salt, hash] => (default_iterations, *salt, *hash, true),
            [iterations, salt, hash] => (iterations.parse().ok()?, *salt, *hash, false),
            _ => return None,
        };
        if iterations == 0 {
            return None;
        }
        let salt = hex::decode(salt_hex).ok()?;
        let hash = hex::decode(hash_hex).ok()?;
        if salt.len() != SALT_LEN || hash.len() != HASH_LEN {
            return None;
        }
        Some(Self {
            iterations,
            salt,
            hash,
            legacy,
        })
    }
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITER: u32 = 1_000;

    #[test]
    fn hash_then_verify() {
        let stored = hash_password("correct horse", ITER);
        assert!(verify_password("correct horse", &stored, ITER));
        assert!(!verify_password("wrong horse", &stored, ITER));
    }

    #[test]
    fn same_password_hashes_differently() {
        let a = hash_password("correct horse", ITER);
        let b = hash_password("correct horse", ITER);
        assert_ne!(a, b);
        assert!(verify_password("correct horse", &a, ITER));
        assert!(verify_password("correct horse", &b, ITER));
    }

    #[test]
    fn stored_format_carries_iterations() {
        let stored = hash_password("pw", ITER);
        let parts: Vec<&str> = stored.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "1000");
        assert_eq!(parts[1].len(), SALT_LEN * 2);
        assert_eq!(parts[2].len(), HASH_LEN * 2);
    }

    #[test]
    fn changed_configured_count_still_verifies() {
        let stored = hash_password("pw", ITER);
        assert!(verify_password("pw", &stored, 20_000));
        assert!(needs_rehash(&stored, 20_000));
        assert!(!needs_rehash(&stored, ITER));
    }

    #[test]
    fn legacy_two_part_format_verifies_with_default_count() {
        let salt = [7u8; SALT_LEN];
        let hash = derive("pw", &salt, ITER);
        let legacy = format!("{}:{}", hex::encode(salt), hex::encode(hash));
        assert!(verify_password("pw", &legacy, ITER));
        assert!(!verify_password("pw", &legacy, ITER + 1));
        assert!(needs_rehash(&legacy, ITER));
    }

    #[test]
    fn malformed_stored_values_are_false() {
        for stored in [
            "",
            "nocolon",
            "zz:zz",
            "a:b:c:d",
            "0:00000000000000000000000000000000:00",
            "abc:00:00",
        ] {
            assert!(!verify_password("pw", stored, ITER), "{stored:?}");
        }
    }
}
