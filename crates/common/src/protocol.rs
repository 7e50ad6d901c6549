//! Wire formats exchanged with callers and transports.
//!
//! These types are serialised as JSON; the QR package is additionally wrapped
//! in URL-safe base64 before it is embedded in a QR code.

use serde::{Deserialize, Serialize};

use crate::error::TrustError;

/// Header carrying the primary session bearer token.
pub const SESSION_TOKEN_HEADER: &str = "Authorization";

/// Header carrying a consent bearer token. Kept distinct from the session
/// header so a consent token can never be mistaken for a session.
pub const CONSENT_TOKEN_HEADER: &str = "X-Consent-Token";

// ---------------------------------------------------------------------------
// QR token
// ---------------------------------------------------------------------------

/// The four hex-encoded components of a QR-embedded secure token.
///
/// `signature` covers `iv ‖ authTag ‖ ciphertext` and is computed with a key
/// independent of the encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecureQrPackage {
    /// Hex-encoded 12-byte IV.
    pub iv: String,
    /// Hex-encoded 16-byte authentication tag.
    pub auth_tag: String,
    /// Hex-encoded ciphertext of the augmented payload.
    pub ciphertext: String,
    /// Hex-encoded HMAC-SHA256 signature.
    pub signature: String,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&TrustError> for ErrorResponse {
    fn from(err: &TrustError) -> Self {
        Self::new(err.code(), err.public_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_package_uses_camel_case_keys() {
        let pkg = SecureQrPackage {
            iv: "00".into(),
            auth_tag: "11".into(),
            ciphertext: "22".into(),
            signature: "33".into(),
        };
        let json = serde_json::to_value(&pkg).unwrap();
        assert_eq!(json["authTag"], "11");
        assert!(json.get("auth_tag").is_none());
    }

    #[test]
    fn qr_package_rejects_unknown_fields() {
        let raw = r#"{"iv":"00","authTag":"11","ciphertext":"22","signature":"33","x":1}"#;
        assert!(serde_json::from_str::<SecureQrPackage>(raw).is_err());
    }

    #[test]
    fn error_response_from_security_error_is_generic() {
        let err = TrustError::SecurityViolation("hmac mismatch on iv".into());
        let resp = ErrorResponse::from(&err);
        assert_eq!(resp.code, "rejected");
        assert!(!resp.message.contains("hmac"));
    }

    #[test]
    fn consent_header_differs_from_session_header() {
        assert_ne!(
            CONSENT_TOKEN_HEADER.to_ascii_lowercase(),
            SESSION_TOKEN_HEADER.to_ascii_lowercase()
        );
    }
}
