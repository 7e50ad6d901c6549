//! Common error taxonomy shared across crates.

use thiserror::Error;

/// Top-level trust-core error type.
///
/// Every component error converts into one of these variants. Variants map to
/// HTTP status codes for whichever transport sits in front of the core:
/// - [`TrustError::Config`] → 500 (startup only; the process must not serve)
/// - [`TrustError::Validation`] → 400
/// - [`TrustError::Integrity`] / [`TrustError::SecurityViolation`] → 401
/// - [`TrustError::Expired`] → 401
/// - [`TrustError::Forbidden`] → 403
/// - [`TrustError::NotFound`] → 404
/// - [`TrustError::Unavailable`] → 503
#[derive(Debug, Error)]
pub enum TrustError {
    /// A required secret or setting is absent or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller-correctable malformed input.
    #[error("validation error: {0}")]
    Validation(String),

    /// An authentication tag did not verify: tampered data or the wrong key.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// A signature did not verify, or a protocol-level tamper signal fired.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// A time-bound credential or grant is past its expiry.
    #[error("expired: {0}")]
    Expired(String),

    /// The caller is identified but not authorised (revoked or insufficient consent).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The referenced grant or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A collaborator (store, ledger) is temporarily unreachable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TrustError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            TrustError::Validation(_) => 400,
            TrustError::Integrity(_)
            | TrustError::SecurityViolation(_)
            | TrustError::Expired(_) => 401,
            TrustError::Forbidden(_) => 403,
            TrustError::NotFound(_) => 404,
            TrustError::Unavailable(_) => 503,
            TrustError::Config(_) | TrustError::Internal(_) => 500,
        }
    }

    /// Short machine-readable code, safe to return to callers.
    pub fn code(&self) -> &'static str {
        match self {
            TrustError::Config(_) => "internal_error",
            TrustError::Validation(_) => "bad_request",
            TrustError::Integrity(_) | TrustError::SecurityViolation(_) => "rejected",
            TrustError::Expired(_) => "expired",
            TrustError::Forbidden(_) => "forbidden",
            TrustError::NotFound(_) => "not_found",
            TrustError::Unavailable(_) => "service_unavailable",
            TrustError::Internal(_) => "internal_error",
        }
    }

    /// Caller-safe message.
    ///
    /// Integrity and security failures collapse into one generic rejection so
    /// callers cannot use the response as an oracle. Validation messages are
    /// passed through because they describe the caller's own input.
    pub fn public_message(&self) -> String {
        match self {
            TrustError::Validation(msg) => msg.clone(),
            TrustError::Integrity(_) | TrustError::SecurityViolation(_) => {
                "the supplied credential could not be verified".into()
            }
            TrustError::Expired(_) => "the supplied credential has expired".into(),
            TrustError::Forbidden(_) => "access to this resource is not permitted".into(),
            TrustError::NotFound(_) => "the requested resource does not exist".into(),
            TrustError::Unavailable(_) => "service temporarily unavailable".into(),
            TrustError::Config(_) | TrustError::Internal(_) => "internal error".into(),
        }
    }

    /// Whether this error should drive security alerting.
    pub fn is_security_signal(&self) -> bool {
        matches!(
            self,
            TrustError::Integrity(_) | TrustError::SecurityViolation(_)
        )
    }
}
