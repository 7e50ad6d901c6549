//! Configuration loading and validation for the trust core.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required secret is missing or invalid;
//! nothing in the core is constructed from a partially valid configuration.

use std::fmt;

use common::TrustError;
use serde::Deserialize;
use thiserror::Error;

/// Hex length of the 256-bit master encryption key.
pub const MASTER_KEY_HEX_LEN: usize = 64;

/// Upper bound on a consent grant's lifetime (24 hours).
pub const CONSENT_TTL_CEILING_MINUTES: u32 = 1440;

/// Lowest PBKDF2 iteration count accepted from configuration.
pub const MIN_PBKDF2_ITERATIONS: u32 = 1000;

/// Longest access token lifetime accepted from configuration (1 day).
pub const MAX_ACCESS_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Longest refresh token lifetime accepted from configuration (365 days).
pub const MAX_REFRESH_TOKEN_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Fatal startup configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration sources could not be read or deserialised.
    #[error("failed to load configuration: {0}")]
    Load(String),

    /// A required secret is absent or empty.
    #[error("{0} is required and must not be empty")]
    Missing(&'static str),

    /// A value is present but malformed or out of range.
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl From<ConfigError> for TrustError {
    fn from(e: ConfigError) -> Self {
        TrustError::Config(e.to_string())
    }
}

/// A secret string that never appears in `Debug` output.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

/// Validated trust-core configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Hex-encoded 256-bit master encryption key. **Required.**
    #[serde(default)]
    pub master_encryption_key: Secret,

    /// HMAC secret for access tokens. **Required.**
    #[serde(default)]
    pub access_token_secret: Secret,

    /// HMAC secret for refresh tokens. **Required.**
    #[serde(default)]
    pub refresh_token_secret: Secret,

    /// HMAC secret for consent bearer tokens. **Required.**
    #[serde(default)]
    pub consent_token_secret: Secret,

    /// PBKDF2 iteration count for newly hashed passwords.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,

    /// Access token lifetime in seconds.
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: u64,

    /// Refresh token lifetime in seconds.
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl_secs: u64,

    /// Longest lifetime a consent grant may be issued with.
    #[serde(default = "default_consent_max_ttl")]
    pub consent_max_ttl_minutes: u32,

    /// Timeout applied to each ledger call made by the audit trail.
    #[serde(default = "default_ledger_timeout")]
    pub ledger_timeout_ms: u64,

    /// OTLP endpoint for span export. Logs only when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_pbkdf2_iterations() -> u32 {
    10_000
}
fn default_access_token_ttl() -> u64 {
    15 * 60
}
fn default_refresh_token_ttl() -> u64 {
    7 * 24 * 60 * 60
}
fn default_consent_max_ttl() -> u32 {
    CONSENT_TTL_CEILING_MINUTES
}
fn default_ledger_timeout() -> u64 {
    5_000
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any variable is absent, cannot be parsed,
    /// or fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        let c: Config = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        c.validate()?;
        Ok(c)
    }

    /// Build a configuration from explicit secrets with every other field at
    /// its default. Used by embedders that source secrets elsewhere.
    pub fn with_secrets(
        master_encryption_key: &str,
        access_token_secret: &str,
        refresh_token_secret: &str,
        consent_token_secret: &str,
    ) -> Result<Self, ConfigError> {
        let c = Config {
            master_encryption_key: Secret::new(master_encryption_key),
            access_token_secret: Secret::new(access_token_secret),
            refresh_token_secret: Secret::new(refresh_token_secret),
            consent_token_secret: Secret::new(consent_token_secret),
            pbkdf2_iterations: default_pbkdf2_iterations(),
            access_token_ttl_secs: default_access_token_ttl(),
            refresh_token_ttl_secs: default_refresh_token_ttl(),
            consent_max_ttl_minutes: default_consent_max_ttl(),
            ledger_timeout_ms: default_ledger_timeout(),
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        };
        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_present(&self.master_encryption_key, "MASTER_ENCRYPTION_KEY")?;
        ensure_present(&self.access_token_secret, "ACCESS_TOKEN_SECRET")?;
        ensure_present(&self.refresh_token_secret, "REFRESH_TOKEN_SECRET")?;
        ensure_present(&self.consent_token_secret, "CONSENT_TOKEN_SECRET")?;

        let master = self.master_encryption_key.expose().trim();
        if master.len() != MASTER_KEY_HEX_LEN || !master.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ConfigError::Invalid {
                name: "MASTER_ENCRYPTION_KEY",
                reason: format!("expected {MASTER_KEY_HEX_LEN} hex characters"),
            });
        }

        let signing = [
            ("ACCESS_TOKEN_SECRET", &self.access_token_secret),
            ("REFRESH_TOKEN_SECRET", &self.refresh_token_secret),
            ("CONSENT_TOKEN_SECRET", &self.consent_token_secret),
        ];
        for (i, &(name, secret)) in signing.iter().enumerate() {
            if secret.expose().eq_ignore_ascii_case(master) {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must differ from the master encryption key".into(),
                });
            }
            for (_, other) in &signing[i + 1..] {
                if secret.expose() == other.expose() {
                    return Err(ConfigError::Invalid {
                        name,
                        reason: "signing secrets must be independent of each other".into(),
                    });
                }
            }
        }

        if self.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(ConfigError::Invalid {
                name: "PBKDF2_ITERATIONS",
                reason: format!("must be at least {MIN_PBKDF2_ITERATIONS}"),
            });
        }
        if self.access_token_ttl_secs == 0
            || self.access_token_ttl_secs > MAX_ACCESS_TOKEN_TTL_SECS
        {
            return Err(ConfigError::Invalid {
                name: "ACCESS_TOKEN_TTL_SECS",
                reason: format!("must be within 1..={MAX_ACCESS_TOKEN_TTL_SECS}"),
            });
        }
        if self.refresh_token_ttl_secs > MAX_REFRESH_TOKEN_TTL_SECS {
            return Err(ConfigError::Invalid {
                name: "REFRESH_TOKEN_TTL_SECS",
                reason: format!("must not exceed {MAX_REFRESH_TOKEN_TTL_SECS}"),
            });
        }
        if self.refresh_token_ttl_secs <= self.access_token_ttl_secs {
            return Err(ConfigError::Invalid {
                name: "REFRESH_TOKEN_TTL_SECS",
                reason: "must exceed the access token lifetime".into(),
            });
        }
        if self.consent_max_ttl_minutes == 0
            || self.consent_max_ttl_minutes > CONSENT_TTL_CEILING_MINUTES
        {
            return Err(ConfigError::Invalid {
                name: "CONSENT_MAX_TTL_MINUTES",
                reason: format!("must be within 1..={CONSENT_TTL_CEILING_MINUTES}"),
            });
        }
        if self.ledger_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "LEDGER_TIMEOUT_MS",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }
}

fn ensure_present(value: &Secret, name: &'static str) -> Result<(), ConfigError> {
    if value.is_blank() {
        return Err(ConfigError::Missing(name));
    }
    Ok(())
}
