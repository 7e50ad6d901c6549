//! Structured logging, and OTLP traces and metrics when a collector is
//! configured.
//!
//! # Telemetry invariants
//!
//! - **No PII, key material, or bearer tokens** may appear in any span
//!   attribute, metric label, or log field. Identifiers are logged only as
//!   grant/audit UUIDs or resource types.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`);
//!   `RUST_LOG` overrides it when set.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
