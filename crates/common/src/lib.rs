//! Common types, wire formats, and errors shared across `vault` crates.

pub mod error;
pub mod model;
pub mod protocol;

pub use error::TrustError;
