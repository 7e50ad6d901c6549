//! Cryptographic trust core for a healthcare platform.
//!
//! Components are built once by [`services::Vault::from_config`] and share a
//! single [`keys::KeyManager`]. Persistence and the external ledger are
//! collaborators behind async traits ([`store`], [`audit::Ledger`]).

pub mod audit;
pub mod config;
pub mod consent;
pub mod credentials;
pub mod crypto;
pub mod identity;
pub mod keys;
pub mod qr;
pub mod services;
pub mod store;
pub mod telemetry;

pub use services::{Collaborators, Vault};
