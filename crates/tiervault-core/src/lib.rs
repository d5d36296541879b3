//! Core library for `tiervault`.
//!
//! Classifies secrets into security levels, evaluates attribute-based access
//! policies, and encrypts payloads with a cipher chosen by level. The
//! [`manager::SecretManager`] orchestrates the three over a pluggable
//! [`backend::SecretBackend`] and an audited, fail-closed
//! [`audit::AuditManager`]. This crate owns no storage and no transport.

pub mod audit;
pub mod audit_file;
pub mod backend;
pub mod classifier;
pub mod condition;
pub mod config;
pub mod crypto;
pub mod encryption;
pub mod error;
pub mod generator;
pub mod manager;
pub mod metadata;
pub mod policy;
