//! Engine configuration for `tiervault`.
//!
//! Loads configuration from environment variables with defaults. All
//! settings can be overridden via `TIERVAULT_*` environment variables.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::AuditManager;
use crate::audit_file::FileAuditBackend;
use crate::backend::{MemorySecretBackend, SecretBackend};
use crate::crypto::{self, KdfParams, MasterKey};
use crate::encryption::{EncryptionEngine, MemoryKeyStore};
use crate::error::ConfigError;
use crate::manager::SecretManager;
use crate::policy::PolicyEngine;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root key for every derived key. Random (and ephemeral) when unset.
    pub master_key: Option<MasterKey>,
    /// scrypt cost.
    pub kdf: KdfParams,
    /// Path to the audit log file (if file audit is enabled).
    pub audit_file_path: Option<PathBuf>,
    /// Key for HMAC'ing session ids in audit entries. Random when unset.
    pub audit_hmac_key: Option<Vec<u8>>,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            kdf: KdfParams::default(),
            audit_file_path: None,
            audit_hmac_key: None,
            log_level: "info".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TIERVAULT_MASTER_KEY`: 64 hex chars (default: random per process)
    /// - `TIERVAULT_SCRYPT_LOG_N`: scrypt cost exponent (default: `14`)
    /// - `TIERVAULT_SCRYPT_R`: scrypt block size (default: `8`)
    /// - `TIERVAULT_SCRYPT_P`: scrypt parallelism (default: `1`)
    /// - `TIERVAULT_AUDIT_FILE`: path to a JSON-lines audit log (optional)
    /// - `TIERVAULT_AUDIT_HMAC_KEY`: audit HMAC key (default: random)
    /// - `TIERVAULT_LOG_LEVEL`: log filter (default: `info`)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// [`from_env`](Self::from_env) over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = KdfParams::default();

        let master_key = get("TIERVAULT_MASTER_KEY")
            .map(|hex| {
                MasterKey::from_hex(hex.trim()).map_err(|e| ConfigError::InvalidValue {
                    var: "TIERVAULT_MASTER_KEY".to_owned(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let log_n: u8 = parse_or(&get, "TIERVAULT_SCRYPT_LOG_N", defaults.log_n)?;
        let r: u32 = parse_or(&get, "TIERVAULT_SCRYPT_R", defaults.r)?;
        let p: u32 = parse_or(&get, "TIERVAULT_SCRYPT_P", defaults.p)?;
        if log_n == 0 || log_n >= 64 {
            return Err(invalid("TIERVAULT_SCRYPT_LOG_N", "expected 1-63"));
        }
        if r == 0 {
            return Err(invalid("TIERVAULT_SCRYPT_R", "must be at least 1"));
        }
        if p == 0 {
            return Err(invalid("TIERVAULT_SCRYPT_P", "must be at least 1"));
        }

        Ok(Self {
            master_key,
            kdf: KdfParams { log_n, r, p },
            audit_file_path: get("TIERVAULT_AUDIT_FILE").map(PathBuf::from),
            audit_hmac_key: get("TIERVAULT_AUDIT_HMAC_KEY").map(String::into_bytes),
            log_level: get("TIERVAULT_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
        })
    }

    /// Build the encryption engine with an in-memory key registry.
    #[must_use]
    pub fn build_encryption_engine(&self) -> EncryptionEngine {
        let master = self.master_key.clone().unwrap_or_else(|| {
            warn!("TIERVAULT_MASTER_KEY not set, using an ephemeral master key");
            MasterKey::generate()
        });
        EncryptionEngine::new(master, Arc::new(MemoryKeyStore::new()), self.kdf)
    }

    /// Assemble a [`SecretManager`] over an in-memory secret backend.
    pub async fn build_manager(&self) -> SecretManager {
        self.build_manager_with(Arc::new(MemorySecretBackend::new()))
            .await
    }

    /// Assemble a [`SecretManager`] over `backend`.
    pub async fn build_manager_with(&self, backend: Arc<dyn SecretBackend>) -> SecretManager {
        let hmac_key = self
            .audit_hmac_key
            .clone()
            .unwrap_or_else(|| crypto::random_bytes(32));
        let audit = AuditManager::new(hmac_key);
        if let Some(path) = &self.audit_file_path {
            info!(path = %path.display(), "file audit enabled");
            audit
                .add_backend(Arc::new(FileAuditBackend::new(path)))
                .await;
        }

        SecretManager::new(
            Arc::new(PolicyEngine::default()),
            Arc::new(self.build_encryption_engine()),
            backend,
            Arc::new(audit),
        )
    }
}

fn invalid(var: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_owned(),
        reason: reason.to_owned(),
    }
}

fn parse_or<T: std::str::FromStr>(
    get: impl Fn(&str) -> Option<String>,
    var: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| invalid(var, &format!("'{v}' is not a valid number"))),
    }
}
