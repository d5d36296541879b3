//! Access audit trail for `tiervault`.
//!
//! Every secret access attempt produces an [`AccessAuditEntry`], granted or
//! not, before any plaintext is returned. Entries fan out to every
//! registered [`AuditBackend`]. If all backends fail, the operation aborts
//! (fail-closed).
//!
//! Session identifiers are HMAC'd before they reach a backend, so logs can be
//! correlated without exposing the raw value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::AuditError;
use crate::policy::AccessContext;

type HmacSha256 = Hmac<Sha256>;

/// Orchestrator operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOperation {
    Create,
    Read,
    Update,
    Rotate,
    Archive,
    List,
}

/// A single audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessAuditEntry {
    /// Unique entry ID.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub secret_id: String,
    pub operation: AuditOperation,
    pub user_id: String,
    pub source_ip: String,
    pub granted: bool,
    /// Decision reason, verbatim.
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// HMAC-SHA256 of the session id once it has passed through
    /// [`AuditManager::log`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Set when decryption hit an integrity failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tamper_detected: bool,
}

impl AccessAuditEntry {
    /// Entry for `operation` on `secret_id`, stamped now.
    #[must_use]
    pub fn new(
        secret_id: &str,
        operation: AuditOperation,
        context: &AccessContext,
        granted: bool,
        reason: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            secret_id: secret_id.to_owned(),
            operation,
            user_id: context.user_id.clone(),
            source_ip: context.source_ip.clone(),
            granted,
            reason: reason.to_owned(),
            user_agent: context.user_agent.clone(),
            device_id: context.device_id.clone(),
            session_id: context.session_id.clone(),
            tamper_detected: false,
        }
    }

    #[must_use]
    pub fn tampered(mut self) -> Self {
        self.tamper_detected = true;
        self
    }
}

/// Trait for audit log backends.
///
/// Implementations must be safe to share across async tasks.
#[async_trait::async_trait]
pub trait AuditBackend: Send + Sync {
    /// The backend's name (for error reporting).
    fn name(&self) -> &str;

    /// Write an audit entry. Must not silently drop entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be persisted.
    async fn log(&self, entry: &AccessAuditEntry) -> Result<(), AuditError>;
}

/// Fans entries out to multiple backends with fail-closed semantics.
///
/// If at least one backend succeeds, the operation proceeds. If all fail,
/// it is aborted.
pub struct AuditManager {
    backends: RwLock<Vec<Arc<dyn AuditBackend>>>,
    hmac_key: Vec<u8>,
}

impl AuditManager {
    /// Create a new audit manager with the given HMAC key.
    #[must_use]
    pub fn new(hmac_key: Vec<u8>) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            hmac_key,
        }
    }

    /// Register an audit backend.
    pub async fn add_backend(&self, backend: Arc<dyn AuditBackend>) {
        self.backends.write().await.push(backend);
    }

    /// HMAC sensitive fields and log the entry to all backends.
    ///
    /// With no backends configured this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AllBackendsFailed`] if every backend fails.
    pub async fn log(&self, mut entry: AccessAuditEntry) -> Result<(), AuditError> {
        if let Some(session) = entry.session_id.take() {
            entry.session_id = Some(self.hmac_field(&session)?);
        }

        let backends = self.backends.read().await;
        if backends.is_empty() {
            return Ok(());
        }

        let mut any_success = false;
        for backend in backends.iter() {
            match backend.log(&entry).await {
                Ok(()) => any_success = true,
                Err(e) => {
                    warn!(
                        backend = backend.name(),
                        error = %e,
                        "audit backend failed"
                    );
                }
            }
        }

        if any_success {
            Ok(())
        } else {
            Err(AuditError::AllBackendsFailed)
        }
    }

    /// Hex HMAC-SHA256 of `value` under this manager's key.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Serialization`] if the key is rejected.
    pub fn hmac_field(&self, value: &str) -> Result<String, AuditError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.hmac_key).map_err(|e| AuditError::Serialization {
                reason: format!("invalid audit hmac key: {e}"),
            })?;
        mac.update(value.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check whether any audit backends are configured.
    pub async fn has_backends(&self) -> bool {
        !self.backends.read().await.is_empty()
    }
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager")
            .field("hmac_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Keeps entries in memory. For tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditBackend {
    entries: Arc<RwLock<Vec<AccessAuditEntry>>>,
}

impl MemoryAuditBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    pub async fn entries(&self) -> Vec<AccessAuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait::async_trait]
impl AuditBackend for MemoryAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "memory"
    }

    async fn log(&self, entry: &AccessAuditEntry) -> Result<(), AuditError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }
}
