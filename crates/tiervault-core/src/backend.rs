//! Persistence boundary for protected secrets.
//!
//! The core never owns storage. It hands ciphertext and a [`SecretRecord`]
//! to a [`SecretBackend`] and reads them back. Backend failures surface to
//! the caller unchanged; nothing here retries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::encryption::EncryptionMetadata;
use crate::error::BackendError;
use crate::metadata::SecretMetadata;

/// Lifecycle state of a stored secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretStatus {
    #[default]
    Active,
    Suspended,
    Deprecated,
    Compromised,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub current: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_rotation: Option<DateTime<Utc>>,
}

impl VersionInfo {
    /// Version 1 of a new secret.
    #[must_use]
    pub fn initial(now: DateTime<Utc>, next_rotation: Option<DateTime<Utc>>) -> Self {
        Self {
            current: 1,
            total: 1,
            last_rotated: Some(now),
            next_rotation,
        }
    }

    /// Record a new value.
    pub fn bump(&mut self, now: DateTime<Utc>) {
        self.current = self.current.saturating_add(1);
        self.total = self.total.saturating_add(1);
        self.last_rotated = Some(now);
    }
}

/// Read counters for one secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessStats {
    pub total_access: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access: Option<DateTime<Utc>>,
    pub unique_users: u64,
    pub failed_attempts: u64,
    /// Distinct user ids behind `unique_users`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub accessors: BTreeSet<String>,
}

impl AccessStats {
    pub fn record_access(&mut self, user_id: &str, now: DateTime<Utc>) {
        self.total_access = self.total_access.saturating_add(1);
        self.last_access = Some(now);
        if self.accessors.insert(user_id.to_owned()) {
            self.unique_users = u64::try_from(self.accessors.len()).unwrap_or(u64::MAX);
        }
    }

    pub fn record_failure(&mut self) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
    }
}

/// Users and roles admitted to a secret on top of its ACL.
///
/// Any non-empty grant turns ACL enforcement on, so a secret created with
/// explicit initial access is closed to everyone else. Once `expires_at`
/// passes, the grant admits nobody.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub users: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub roles: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessGrant {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.roles.is_empty()
    }

    /// Whether the grant still holds at `at`.
    #[must_use]
    pub fn is_live(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expiry| at < expiry)
    }

    /// Whether `user_id` or one of `roles` is admitted at `at`.
    #[must_use]
    pub fn admits(&self, user_id: &str, roles: &[String], at: DateTime<Utc>) -> bool {
        self.is_live(at)
            && (self.users.contains(user_id) || roles.iter().any(|r| self.roles.contains(r)))
    }
}

/// Everything stored about a secret except its ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub metadata: SecretMetadata,
    pub encryption: EncryptionMetadata,
    pub version: VersionInfo,
    #[serde(default)]
    pub access_stats: AccessStats,
    #[serde(default)]
    pub status: SecretStatus,
    #[serde(default, skip_serializing_if = "AccessGrant::is_empty")]
    pub access_grant: AccessGrant,
    /// `SHA256(ciphertext_hex || encryption.checksum)`.
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecretRecord {
    /// Record-level checksum binding the stored ciphertext to its metadata.
    #[must_use]
    pub fn compute_checksum(ciphertext_hex: &str, encryption: &EncryptionMetadata) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ciphertext_hex.as_bytes());
        hasher.update(encryption.checksum.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Storage for secret records and ciphertext.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Write ciphertext and record together, replacing any previous value.
    async fn store(
        &self,
        secret_id: &str,
        ciphertext_hex: &str,
        record: &SecretRecord,
    ) -> Result<(), BackendError>;

    /// Record only, never the ciphertext.
    async fn fetch_metadata(&self, secret_id: &str) -> Result<SecretRecord, BackendError>;

    async fn fetch_ciphertext(&self, secret_id: &str) -> Result<String, BackendError>;

    /// Replace the record of an existing secret, leaving ciphertext alone.
    async fn update_metadata(&self, record: &SecretRecord) -> Result<(), BackendError>;

    /// Every record, ordered by id.
    async fn list_metadata(&self) -> Result<Vec<SecretRecord>, BackendError>;

    /// Whether a secret with this id exists.
    async fn exists(&self, secret_id: &str) -> Result<bool, BackendError> {
        match self.fetch_metadata(secret_id).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredSecret {
    ciphertext: String,
    record: SecretRecord,
}

/// In-memory [`SecretBackend`], ordered by secret id.
#[derive(Debug, Default, Clone)]
pub struct MemorySecretBackend {
    secrets: Arc<RwLock<BTreeMap<String, StoredSecret>>>,
}

impl MemorySecretBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite stored ciphertext directly. Used to simulate tampering.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] for an unknown id.
    pub async fn overwrite_ciphertext(
        &self,
        secret_id: &str,
        ciphertext_hex: &str,
    ) -> Result<(), BackendError> {
        let mut secrets = self.secrets.write().await;
        let stored = secrets
            .get_mut(secret_id)
            .ok_or_else(|| not_found(secret_id))?;
        ciphertext_hex.clone_into(&mut stored.ciphertext);
        Ok(())
    }
}

fn not_found(secret_id: &str) -> BackendError {
    BackendError::NotFound {
        secret_id: secret_id.to_owned(),
    }
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    async fn store(
        &self,
        secret_id: &str,
        ciphertext_hex: &str,
        record: &SecretRecord,
    ) -> Result<(), BackendError> {
        self.secrets.write().await.insert(
            secret_id.to_owned(),
            StoredSecret {
                ciphertext: ciphertext_hex.to_owned(),
                record: record.clone(),
            },
        );
        Ok(())
    }

    async fn fetch_metadata(&self, secret_id: &str) -> Result<SecretRecord, BackendError> {
        self.secrets
            .read()
            .await
            .get(secret_id)
            .map(|s| s.record.clone())
            .ok_or_else(|| not_found(secret_id))
    }

    async fn fetch_ciphertext(&self, secret_id: &str) -> Result<String, BackendError> {
        self.secrets
            .read()
            .await
            .get(secret_id)
            .map(|s| s.ciphertext.clone())
            .ok_or_else(|| not_found(secret_id))
    }

    async fn update_metadata(&self, record: &SecretRecord) -> Result<(), BackendError> {
        let mut secrets = self.secrets.write().await;
        let stored = secrets
            .get_mut(&record.id)
            .ok_or_else(|| not_found(&record.id))?;
        stored.record = record.clone();
        Ok(())
    }

    async fn list_metadata(&self) -> Result<Vec<SecretRecord>, BackendError> {
        Ok(self
            .secrets
            .read()
            .await
            .values()
            .map(|s| s.record.clone())
            .collect())
    }
}
