//! Multi-level encryption engine.
//!
//! Callers hand in plaintext with a key id and a security level and get back
//! hex ciphertext plus the [`EncryptionMetadata`] needed to reverse it. The
//! algorithm is chosen from the level; the key is derived per payload with
//! scrypt from the master key, the key id, the level, and a fresh salt.
//!
//! The key registry behind [`KeyStore`] is bookkeeping only: version numbers,
//! status, and rotation schedules. Derivation never reads it, so rotating a
//! key never invalidates payloads encrypted under an earlier version.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::crypto::{
    self, CHECKSUM_HEX_LEN, DerivedKey, EncryptionAlgorithm, IV_LEN, KdfParams, KeyDerivation,
    MasterKey, SALT_LEN, TAG_LEN,
};
use crate::error::{CryptoError, StoreError};
use crate::metadata::SecurityLevel;

/// Everything needed to decrypt a payload except the master key.
///
/// Stored next to the ciphertext. Never stored next to plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMetadata {
    pub algorithm: EncryptionAlgorithm,
    pub key_id: String,
    pub key_version: u32,
    /// 16 bytes, hex.
    pub iv: String,
    /// 16 bytes, hex. Present iff the algorithm is AEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KeyDerivation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    pub encrypted_at: DateTime<Utc>,
    /// `SHA256(ciphertext || derived_key || iv)`, 64 hex chars.
    pub checksum: String,
}

impl EncryptionMetadata {
    /// Structural validation, without touching any key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Validation`] naming the first problem found.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.key_id.is_empty() {
            return Err(invalid("key id is empty"));
        }

        let iv = hex::decode(&self.iv).map_err(|_| invalid("iv is not valid hex"))?;
        if iv.len() != IV_LEN {
            return Err(invalid(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }

        if self.checksum.len() != CHECKSUM_HEX_LEN
            || !self.checksum.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(invalid("checksum must be 64 hex characters"));
        }

        if self.algorithm.is_aead() {
            let tag = self
                .tag
                .as_deref()
                .ok_or_else(|| invalid(format!("{} requires an authentication tag", self.algorithm)))?;
            let tag = hex::decode(tag).map_err(|_| invalid("tag is not valid hex"))?;
            if tag.len() != TAG_LEN {
                return Err(invalid(format!(
                    "tag must be {TAG_LEN} bytes, got {}",
                    tag.len()
                )));
            }
        }

        let salt = self
            .salt
            .as_deref()
            .ok_or_else(|| invalid("salt is missing"))?;
        if salt.is_empty() || hex::decode(salt).is_err() {
            return Err(invalid("salt is not valid hex"));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> CryptoError {
    CryptoError::Validation {
        reason: reason.into(),
    }
}

/// Hex ciphertext plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub encrypted: String,
    pub metadata: EncryptionMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUsage {
    Encryption,
    Decryption,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Deprecated,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationSchedule {
    pub interval_days: u32,
    pub next_rotation: DateTime<Utc>,
}

/// One version of a registered key. Holds no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionKey {
    pub id: String,
    pub version: u32,
    pub security_level: SecurityLevel,
    pub algorithm: EncryptionAlgorithm,
    /// In bits.
    pub key_size: u32,
    pub usage: KeyUsage,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub rotation_schedule: RotationSchedule,
}

impl EncryptionKey {
    /// A fresh active record at `version`.
    #[must_use]
    pub fn new(
        id: &str,
        version: u32,
        level: SecurityLevel,
        algorithm: EncryptionAlgorithm,
        now: DateTime<Utc>,
    ) -> Self {
        let interval_days = key_rotation_interval_days(level);
        let key_bits = crypto::derived_key_len(level).saturating_mul(8);
        Self {
            id: id.to_owned(),
            version,
            security_level: level,
            algorithm,
            key_size: u32::try_from(key_bits).unwrap_or(u32::MAX),
            usage: KeyUsage::Both,
            status: KeyStatus::Active,
            created_at: now,
            rotation_schedule: RotationSchedule {
                interval_days,
                next_rotation: now + Duration::days(i64::from(interval_days)),
            },
        }
    }
}

/// Key rotation cadence per level.
#[must_use]
pub fn key_rotation_interval_days(level: SecurityLevel) -> u32 {
    match level {
        SecurityLevel::Public => 365,
        SecurityLevel::Internal => 180,
        SecurityLevel::Confidential => 90,
        SecurityLevel::Secret => 30,
        SecurityLevel::TopSecret => 7,
    }
}

/// Registry of key records, every version kept.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Highest version registered for `key_id`.
    async fn latest(&self, key_id: &str) -> Result<Option<EncryptionKey>, StoreError>;

    /// Every version of `key_id`, oldest first.
    async fn versions(&self, key_id: &str) -> Result<Vec<EncryptionKey>, StoreError>;

    /// Insert a record, replacing any existing record with the same id and
    /// version.
    async fn put(&self, key: EncryptionKey) -> Result<(), StoreError>;

    /// Latest version of every key, ordered by id.
    async fn list(&self) -> Result<Vec<EncryptionKey>, StoreError>;
}

/// In-memory [`KeyStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyStore {
    keys: Arc<RwLock<BTreeMap<String, Vec<EncryptionKey>>>>,
}

impl MemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn latest(&self, key_id: &str) -> Result<Option<EncryptionKey>, StoreError> {
        let keys = self.keys.read().await;
        Ok(keys.get(key_id).and_then(|versions| versions.last().cloned()))
    }

    async fn versions(&self, key_id: &str) -> Result<Vec<EncryptionKey>, StoreError> {
        let keys = self.keys.read().await;
        Ok(keys.get(key_id).cloned().unwrap_or_default())
    }

    async fn put(&self, key: EncryptionKey) -> Result<(), StoreError> {
        let mut keys = self.keys.write().await;
        let versions = keys.entry(key.id.clone()).or_default();
        match versions.binary_search_by_key(&key.version, |k| k.version) {
            Ok(pos) => versions[pos] = key,
            Err(pos) => versions.insert(pos, key),
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<EncryptionKey>, StoreError> {
        let keys = self.keys.read().await;
        Ok(keys.values().filter_map(|v| v.last().cloned()).collect())
    }
}

/// Encrypts and decrypts payloads and keeps the key registry.
///
/// Cheap to share behind an `Arc`; all state lives in the master key and
/// the [`KeyStore`].
pub struct EncryptionEngine {
    master: Arc<MasterKey>,
    keys: Arc<dyn KeyStore>,
    kdf: KdfParams,
}

impl std::fmt::Debug for EncryptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionEngine")
            .field("master", &self.master)
            .field("kdf", &self.kdf)
            .finish_non_exhaustive()
    }
}

impl EncryptionEngine {
    #[must_use]
    pub fn new(master: MasterKey, keys: Arc<dyn KeyStore>, kdf: KdfParams) -> Self {
        Self {
            master: Arc::new(master),
            keys,
            kdf,
        }
    }

    /// Random master key, in-memory registry, default scrypt cost.
    #[must_use]
    pub fn with_random_master_key() -> Self {
        Self::new(
            MasterKey::generate(),
            Arc::new(MemoryKeyStore::new()),
            KdfParams::default(),
        )
    }

    #[must_use]
    pub fn kdf_params(&self) -> KdfParams {
        self.kdf
    }

    /// Encrypt `plaintext` for `key_id` at `level`.
    ///
    /// Registers `key_id` on first use. `aad` is bound for AEAD algorithms
    /// only.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Validation`] if `key_id` is empty.
    /// - [`CryptoError::KeyDerivation`] if scrypt fails.
    /// - [`CryptoError::Encryption`] if the cipher fails.
    /// - [`CryptoError::Store`] if the registry fails.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        key_id: &str,
        level: SecurityLevel,
        aad: Option<&[u8]>,
    ) -> Result<EncryptedPayload, CryptoError> {
        if key_id.is_empty() {
            return Err(invalid("key id is empty"));
        }

        let algorithm = EncryptionAlgorithm::for_level(level);
        let key_record = self.current_key(key_id, level).await?;

        let salt_hex = hex::encode(crypto::random_bytes(SALT_LEN));
        let iv = crypto::random_bytes(IV_LEN);
        let key = self.derive(key_id, level, &salt_hex).await?;

        let sealed = crypto::seal(algorithm, &key, &iv, aad, plaintext)?;
        let checksum = crypto::checksum(&sealed.ciphertext, &key, &iv);

        debug!(key_id, version = key_record.version, %algorithm, "payload encrypted");

        Ok(EncryptedPayload {
            encrypted: hex::encode(&sealed.ciphertext),
            metadata: EncryptionMetadata {
                algorithm,
                key_id: key_id.to_owned(),
                key_version: key_record.version,
                iv: hex::encode(&iv),
                tag: sealed.tag.map(hex::encode),
                kdf: Some(KeyDerivation::Scrypt),
                salt: Some(salt_hex),
                encrypted_at: Utc::now(),
                checksum,
            },
        })
    }

    /// Decrypt a payload produced by [`encrypt`](Self::encrypt).
    ///
    /// The checksum is verified in constant time before the cipher runs.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Validation`] if the metadata or ciphertext is
    ///   malformed.
    /// - [`CryptoError::Integrity`] if the checksum does not match.
    /// - [`CryptoError::Decryption`] if the cipher rejects the input.
    pub async fn decrypt(
        &self,
        ciphertext_hex: &str,
        metadata: &EncryptionMetadata,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        metadata.validate()?;

        let ciphertext =
            hex::decode(ciphertext_hex).map_err(|_| invalid("ciphertext is not valid hex"))?;
        let iv = hex::decode(&metadata.iv).map_err(|_| invalid("iv is not valid hex"))?;
        let tag = metadata
            .tag
            .as_deref()
            .map(hex::decode)
            .transpose()
            .map_err(|_| invalid("tag is not valid hex"))?;
        let salt_hex = metadata.salt.as_deref().unwrap_or_default();

        let level = metadata.algorithm.security_level();
        let key = self.derive(&metadata.key_id, level, salt_hex).await?;

        let computed = crypto::checksum(&ciphertext, &key, &iv);
        if !crypto::checksum_matches(&computed, &metadata.checksum) {
            warn!(
                key_id = %metadata.key_id,
                version = metadata.key_version,
                "integrity verification failed"
            );
            return Err(CryptoError::Integrity {
                key_id: metadata.key_id.clone(),
            });
        }

        let plaintext = crypto::open(
            metadata.algorithm,
            &key,
            &iv,
            tag.as_deref(),
            aad,
            &ciphertext,
        )?;

        debug!(key_id = %metadata.key_id, version = metadata.key_version, "payload decrypted");
        Ok(plaintext)
    }

    /// Structural validation of stored metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Validation`] with the reason.
    pub fn validate_metadata(&self, metadata: &EncryptionMetadata) -> Result<(), CryptoError> {
        metadata.validate()
    }

    /// Register version 1 of a new key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyExists`] if `key_id` is already registered.
    pub async fn generate_key(
        &self,
        key_id: &str,
        level: SecurityLevel,
        algorithm: Option<EncryptionAlgorithm>,
    ) -> Result<EncryptionKey, CryptoError> {
        if key_id.is_empty() {
            return Err(invalid("key id is empty"));
        }
        if self.keys.latest(key_id).await?.is_some() {
            return Err(CryptoError::KeyExists {
                key_id: key_id.to_owned(),
            });
        }

        let algorithm = algorithm.unwrap_or_else(|| EncryptionAlgorithm::for_level(level));
        let record = EncryptionKey::new(key_id, 1, level, algorithm, Utc::now());
        self.keys.put(record.clone()).await?;

        info!(key_id, level = %level, %algorithm, "encryption key generated");
        Ok(record)
    }

    /// Import an externally created record as-is.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Validation`] for an empty id or version 0.
    pub async fn register_key(&self, key: EncryptionKey) -> Result<(), CryptoError> {
        if key.id.is_empty() || key.version == 0 {
            return Err(invalid("key record needs an id and a version >= 1"));
        }
        info!(key_id = %key.id, version = key.version, "encryption key registered");
        self.keys.put(key).await?;
        Ok(())
    }

    /// Latest version of `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Store`] if the registry fails.
    pub async fn get_key(&self, key_id: &str) -> Result<Option<EncryptionKey>, CryptoError> {
        Ok(self.keys.latest(key_id).await?)
    }

    /// Latest version of every registered key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Store`] if the registry fails.
    pub async fn list_keys(&self) -> Result<Vec<EncryptionKey>, CryptoError> {
        Ok(self.keys.list().await?)
    }

    /// Full version history of `key_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Store`] if the registry fails.
    pub async fn key_versions(&self, key_id: &str) -> Result<Vec<EncryptionKey>, CryptoError> {
        Ok(self.keys.versions(key_id).await?)
    }

    /// Deprecate the current version and register `version + 1` as active.
    ///
    /// Existing payloads are not re-encrypted.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyNotFound`] for an unknown key id.
    pub async fn rotate_key(&self, key_id: &str) -> Result<EncryptionKey, CryptoError> {
        let mut current = self
            .keys
            .latest(key_id)
            .await?
            .ok_or_else(|| CryptoError::KeyNotFound {
                key_id: key_id.to_owned(),
            })?;

        let next = EncryptionKey::new(
            key_id,
            current.version.saturating_add(1),
            current.security_level,
            current.algorithm,
            Utc::now(),
        );

        current.status = KeyStatus::Deprecated;
        self.keys.put(current).await?;
        self.keys.put(next.clone()).await?;

        info!(key_id, version = next.version, "encryption key rotated");
        Ok(next)
    }

    async fn current_key(
        &self,
        key_id: &str,
        level: SecurityLevel,
    ) -> Result<EncryptionKey, CryptoError> {
        if let Some(key) = self.keys.latest(key_id).await? {
            return Ok(key);
        }
        match self.generate_key(key_id, level, None).await {
            Err(CryptoError::KeyExists { .. }) => {
                // Lost a registration race; the winner's record is current.
                self.keys
                    .latest(key_id)
                    .await?
                    .ok_or_else(|| CryptoError::KeyNotFound {
                        key_id: key_id.to_owned(),
                    })
            }
            other => other,
        }
    }

    async fn derive(
        &self,
        key_id: &str,
        level: SecurityLevel,
        salt_hex: &str,
    ) -> Result<DerivedKey, CryptoError> {
        let master = Arc::clone(&self.master);
        let params = self.kdf;
        let owned_id = key_id.to_owned();
        let salt_hex = salt_hex.to_owned();

        tokio::task::spawn_blocking(move || {
            crypto::derive_key(&master, &owned_id, level, &salt_hex, params)
        })
        .await
        .map_err(|e| CryptoError::KeyDerivation {
            key_id: key_id.to_owned(),
            reason: format!("derivation task failed: {e}"),
        })?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn engine() -> EncryptionEngine {
        EncryptionEngine::new(
            MasterKey::generate(),
            Arc::new(MemoryKeyStore::new()),
            KdfParams {
                log_n: 4,
                r: 8,
                p: 1,
            },
        )
    }

    fn flip_hex(s: &str, index: usize) -> String {
        let mut chars: Vec<char> = s.chars().collect();
        chars[index] = if chars[index] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    #[tokio::test]
    async fn roundtrip_every_level() {
        let engine = engine();
        let plaintext = "pässwörd 🔑 with unicode";
        for level in SecurityLevel::ALL {
            let payload = engine
                .encrypt(plaintext.as_bytes(), "roundtrip", level, None)
                .await
                .unwrap();
            assert_eq!(payload.metadata.algorithm, EncryptionAlgorithm::for_level(level));
            let decrypted = engine
                .decrypt(&payload.encrypted, &payload.metadata, None)
                .await
                .unwrap();
            assert_eq!(decrypted, plaintext.as_bytes());
        }
    }

    #[tokio::test]
    async fn empty_plaintext_roundtrip() {
        let engine = engine();
        for level in SecurityLevel::ALL {
            let payload = engine.encrypt(b"", "empty", level, None).await.unwrap();
            let decrypted = engine
                .decrypt(&payload.encrypted, &payload.metadata, None)
                .await
                .unwrap();
            assert!(decrypted.is_empty());
        }
    }

    #[tokio::test]
    async fn public_payload_shape_and_last_digit_tamper() {
        let engine = engine();
        let payload = engine
            .encrypt(b"hello-secret", "k1", SecurityLevel::Public, None)
            .await
            .unwrap();
        let meta = &payload.metadata;
        assert_eq!(meta.algorithm, EncryptionAlgorithm::Aes128Cbc);
        assert!(meta.tag.is_none());
        assert_eq!(meta.iv.len(), 32);
        assert_eq!(meta.checksum.len(), 64);
        assert_eq!(meta.kdf, Some(KeyDerivation::Scrypt));

        let decrypted = engine.decrypt(&payload.encrypted, meta, None).await.unwrap();
        assert_eq!(decrypted, b"hello-secret");

        let last = payload.encrypted.len() - 1;
        let tampered = flip_hex(&payload.encrypted, last);
        let result = engine.decrypt(&tampered, meta, None).await;
        assert!(matches!(result, Err(CryptoError::Integrity { .. })));
    }

    #[tokio::test]
    async fn any_ciphertext_digit_tamper_is_integrity_error() {
        let engine = engine();
        let payload = engine
            .encrypt(b"tamper me", "k", SecurityLevel::Secret, None)
            .await
            .unwrap();
        for index in [0, payload.encrypted.len() / 2, payload.encrypted.len() - 1] {
            let tampered = flip_hex(&payload.encrypted, index);
            let result = engine.decrypt(&tampered, &payload.metadata, None).await;
            assert!(matches!(result, Err(CryptoError::Integrity { .. })));
        }
    }

    #[tokio::test]
    async fn checksum_tamper_is_integrity_error() {
        let engine = engine();
        let payload = engine
            .encrypt(b"x", "k", SecurityLevel::TopSecret, None)
            .await
            .unwrap();
        let mut meta = payload.metadata.clone();
        meta.checksum = flip_hex(&meta.checksum, 10);
        let result = engine.decrypt(&payload.encrypted, &meta, None).await;
        assert!(matches!(result, Err(CryptoError::Integrity { .. })));
    }

    #[tokio::test]
    async fn iv_tamper_is_integrity_error() {
        let engine = engine();
        let payload = engine
            .encrypt(b"x", "k", SecurityLevel::TopSecret, None)
            .await
            .unwrap();
        let mut meta = payload.metadata.clone();
        meta.iv = flip_hex(&meta.iv, 31);
        let result = engine.decrypt(&payload.encrypted, &meta, None).await;
        assert!(matches!(result, Err(CryptoError::Integrity { .. })));
    }

    #[tokio::test]
    async fn tag_tamper_is_decryption_error() {
        let engine = engine();
        let payload = engine
            .encrypt(b"x", "k", SecurityLevel::Confidential, None)
            .await
            .unwrap();
        let mut meta = payload.metadata.clone();
        meta.tag = meta.tag.map(|t| flip_hex(&t, 0));
        let result = engine.decrypt(&payload.encrypted, &meta, None).await;
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[tokio::test]
    async fn aad_must_match() {
        let engine = engine();
        let payload = engine
            .encrypt(b"x", "k", SecurityLevel::Secret, Some(b"secret-1"))
            .await
            .unwrap();
        let ok = engine
            .decrypt(&payload.encrypted, &payload.metadata, Some(b"secret-1"))
            .await;
        assert!(ok.is_ok());
        let bad = engine
            .decrypt(&payload.encrypted, &payload.metadata, Some(b"secret-2"))
            .await;
        assert!(matches!(bad, Err(CryptoError::Decryption { .. })));
    }

    #[tokio::test]
    async fn wrong_master_key_fails_integrity() {
        let a = engine();
        let b = engine();
        let payload = a
            .encrypt(b"x", "k", SecurityLevel::Internal, None)
            .await
            .unwrap();
        let result = b.decrypt(&payload.encrypted, &payload.metadata, None).await;
        assert!(matches!(result, Err(CryptoError::Integrity { .. })));
    }

    #[tokio::test]
    async fn fresh_iv_and_salt_per_call() {
        let engine = engine();
        let a = engine.encrypt(b"same", "k", SecurityLevel::Secret, None).await.unwrap();
        let b = engine.encrypt(b"same", "k", SecurityLevel::Secret, None).await.unwrap();
        assert_ne!(a.metadata.iv, b.metadata.iv);
        assert_ne!(a.metadata.salt, b.metadata.salt);
        assert_ne!(a.encrypted, b.encrypted);
    }

    #[tokio::test]
    async fn encrypt_registers_key_on_first_use() {
        let engine = engine();
        assert!(engine.get_key("fresh").await.unwrap().is_none());
        let payload = engine
            .encrypt(b"x", "fresh", SecurityLevel::Confidential, None)
            .await
            .unwrap();
        assert_eq!(payload.metadata.key_version, 1);
        let key = engine.get_key("fresh").await.unwrap().unwrap();
        assert_eq!(key.security_level, SecurityLevel::Confidential);
        assert_eq!(key.key_size, 256);
        assert_eq!(key.rotation_schedule.interval_days, 90);
    }

    #[tokio::test]
    async fn generate_key_rejects_duplicates() {
        let engine = engine();
        let key = engine
            .generate_key("dup", SecurityLevel::Public, None)
            .await
            .unwrap();
        assert_eq!(key.version, 1);
        assert_eq!(key.key_size, 128);
        assert_eq!(key.rotation_schedule.interval_days, 365);
        let again = engine.generate_key("dup", SecurityLevel::Public, None).await;
        assert!(matches!(again, Err(CryptoError::KeyExists { .. })));
    }

    #[tokio::test]
    async fn rotate_key_keeps_history() {
        let engine = engine();
        let before = engine
            .encrypt(b"old", "rot", SecurityLevel::Secret, None)
            .await
            .unwrap();

        let rotated = engine.rotate_key("rot").await.unwrap();
        assert_eq!(rotated.version, 2);
        assert_eq!(rotated.status, KeyStatus::Active);

        let versions = engine.key_versions("rot").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].status, KeyStatus::Deprecated);
        assert_eq!(versions[1].status, KeyStatus::Active);

        let after = engine
            .encrypt(b"new", "rot", SecurityLevel::Secret, None)
            .await
            .unwrap();
        assert_eq!(after.metadata.key_version, 2);

        // Old payloads still decrypt after rotation.
        let old = engine
            .decrypt(&before.encrypted, &before.metadata, None)
            .await
            .unwrap();
        assert_eq!(old, b"old");
    }

    #[tokio::test]
    async fn rotate_unknown_key_is_not_found() {
        let engine = engine();
        let result = engine.rotate_key("missing").await;
        assert!(matches!(result, Err(CryptoError::KeyNotFound { .. })));
    }

    #[tokio::test]
    async fn list_keys_returns_latest_versions() {
        let engine = engine();
        engine.generate_key("a", SecurityLevel::Public, None).await.unwrap();
        engine.generate_key("b", SecurityLevel::Secret, None).await.unwrap();
        engine.rotate_key("b").await.unwrap();
        let keys = engine.list_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].id, "a");
        assert_eq!(keys[1].version, 2);
    }

    #[tokio::test]
    async fn register_key_imports_record() {
        let engine = engine();
        let record = EncryptionKey::new(
            "imported",
            3,
            SecurityLevel::Internal,
            EncryptionAlgorithm::Aes256Cbc,
            Utc::now(),
        );
        engine.register_key(record).await.unwrap();
        assert_eq!(engine.get_key("imported").await.unwrap().unwrap().version, 3);

        let bad = EncryptionKey::new("", 1, SecurityLevel::Public, EncryptionAlgorithm::Aes128Cbc, Utc::now());
        assert!(engine.register_key(bad).await.is_err());
    }

    #[tokio::test]
    async fn validate_metadata_reasons() {
        let engine = engine();
        let payload = engine
            .encrypt(b"x", "v", SecurityLevel::Secret, None)
            .await
            .unwrap();
        assert!(engine.validate_metadata(&payload.metadata).is_ok());

        let mut short_iv = payload.metadata.clone();
        short_iv.iv = "abcd".to_owned();
        assert!(matches!(
            engine.validate_metadata(&short_iv),
            Err(CryptoError::Validation { .. })
        ));

        let mut no_tag = payload.metadata.clone();
        no_tag.tag = None;
        assert!(engine.validate_metadata(&no_tag).is_err());

        let mut no_salt = payload.metadata.clone();
        no_salt.salt = None;
        assert!(engine.validate_metadata(&no_salt).is_err());

        let mut bad_checksum = payload.metadata.clone();
        bad_checksum.checksum = "abc".to_owned();
        assert!(engine.validate_metadata(&bad_checksum).is_err());

        let mut no_key = payload.metadata;
        no_key.key_id = String::new();
        assert!(engine.validate_metadata(&no_key).is_err());
    }

    #[tokio::test]
    async fn metadata_serializes_camel_case() {
        let engine = engine();
        let payload = engine
            .encrypt(b"x", "k", SecurityLevel::Public, None)
            .await
            .unwrap();
        let json = serde_json::to_value(&payload.metadata).unwrap();
        assert_eq!(json["algorithm"], "aes-128-cbc");
        assert_eq!(json["keyId"], "k");
        assert_eq!(json["keyVersion"], 1);
        assert_eq!(json["kdf"], "scrypt");
        assert!(json.get("tag").is_none());
        assert!(json.get("encryptedAt").is_some());
    }

    #[tokio::test]
    async fn derivation_respects_timeout() {
        let engine = engine();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            engine.encrypt(b"x", "t", SecurityLevel::Internal, None),
        )
        .await;
        assert!(result.unwrap().is_ok());
    }
}
