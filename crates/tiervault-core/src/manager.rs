//! Secret lifecycle orchestration.
//!
//! [`SecretManager`] ties the classifier, the policy engine and the
//! encryption engine to a [`SecretBackend`] and an [`AuditManager`]. Every
//! read attempt is audited before any plaintext leaves the manager, and a
//! failed audit write aborts the operation.
//!
//! A secret's id is its name. The same string is the encryption key id and
//! is bound as associated data on AEAD payloads.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::audit::{AccessAuditEntry, AuditManager, AuditOperation};
use crate::backend::{
    AccessGrant, AccessStats, SecretBackend, SecretRecord, SecretStatus, VersionInfo,
};
use crate::classifier::{self, ClassificationHints};
use crate::condition;
use crate::crypto;
use crate::encryption::{EncryptionEngine, EncryptionKey};
use crate::error::{BackendError, CryptoError, SecretError};
use crate::generator;
use crate::metadata::{AccessWindow, BusinessImpact, SecretCategory, SecretMetadata, SecurityLevel};
use crate::policy::{AccessContext, AccessDecision, AccessPolicy, PolicyEngine};

/// Rotation interval used when a rotation policy has none.
const DEFAULT_ROTATION_DAYS: u32 = 90;

/// Input to [`SecretManager::create`].
#[derive(Clone, Default)]
pub struct CreateSecretRequest {
    pub name: String,
    pub value: Zeroizing<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub hints: Option<ClassificationHints>,
    pub expires_at: Option<DateTime<Utc>>,
    pub initial_access: Option<InitialAccess>,
}

impl CreateSecretRequest {
    #[must_use]
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_owned(),
            value: Zeroizing::new(value.to_owned()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_hints(mut self, hints: ClassificationHints) -> Self {
        self.hints = Some(hints);
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_owned());
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| (*t).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn with_initial_access(mut self, access: InitialAccess) -> Self {
        self.initial_access = Some(access);
        self
    }
}

impl std::fmt::Debug for CreateSecretRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateSecretRequest")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("hints", &self.hints)
            .field("initial_access", &self.initial_access)
            .finish_non_exhaustive()
    }
}

/// Users and roles admitted when a secret is created. Stored as the
/// record's [`AccessGrant`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialAccess {
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    /// Hours until the grant lapses. Permanent when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_duration: Option<u32>,
}

impl InitialAccess {
    fn into_grant(self, now: DateTime<Utc>) -> AccessGrant {
        AccessGrant {
            users: self.allowed_users.into_iter().collect(),
            roles: self.allowed_roles.into_iter().collect(),
            expires_at: self
                .access_duration
                .map(|hours| now + Duration::hours(i64::from(hours))),
        }
    }
}

/// Edits to a secret's [`AccessGrant`]. Additions apply before removals.
/// The grant's expiry is left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlUpdate {
    #[serde(default)]
    pub add_users: Vec<String>,
    #[serde(default)]
    pub remove_users: Vec<String>,
    #[serde(default)]
    pub add_roles: Vec<String>,
    #[serde(default)]
    pub remove_roles: Vec<String>,
}

impl AccessControlUpdate {
    pub fn apply(&self, grant: &mut AccessGrant) {
        grant.users.extend(self.add_users.iter().cloned());
        grant.roles.extend(self.add_roles.iter().cloned());
        for user in &self.remove_users {
            grant.users.remove(user);
        }
        for role in &self.remove_roles {
            grant.roles.remove(role);
        }
    }
}

/// Input to [`SecretManager::update`]. Unset fields are left alone.
#[derive(Clone, Default)]
pub struct UpdateSecretRequest {
    pub value: Option<Zeroizing<String>>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub status: Option<SecretStatus>,
    pub hints: Option<ClassificationHints>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Rotate the encryption key and re-encrypt even if nothing else
    /// changed.
    pub force_rotation: bool,
    pub access_control: Option<AccessControlUpdate>,
}

impl UpdateSecretRequest {
    #[must_use]
    pub fn with_value(mut self, value: &str) -> Self {
        self.value = Some(Zeroizing::new(value.to_owned()));
        self
    }

    #[must_use]
    pub fn with_hints(mut self, hints: ClassificationHints) -> Self {
        self.hints = Some(hints);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: SecretStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_forced_rotation(mut self) -> Self {
        self.force_rotation = true;
        self
    }

    #[must_use]
    pub fn with_access_control(mut self, access_control: AccessControlUpdate) -> Self {
        self.access_control = Some(access_control);
        self
    }
}

impl std::fmt::Debug for UpdateSecretRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSecretRequest")
            .field("value", &self.value.as_ref().map(|_| "[REDACTED]"))
            .field("status", &self.status)
            .field("hints", &self.hints)
            .field("force_rotation", &self.force_rotation)
            .field("access_control", &self.access_control)
            .finish_non_exhaustive()
    }
}

/// A record returned by [`SecretManager::get`], with the plaintext when it
/// was asked for.
#[derive(Clone)]
pub struct RevealedSecret {
    pub record: SecretRecord,
    value: Option<Zeroizing<String>>,
}

impl RevealedSecret {
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref().map(String::as_str)
    }
}

impl std::fmt::Debug for RevealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevealedSecret")
            .field("record", &self.record)
            .field("value", &self.value.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Rotation state a listing can be narrowed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStatus {
    Enabled,
    Disabled,
    /// Enabled, with `nextRotation` at or before the listing time.
    Overdue,
}

/// Listing filter. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<SecurityLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<SecretCategory>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owners: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<SecretStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_risk: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_risk: Option<u8>,
    /// Secrets carrying any of these tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_impacts: Option<Vec<BusinessImpact>>,
    /// Secrets subject to every one of these standards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance_standards: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_status: Option<RotationStatus>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude_compromised: bool,
    /// Never-read secrets fail both bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_before: Option<DateTime<Utc>>,
    /// 1-based. Ignored without `page_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

impl SecretFilter {
    /// [`matches_at`](Self::matches_at) the current time.
    #[must_use]
    pub fn matches(&self, record: &SecretRecord) -> bool {
        self.matches_at(record, Utc::now())
    }

    /// Whether `record` passes every set criterion, judging rotation
    /// deadlines at `now`. Pagination is not considered.
    #[must_use]
    pub fn matches_at(&self, record: &SecretRecord, now: DateTime<Utc>) -> bool {
        let meta = &record.metadata;
        let last_access = record.access_stats.last_access;
        let risk = meta.risk_score.unwrap_or(0);

        self.levels
            .as_ref()
            .is_none_or(|l| l.contains(&meta.security_level))
            && self
                .categories
                .as_ref()
                .is_none_or(|c| c.contains(&meta.category))
            && self.owners.as_ref().is_none_or(|o| o.contains(&meta.owner_id))
            && self
                .statuses
                .as_ref()
                .is_none_or(|s| s.contains(&record.status))
            && self.min_risk.is_none_or(|min| risk >= min)
            && self.max_risk.is_none_or(|max| risk <= max)
            && self
                .tags
                .as_ref()
                .is_none_or(|tags| tags.iter().any(|t| record.tags.contains(t)))
            && self
                .business_impacts
                .as_ref()
                .is_none_or(|b| meta.business_impact.is_some_and(|i| b.contains(&i)))
            && self.compliance_standards.as_ref().is_none_or(|wanted| {
                let held = meta.compliance.standards.as_deref().unwrap_or_default();
                wanted.iter().all(|w| held.contains(w))
            })
            && self
                .rotation_status
                .is_none_or(|status| rotation_status_matches(status, record, now))
            && !(self.exclude_compromised && record.status == SecretStatus::Compromised)
            && self
                .last_access_after
                .is_none_or(|after| last_access.is_some_and(|at| at >= after))
            && self
                .last_access_before
                .is_none_or(|before| last_access.is_some_and(|at| at <= before))
    }
}

fn rotation_status_matches(status: RotationStatus, record: &SecretRecord, now: DateTime<Utc>) -> bool {
    let enabled = record.metadata.rotation_policy.enabled;
    match status {
        RotationStatus::Enabled => enabled,
        RotationStatus::Disabled => !enabled,
        RotationStatus::Overdue => {
            enabled && record.version.next_rotation.is_some_and(|due| due <= now)
        }
    }
}

/// One page of [`SecretManager::list`] results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretPage {
    pub secrets: Vec<SecretRecord>,
    /// Visible secrets before pagination.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Orchestrates secret creation, reads, updates, rotation and archival.
pub struct SecretManager {
    policy: Arc<PolicyEngine>,
    encryption: Arc<EncryptionEngine>,
    backend: Arc<dyn SecretBackend>,
    audit: Arc<AuditManager>,
}

impl std::fmt::Debug for SecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretManager")
            .field("encryption", &self.encryption)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

impl SecretManager {
    #[must_use]
    pub fn new(
        policy: Arc<PolicyEngine>,
        encryption: Arc<EncryptionEngine>,
        backend: Arc<dyn SecretBackend>,
        audit: Arc<AuditManager>,
    ) -> Self {
        Self {
            policy,
            encryption,
            backend,
            audit,
        }
    }

    #[must_use]
    pub fn policy_engine(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    #[must_use]
    pub fn encryption_engine(&self) -> &Arc<EncryptionEngine> {
        &self.encryption
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<AuditManager> {
        &self.audit
    }

    /// Classify, encrypt and store a new secret.
    ///
    /// Creation is not policy-gated; `context` identifies the creator in the
    /// audit trail.
    ///
    /// # Errors
    ///
    /// - [`SecretError::Validation`] for an empty name or an existing secret.
    /// - [`SecretError::Crypto`], [`SecretError::Backend`] or
    ///   [`SecretError::Audit`] when the respective boundary fails.
    pub async fn create(
        &self,
        request: CreateSecretRequest,
        context: &AccessContext,
    ) -> Result<SecretRecord, SecretError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(invalid("secret name is empty"));
        }
        if self.backend.exists(name).await? {
            return Err(invalid(&format!("secret '{name}' already exists")));
        }

        let metadata = classifier::classify(name, &request.value, request.hints.as_ref());
        let payload = self
            .encryption
            .encrypt(
                request.value.as_bytes(),
                name,
                metadata.security_level,
                Some(name.as_bytes()),
            )
            .await?;

        let now = Utc::now();
        let record = SecretRecord {
            id: name.to_owned(),
            name: name.to_owned(),
            description: request.description,
            tags: request.tags,
            checksum: SecretRecord::compute_checksum(&payload.encrypted, &payload.metadata),
            encryption: payload.metadata,
            version: VersionInfo::initial(now, next_rotation(&metadata, now)),
            access_stats: AccessStats::default(),
            status: SecretStatus::Active,
            access_grant: request
                .initial_access
                .map(|access| access.into_grant(now))
                .unwrap_or_default(),
            expires_at: request.expires_at,
            metadata,
            created_at: now,
            updated_at: now,
        };

        self.backend
            .store(&record.id, &payload.encrypted, &record)
            .await?;
        self.audit
            .log(AccessAuditEntry::new(
                &record.id,
                AuditOperation::Create,
                context,
                true,
                "Secret created",
            ))
            .await?;

        info!(
            secret_id = %record.id,
            level = %record.metadata.security_level,
            category = %record.metadata.category,
            "secret created"
        );
        Ok(record)
    }

    /// Read a secret, decrypting it when `include_value` is set.
    ///
    /// The attempt is audited whether or not it is granted. A denial bumps
    /// `failedAttempts`; a grant bumps the access counters.
    ///
    /// # Errors
    ///
    /// - [`SecretError::NotFound`] for an unknown id.
    /// - [`SecretError::AccessDenied`] with the decision reason verbatim.
    /// - [`SecretError::Crypto`] with [`CryptoError::Integrity`] when the
    ///   stored ciphertext was altered. A tamper entry is audited first.
    pub async fn get(
        &self,
        secret_id: &str,
        context: &AccessContext,
        include_value: bool,
    ) -> Result<RevealedSecret, SecretError> {
        let mut record = self.fetch_record(secret_id).await?;

        let decision = self
            .policy
            .evaluate_access(secret_id, &record.metadata, context)
            .await;
        let (granted, reason) = if decision.granted {
            match enforce_restrictions(&record.metadata, Some(&record.access_grant), context) {
                Ok(()) => (true, decision.reason),
                Err(reason) => (false, reason),
            }
        } else {
            (false, decision.reason)
        };

        self.audit
            .log(AccessAuditEntry::new(
                secret_id,
                AuditOperation::Read,
                context,
                granted,
                &reason,
            ))
            .await?;

        if !granted {
            warn!(secret_id, user_id = %context.user_id, %reason, "secret access denied");
            record.access_stats.record_failure();
            self.backend.update_metadata(&record).await?;
            return Err(SecretError::AccessDenied { reason });
        }

        let value = if include_value {
            Some(self.reveal(&record, context).await?)
        } else {
            None
        };

        record
            .access_stats
            .record_access(&context.user_id, Utc::now());
        self.backend.update_metadata(&record).await?;

        Ok(RevealedSecret { record, value })
    }

    /// Change a secret's value, metadata or status.
    ///
    /// Needs read access, then a `PUT` decision. New hints re-run the
    /// classifier over the merged metadata. A new value, a changed level or
    /// `force_rotation` re-encrypts and bumps the version; `force_rotation`
    /// also rotates the encryption key first.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`SecretError::AccessDenied`] for the
    /// write decision.
    pub async fn update(
        &self,
        secret_id: &str,
        request: UpdateSecretRequest,
        context: &AccessContext,
    ) -> Result<SecretRecord, SecretError> {
        let reclassify = request.hints.as_ref().is_some_and(|h| !h.is_empty());
        let needs_plaintext = (reclassify || request.force_rotation) && request.value.is_none();
        let current = self.get(secret_id, context, needs_plaintext).await?;
        let mut record = current.record;

        let write = context.for_request("PUT", &format!("/secrets/{secret_id}"));
        self.authorize(secret_id, &record.metadata, &write, AuditOperation::Update)
            .await?;

        let value_changed = request.value.is_some();
        let plaintext = request.value.or(current.value);
        let previous_level = record.metadata.security_level;

        if let Some(hints) = request.hints.as_ref().filter(|_| reclassify) {
            let merged = ClassificationHints::from_metadata(&record.metadata).merged_with(hints);
            let value = plaintext.as_deref().map_or("", String::as_str);
            record.metadata = classifier::classify(&record.name, value, Some(&merged));
        }
        if let Some(description) = request.description {
            record.description = Some(description);
        }
        if let Some(tags) = request.tags {
            record.tags = tags;
        }
        if let Some(status) = request.status {
            record.status = status;
        }
        if request.expires_at.is_some() {
            record.expires_at = request.expires_at;
        }
        if let Some(access_control) = &request.access_control {
            access_control.apply(&mut record.access_grant);
        }

        let now = Utc::now();
        record.updated_at = now;
        let level_changed = record.metadata.security_level != previous_level;
        let reencrypt = value_changed || level_changed || request.force_rotation;

        if reencrypt {
            let value = plaintext.ok_or_else(|| invalid("no plaintext available to re-encrypt"))?;
            if request.force_rotation {
                self.rotate_encryption_key(secret_id, record.metadata.security_level)
                    .await?;
            }
            let ciphertext = self.reseal(&mut record, &value, now).await?;
            self.backend.store(secret_id, &ciphertext, &record).await?;
        } else {
            self.backend.update_metadata(&record).await?;
        }

        self.audit
            .log(AccessAuditEntry::new(
                secret_id,
                AuditOperation::Update,
                &write,
                true,
                "Secret updated",
            ))
            .await?;

        info!(
            secret_id,
            version = record.version.current,
            reencrypted = reencrypt,
            key_rotated = request.force_rotation,
            "secret updated"
        );
        Ok(record)
    }

    /// Replace a secret's value, generating one when `new_value` is `None`.
    ///
    /// Needs read access, then a `POST /secrets/<id>/rotate` decision. The
    /// encryption key is rotated before the new value is sealed.
    ///
    /// # Errors
    ///
    /// As [`update`](Self::update).
    pub async fn rotate(
        &self,
        secret_id: &str,
        new_value: Option<&str>,
        context: &AccessContext,
    ) -> Result<SecretRecord, SecretError> {
        let current = self.get(secret_id, context, new_value.is_none()).await?;
        let mut record = current.record;

        let rotate = context.for_request("POST", &format!("/secrets/{secret_id}/rotate"));
        self.authorize(secret_id, &record.metadata, &rotate, AuditOperation::Rotate)
            .await?;

        let value = match new_value {
            Some(v) => Zeroizing::new(v.to_owned()),
            None => {
                let current_len = current.value.as_ref().map_or(0, |v| v.chars().count());
                Zeroizing::new(generator::generate_value(
                    record.metadata.category,
                    current_len,
                ))
            }
        };

        let key = self
            .rotate_encryption_key(secret_id, record.metadata.security_level)
            .await?;

        let now = Utc::now();
        record.updated_at = now;
        let ciphertext = self.reseal(&mut record, &value, now).await?;
        self.backend.store(secret_id, &ciphertext, &record).await?;

        self.audit
            .log(AccessAuditEntry::new(
                secret_id,
                AuditOperation::Rotate,
                &rotate,
                true,
                "Secret rotated",
            ))
            .await?;

        info!(
            secret_id,
            version = record.version.current,
            key_version = key.version,
            "secret rotated"
        );
        Ok(record)
    }

    /// Mark a secret `deprecated`. Needs read access, then a
    /// `POST /secrets/<id>/archive` decision.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn archive(
        &self,
        secret_id: &str,
        context: &AccessContext,
    ) -> Result<SecretRecord, SecretError> {
        let mut record = self.get(secret_id, context, false).await?.record;

        let archive = context.for_request("POST", &format!("/secrets/{secret_id}/archive"));
        self.authorize(secret_id, &record.metadata, &archive, AuditOperation::Archive)
            .await?;

        record.status = SecretStatus::Deprecated;
        record.updated_at = Utc::now();
        self.backend.update_metadata(&record).await?;

        self.audit
            .log(AccessAuditEntry::new(
                secret_id,
                AuditOperation::Archive,
                &archive,
                true,
                "Secret archived",
            ))
            .await?;

        info!(secret_id, "secret archived");
        Ok(record)
    }

    /// Records matching `filter` that `context` may read.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Backend`] or [`SecretError::Audit`].
    pub async fn list(
        &self,
        context: &AccessContext,
        filter: &SecretFilter,
    ) -> Result<SecretPage, SecretError> {
        let now = context.timestamp.with_timezone(&Utc);
        let mut visible = Vec::new();
        for record in self.backend.list_metadata().await? {
            if !filter.matches_at(&record, now) {
                continue;
            }
            let decision = self
                .policy
                .evaluate_access(&record.id, &record.metadata, context)
                .await;
            if decision.granted
                && enforce_restrictions(&record.metadata, Some(&record.access_grant), context)
                    .is_ok()
            {
                visible.push(record);
            }
        }

        let total = visible.len();
        let (page, page_size) = match filter.page_size.filter(|s| *s > 0) {
            Some(size) => (filter.page.unwrap_or(1).max(1), size),
            None => (1, total),
        };
        let secrets: Vec<SecretRecord> = visible
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        self.audit
            .log(AccessAuditEntry::new(
                "*",
                AuditOperation::List,
                context,
                true,
                &format!("{total} secrets visible"),
            ))
            .await?;

        Ok(SecretPage {
            secrets,
            total,
            page,
            page_size,
        })
    }

    /// Evaluate access without touching the backend.
    pub async fn check_access(
        &self,
        secret_id: &str,
        metadata: &SecretMetadata,
        context: &AccessContext,
    ) -> AccessDecision {
        self.policy
            .evaluate_access(secret_id, metadata, context)
            .await
    }

    /// Add or replace an access policy.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Policy`] if the policy is invalid or the store
    /// fails.
    pub async fn set_policy(&self, policy: AccessPolicy) -> Result<(), SecretError> {
        self.policy.add_policy(policy).await?;
        Ok(())
    }

    async fn fetch_record(&self, secret_id: &str) -> Result<SecretRecord, SecretError> {
        self.backend
            .fetch_metadata(secret_id)
            .await
            .map_err(not_found)
    }

    /// Policy gate for write operations. Denials are audited.
    async fn authorize(
        &self,
        secret_id: &str,
        metadata: &SecretMetadata,
        context: &AccessContext,
        operation: AuditOperation,
    ) -> Result<(), SecretError> {
        let decision = self
            .policy
            .evaluate_access(secret_id, metadata, context)
            .await;
        if decision.granted {
            return Ok(());
        }

        self.audit
            .log(AccessAuditEntry::new(
                secret_id,
                operation,
                context,
                false,
                &decision.reason,
            ))
            .await?;
        warn!(
            secret_id,
            user_id = %context.user_id,
            method = %context.request_method,
            reason = %decision.reason,
            "secret write denied"
        );
        Err(SecretError::AccessDenied {
            reason: decision.reason,
        })
    }

    /// Rotate the secret's key, registering a fresh one if none exists.
    async fn rotate_encryption_key(
        &self,
        secret_id: &str,
        level: SecurityLevel,
    ) -> Result<EncryptionKey, SecretError> {
        match self.encryption.rotate_key(secret_id).await {
            Ok(key) => Ok(key),
            Err(CryptoError::KeyNotFound { .. }) => {
                warn!(secret_id, "no registered key to rotate, registering a new one");
                Ok(self.encryption.generate_key(secret_id, level, None).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Verify and decrypt the stored ciphertext.
    async fn reveal(
        &self,
        record: &SecretRecord,
        context: &AccessContext,
    ) -> Result<Zeroizing<String>, SecretError> {
        let ciphertext = self
            .backend
            .fetch_ciphertext(&record.id)
            .await
            .map_err(not_found)?;

        let expected = SecretRecord::compute_checksum(&ciphertext, &record.encryption);
        let result = if crypto::checksum_matches(&expected, &record.checksum) {
            self.encryption
                .decrypt(&ciphertext, &record.encryption, Some(record.id.as_bytes()))
                .await
        } else {
            Err(CryptoError::Integrity {
                key_id: record.encryption.key_id.clone(),
            })
        };

        match result {
            Ok(bytes) => String::from_utf8(bytes).map(Zeroizing::new).map_err(|e| {
                e.into_bytes().zeroize();
                CryptoError::Decryption {
                    reason: "plaintext is not valid UTF-8".to_owned(),
                }
                .into()
            }),
            Err(e @ CryptoError::Integrity { .. }) => {
                error!(secret_id = %record.id, user_id = %context.user_id, "tamper detected");
                let entry = AccessAuditEntry::new(
                    &record.id,
                    AuditOperation::Read,
                    context,
                    false,
                    &e.to_string(),
                )
                .tampered();
                if let Err(audit_err) = self.audit.log(entry).await {
                    warn!(secret_id = %record.id, error = %audit_err, "tamper event not audited");
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Encrypt `value` under the record's current level and bump its
    /// version. Returns the new ciphertext.
    async fn reseal(
        &self,
        record: &mut SecretRecord,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<String, SecretError> {
        let payload = self
            .encryption
            .encrypt(
                value.as_bytes(),
                &record.id,
                record.metadata.security_level,
                Some(record.id.as_bytes()),
            )
            .await?;

        record.checksum = SecretRecord::compute_checksum(&payload.encrypted, &payload.metadata);
        record.encryption = payload.metadata;
        record.version.bump(now);
        record.version.next_rotation = next_rotation(&record.metadata, now);
        Ok(payload.encrypted)
    }
}

fn invalid(reason: &str) -> SecretError {
    SecretError::Validation {
        reason: reason.to_owned(),
    }
}

fn not_found(e: BackendError) -> SecretError {
    match e {
        BackendError::NotFound { secret_id } => SecretError::NotFound { secret_id },
        other => SecretError::Backend(other),
    }
}

/// When the next rotation is due, or `None` if rotation is disabled.
#[must_use]
pub fn next_rotation(metadata: &SecretMetadata, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let policy = &metadata.rotation_policy;
    policy.enabled.then(|| {
        let days = policy.interval_days.unwrap_or(DEFAULT_ROTATION_DAYS);
        now + Duration::days(i64::from(days))
    })
}

/// Check the restrictions stored on the secret itself. Returns the denial
/// reason.
///
/// The ACL check runs when the metadata carries an ACL or `grant` is
/// non-empty. It admits the owner, users or roles on the ACL, and anyone
/// the grant still admits at the request time.
///
/// # Errors
///
/// Returns the first restriction the request fails.
pub fn enforce_restrictions(
    metadata: &SecretMetadata,
    grant: Option<&AccessGrant>,
    context: &AccessContext,
) -> Result<(), String> {
    let acl = metadata.acl.as_deref().unwrap_or_default();
    let grant = grant.filter(|g| !g.is_empty());
    if !acl.is_empty() || grant.is_some() {
        let at = context.timestamp.with_timezone(&Utc);
        let listed = context.user_id == metadata.owner_id
            || acl.contains(&context.user_id)
            || context.user_roles.iter().any(|r| acl.contains(r))
            || grant.is_some_and(|g| g.admits(&context.user_id, &context.user_roles, at));
        if !listed {
            return Err(format!(
                "User {} is not on the access control list",
                context.user_id
            ));
        }
    }

    if let Some(ranges) = metadata.ip_restrictions.as_ref().filter(|r| !r.is_empty()) {
        if !ranges
            .iter()
            .any(|r| condition::ip_matches(&context.source_ip, r))
        {
            return Err(format!("Source IP {} is not permitted", context.source_ip));
        }
    }

    if let Some(devices) = metadata
        .device_restrictions
        .as_ref()
        .filter(|d| !d.is_empty())
    {
        if !context
            .device_id
            .as_ref()
            .is_some_and(|d| devices.contains(d))
        {
            return Err("Device is not permitted".to_owned());
        }
    }

    if let Some(countries) = metadata.geo_restrictions.as_ref().filter(|g| !g.is_empty()) {
        let allowed = context.location.as_ref().is_some_and(|l| {
            countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&l.country))
        });
        if !allowed {
            return Err("Location is not permitted".to_owned());
        }
    }

    if let Some(window) = &metadata.time_restrictions {
        check_access_window(window, context)?;
    }

    Ok(())
}

fn check_access_window(window: &AccessWindow, context: &AccessContext) -> Result<(), String> {
    let at = match window.timezone.as_deref() {
        None => context.timestamp,
        Some(tz) => {
            let offset = parse_utc_offset(tz)
                .ok_or_else(|| format!("Access window timezone '{tz}' is not supported"))?;
            context.timestamp.with_timezone(&offset)
        }
    };

    if let Some(days) = &window.days_of_week {
        if !days.contains(&at.weekday().num_days_from_sunday()) {
            return Err("Access is not permitted on this day".to_owned());
        }
    }
    if let (Some(start), Some(end)) = (window.start_hour, window.end_hour) {
        let minute = at.hour() * 60 + at.minute();
        if !condition::minute_in_window(minute, start * 60, end * 60 + 59) {
            return Err("Access is outside the permitted time window".to_owned());
        }
    }
    Ok(())
}

/// Parse `UTC`, `Z`, `GMT`, `+02:00`, `-0530`, `+5` or `UTC+01:00`.
fn parse_utc_offset(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    let rest = ["UTC", "GMT"]
        .iter()
        .find_map(|prefix| {
            tz.get(..prefix.len())
                .filter(|head| head.eq_ignore_ascii_case(prefix))
                .map(|_| &tz[prefix.len()..])
        })
        .unwrap_or(tz);
    if rest.is_empty() || rest.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }

    let (sign, digits) = match rest.as_bytes().first().copied()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    if !digits.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return None;
    }
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => digits.split_at(2),
        None => (digits, "0"),
    };
    if hours.is_empty() || hours.len() > 2 {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
