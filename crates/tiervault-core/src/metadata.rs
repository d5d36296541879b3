//! Classification vocabulary and the persisted secret metadata shape.
//!
//! Field names serialize in camelCase so stored JSON matches documents
//! written by other clients of the same secret store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordered sensitivity tier. Drives algorithm strength, rotation cadence,
/// retention, and required permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Public,
    Internal,
    Confidential,
    Secret,
    TopSecret,
}

impl SecurityLevel {
    /// Every level, lowest first.
    pub const ALL: [Self; 5] = [
        Self::Public,
        Self::Internal,
        Self::Confidential,
        Self::Secret,
        Self::TopSecret,
    ];

    /// Wire name (`top_secret`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Secret => "secret",
            Self::TopSecret => "top_secret",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown security level '{s}'"))
    }
}

/// Functional classification of a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretCategory {
    ApiKey,
    Database,
    EncryptionKey,
    Certificate,
    Service,
    UserCredentials,
    Configuration,
    Temporary,
}

impl SecretCategory {
    /// Fixed enumeration order. The classifier tests categories in this
    /// order and picks the first match.
    pub const ALL: [Self; 8] = [
        Self::ApiKey,
        Self::Database,
        Self::EncryptionKey,
        Self::Certificate,
        Self::Service,
        Self::UserCredentials,
        Self::Configuration,
        Self::Temporary,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Database => "database",
            Self::EncryptionKey => "encryption_key",
            Self::Certificate => "certificate",
            Self::Service => "service",
            Self::UserCredentials => "user_credentials",
            Self::Configuration => "configuration",
            Self::Temporary => "temporary",
        }
    }
}

impl fmt::Display for SecretCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecretCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown secret category '{s}'"))
    }
}

/// Business impact if the secret leaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusinessImpact {
    Low,
    Medium,
    High,
    Critical,
}

impl BusinessImpact {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Coarse access window attached directly to a secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_hour: Option<u32>,
    /// 0 = Sunday.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u32>>,
    /// Fixed UTC offset the hours and days are read in: `UTC`, `Z`,
    /// `+02:00`, `-0530`, `UTC+1`. The request's own offset when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Rotation settings. `interval_days` is present iff `enabled`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationPolicy {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rotate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_before_days: Option<u32>,
}

impl RotationPolicy {
    /// Rotation turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub retain_after_deletion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent_archive: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compliance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standards: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_standard: Option<String>,
}

/// Full classification and handling metadata for one secret.
///
/// Produced by [`classify`](crate::classifier::classify); stored next to the
/// ciphertext, never next to plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMetadata {
    pub security_level: SecurityLevel,
    pub category: SecretCategory,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<String>>,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_restrictions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_restrictions: Option<AccessWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_restrictions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_restrictions: Option<Vec<String>>,
    pub rotation_policy: RotationPolicy,
    pub retention_policy: RetentionPolicy,
    pub compliance: Compliance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_impact: Option<BusinessImpact>,
}
