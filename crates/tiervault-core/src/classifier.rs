//! Secret classifier.
//!
//! A pure function from `(name, value, hints)` to [`SecretMetadata`]. No I/O
//! and no shared mutable state, so it is safe to call from any number of
//! tasks concurrently. The only nondeterminism is the timestamp embedded in
//! the `auto-classified:` tag.
//!
//! All scans are case-insensitive and look at both the name and the value.

use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::metadata::{
    AccessWindow, BusinessImpact, Compliance, RetentionPolicy, RotationPolicy, SecretCategory,
    SecretMetadata, SecurityLevel,
};

/// Characters that make a long value count as "complex".
const COMPLEX_SYMBOLS: &str = "!@#$%^&*(),.?\":{}|<>";

const HIGH_VALUE_PATTERN: &str = r"(?i)password|key|secret|token|credential|private";
const CRITICAL_PATTERN: &str = r"(?i)admin|root|master|production|prod|api.*key";

const CATEGORY_PATTERNS: [(SecretCategory, &str); 8] = [
    (SecretCategory::ApiKey, r"api.*key|token|jwt|bearer|auth"),
    (
        SecretCategory::Database,
        r"database|db|mysql|postgres|mongodb|connection.*string",
    ),
    (
        SecretCategory::EncryptionKey,
        r"encryption|cipher|aes|rsa|private.*key|public.*key",
    ),
    (SecretCategory::Certificate, r"certificate|cert|ssl|tls|pem|crt"),
    (
        SecretCategory::Service,
        r"service|microservice|application|app.*secret",
    ),
    (SecretCategory::UserCredentials, r"user|password|login|auth"),
    (SecretCategory::Configuration, r"config|setting|env|environment"),
    (SecretCategory::Temporary, r"temp|session|nonce|otp"),
];

// The patterns are compile-time constants; a failure here is a programming
// error caught by the unit tests.
#[allow(clippy::expect_used)]
static HIGH_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(HIGH_VALUE_PATTERN).expect("high-value pattern is valid"));

#[allow(clippy::expect_used)]
static CRITICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(CRITICAL_PATTERN).expect("critical pattern is valid"));

#[allow(clippy::expect_used)]
static CATEGORY_MATCHERS: LazyLock<Vec<(SecretCategory, Regex)>> = LazyLock::new(|| {
    CATEGORY_PATTERNS
        .iter()
        .map(|(category, pattern)| {
            let re = Regex::new(&format!("(?i){pattern}")).expect("category pattern is valid");
            (*category, re)
        })
        .collect()
});

/// Caller-supplied facts that classification keeps or honors.
///
/// Only `security_level` influences the computed fields (as an explicit
/// override). Everything else is copied into the output unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_restrictions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_restrictions: Option<AccessWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_restrictions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_restrictions: Option<Vec<String>>,
}

impl ClassificationHints {
    /// Hints that pin an existing secret's level, owner, and restrictions.
    #[must_use]
    pub fn from_metadata(metadata: &SecretMetadata) -> Self {
        Self {
            security_level: Some(metadata.security_level),
            owner_id: Some(metadata.owner_id.clone()),
            acl: metadata.acl.clone(),
            geo_restrictions: metadata.geo_restrictions.clone(),
            time_restrictions: metadata.time_restrictions.clone(),
            ip_restrictions: metadata.ip_restrictions.clone(),
            device_restrictions: metadata.device_restrictions.clone(),
        }
    }

    /// Overlay `other` on top of `self`; fields set in `other` win.
    #[must_use]
    pub fn merged_with(self, other: &Self) -> Self {
        Self {
            security_level: other.security_level.or(self.security_level),
            owner_id: other.owner_id.clone().or(self.owner_id),
            acl: other.acl.clone().or(self.acl),
            geo_restrictions: other.geo_restrictions.clone().or(self.geo_restrictions),
            time_restrictions: other.time_restrictions.clone().or(self.time_restrictions),
            ip_restrictions: other.ip_restrictions.clone().or(self.ip_restrictions),
            device_restrictions: other
                .device_restrictions
                .clone()
                .or(self.device_restrictions),
        }
    }

    /// Whether no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Classify a secret and derive its handling policy.
#[must_use]
pub fn classify(name: &str, value: &str, hints: Option<&ClassificationHints>) -> SecretMetadata {
    classify_at(name, value, hints, Utc::now())
}

/// [`classify`] with an explicit clock for the classification tag.
#[must_use]
pub fn classify_at(
    name: &str,
    value: &str,
    hints: Option<&ClassificationHints>,
    now: DateTime<Utc>,
) -> SecretMetadata {
    let hints = hints.cloned().unwrap_or_default();

    let security_level = determine_security_level(name, value, hints.security_level);
    let category = determine_category(name, value);

    SecretMetadata {
        security_level,
        category,
        owner_id: hints.owner_id.unwrap_or_default(),
        acl: hints.acl,
        required_permissions: required_permissions(security_level, category),
        geo_restrictions: hints.geo_restrictions,
        time_restrictions: hints.time_restrictions,
        ip_restrictions: hints.ip_restrictions,
        device_restrictions: hints.device_restrictions,
        rotation_policy: rotation_policy(security_level, category),
        retention_policy: retention_policy(security_level),
        compliance: compliance_requirements(security_level, category),
        classification_tags: Some(vec![
            format!("level:{security_level}"),
            format!("category:{category}"),
            format!(
                "auto-classified:{}",
                now.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
        ]),
        risk_score: Some(risk_score(name, value, security_level, category)),
        business_impact: Some(business_impact(name, security_level, category)),
    }
}

/// Decision ladder for the security level. First match wins.
#[must_use]
pub fn determine_security_level(
    name: &str,
    value: &str,
    explicit: Option<SecurityLevel>,
) -> SecurityLevel {
    if let Some(level) = explicit {
        return level;
    }

    let high_value = HIGH_VALUE.is_match(name) || HIGH_VALUE.is_match(value);
    let critical = CRITICAL.is_match(name) || CRITICAL.is_match(value);
    let length = value.chars().count();
    let complex = length > 32 && value.chars().any(|c| COMPLEX_SYMBOLS.contains(c));

    if critical || (high_value && complex) {
        SecurityLevel::TopSecret
    } else if high_value || complex {
        SecurityLevel::Secret
    } else if length > 16 {
        SecurityLevel::Confidential
    } else if length > 8 {
        SecurityLevel::Internal
    } else {
        SecurityLevel::Public
    }
}

/// First category, in enumeration order, whose patterns match.
#[must_use]
pub fn determine_category(name: &str, value: &str) -> SecretCategory {
    CATEGORY_MATCHERS
        .iter()
        .find(|(_, re)| re.is_match(name) || re.is_match(value))
        .map_or(SecretCategory::Configuration, |(category, _)| *category)
}

/// Heuristic 0–100 risk score.
#[must_use]
pub fn risk_score(
    name: &str,
    value: &str,
    level: SecurityLevel,
    category: SecretCategory,
) -> u8 {
    let mut score: i32 = match level {
        SecurityLevel::Public => 10,
        SecurityLevel::Internal => 25,
        SecurityLevel::Confidential => 50,
        SecurityLevel::Secret => 75,
        SecurityLevel::TopSecret => 95,
    };

    score += match category {
        SecretCategory::ApiKey => 10,
        SecretCategory::Database | SecretCategory::UserCredentials => 15,
        SecretCategory::EncryptionKey => 20,
        SecretCategory::Certificate | SecretCategory::Service => 5,
        SecretCategory::Configuration => 0,
        SecretCategory::Temporary => -5,
    };

    if value.chars().count() > 50 {
        score += 5;
    }
    if value.chars().any(|c| c.is_ascii_uppercase()) {
        score += 2;
    }
    if value.chars().any(|c| c.is_ascii_digit()) {
        score += 2;
    }
    if value.chars().any(|c| !c.is_ascii_alphanumeric()) {
        score += 3;
    }

    let lowered = name.to_lowercase();
    if lowered.contains("prod") {
        score += 10;
    }
    if lowered.contains("admin") || lowered.contains("root") {
        score += 15;
    }

    // Clamped to 0..=100, so the cast cannot truncate.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamped = score.clamp(0, 100) as u8;
    clamped
}

/// Business impact ladder. First match wins.
#[must_use]
pub fn business_impact(
    name: &str,
    level: SecurityLevel,
    category: SecretCategory,
) -> BusinessImpact {
    if matches!(
        category,
        SecretCategory::Database | SecretCategory::EncryptionKey
    ) {
        BusinessImpact::Critical
    } else if level >= SecurityLevel::Secret || name.to_lowercase().contains("prod") {
        BusinessImpact::High
    } else if level == SecurityLevel::Confidential {
        BusinessImpact::Medium
    } else {
        BusinessImpact::Low
    }
}

/// Permissions a caller needs; grows monotonically with the level.
#[must_use]
pub fn required_permissions(level: SecurityLevel, category: SecretCategory) -> Vec<String> {
    let mut permissions = vec!["secrets:read"];

    if level >= SecurityLevel::Confidential {
        permissions.push("secrets:decrypt");
    }
    if level >= SecurityLevel::Secret {
        permissions.extend(["secrets:audit", "secrets:access_log"]);
    }
    if level == SecurityLevel::TopSecret {
        permissions.extend(["secrets:approve", "secrets:monitor"]);
    }

    match category {
        SecretCategory::EncryptionKey => permissions.push("crypto:use_key"),
        SecretCategory::Certificate => permissions.push("cert:verify"),
        _ => {}
    }

    permissions.into_iter().map(String::from).collect()
}

/// Default rotation cadence for a level, adjusted by category.
#[must_use]
pub fn rotation_policy(level: SecurityLevel, category: SecretCategory) -> RotationPolicy {
    let interval = match level {
        SecurityLevel::Public => return RotationPolicy::disabled(),
        SecurityLevel::Internal => 90,
        SecurityLevel::Confidential => 60,
        SecurityLevel::Secret => 30,
        SecurityLevel::TopSecret => 7,
    };

    let interval = match category {
        SecretCategory::ApiKey => interval.min(30),
        SecretCategory::Temporary => 1,
        _ => interval,
    };

    RotationPolicy {
        enabled: true,
        interval_days: Some(interval),
        auto_rotate: Some(level >= SecurityLevel::Confidential),
        notify_before_days: Some((interval / 4).max(7)),
    }
}

/// Default retention for a level.
#[must_use]
pub fn retention_policy(level: SecurityLevel) -> RetentionPolicy {
    let retain_days = match level {
        SecurityLevel::Public => 30,
        SecurityLevel::Internal => 90,
        SecurityLevel::Confidential => 365,
        SecurityLevel::Secret => 2555,
        SecurityLevel::TopSecret => 3650,
    };

    RetentionPolicy {
        retain_after_deletion: level >= SecurityLevel::Confidential,
        retain_days: Some(retain_days),
        permanent_archive: Some(level == SecurityLevel::TopSecret),
    }
}

/// Compliance standards accumulated by level and category.
#[must_use]
pub fn compliance_requirements(level: SecurityLevel, category: SecretCategory) -> Compliance {
    let mut standards = Vec::new();

    if level >= SecurityLevel::Confidential {
        standards.push("ISO27001");
    }
    if level >= SecurityLevel::Secret {
        standards.extend(["GDPR", "SOC2"]);
    }
    if level == SecurityLevel::TopSecret {
        standards.extend(["PCI-DSS", "HIPAA"]);
    }
    if category == SecretCategory::EncryptionKey {
        standards.push("FIPS140-2");
    }

    let encryption_standard = if level >= SecurityLevel::Confidential {
        "AES-256"
    } else {
        "AES-128"
    };

    Compliance {
        standards: Some(standards.into_iter().map(String::from).collect()),
        audit_required: Some(level >= SecurityLevel::Secret),
        encryption_standard: Some(encryption_standard.to_owned()),
    }
}
