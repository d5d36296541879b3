//! Access-policy engine for `tiervault`.
//!
//! Policies are JSON documents scoped to secrets by id, wildcard pattern,
//! security level, and category. Each policy carries prioritized rules whose
//! conditions are AND-combined. Applicable policies are walked in precedence
//! order, each policy's rules by ascending priority; the first matching rule
//! decides.
//!
//! Pattern matching supports:
//! - Exact: `prod/db-password` (no `*`, whole id)
//! - Wildcard: `prod/*` matches `prod/db` and `prod/a/b`; `db*` matches
//!   `app/db-main` (a pattern with `*` may match anywhere in the id)
//!
//! Evaluation never returns an error. A store failure becomes a deny
//! decision.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::condition::{self, check_time_restrictions};
use crate::error::{PolicyError, StoreError};
use crate::metadata::{SecretCategory, SecretMetadata, SecurityLevel};

/// Outcome a rule or policy grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    #[default]
    Active,
    Inactive,
    Draft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Active,
    Inactive,
    Deprecated,
}

/// Access-control family a rule belongs to. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    /// Role-based.
    Rbac,
    /// Attribute-based.
    #[default]
    Abac,
    /// Time-based.
    Tbac,
    /// Location-based.
    Lbac,
    /// Device-based.
    Dbac,
}

/// Comparison a condition performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    StringEquals,
    StringContains,
    NumericEquals,
    NumericGreaterThan,
    NumericLessThan,
    Bool,
    IpAddress,
    DateTime,
    ForAllValues,
    ForAnyValue,
}

/// A single predicate over the request or the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    /// Lookup key, see [`condition::lookup`].
    pub key: String,
    /// Expected JSON scalars.
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negate: bool,
}

impl AccessCondition {
    #[must_use]
    pub fn new<I, V>(kind: ConditionType, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            kind,
            key: key.to_owned(),
            values: values.into_iter().map(Into::into).collect(),
            negate: false,
        }
    }

    #[must_use]
    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }
}

/// Inclusive `"HH:MM"` window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedHours {
    pub start: String,
    pub end: String,
}

/// When a rule is eligible to match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRestrictions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_hours: Option<AllowedHours>,
    /// Day of week, 0 = Sunday.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_days: Option<Vec<u8>>,
}

/// A prioritized rule. Lower `priority` is evaluated first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRule {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub policy_type: PolicyType,
    /// AND-combined.
    #[serde(default)]
    pub conditions: Vec<AccessCondition>,
    pub effect: Effect,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_restrictions: Option<TimeRestrictions>,
    #[serde(default)]
    pub status: RuleStatus,
}

impl AccessRule {
    /// An active ABAC rule with no conditions.
    #[must_use]
    pub fn new(id: &str, name: &str, effect: Effect, priority: i32) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            description: None,
            policy_type: PolicyType::default(),
            conditions: Vec::new(),
            effect,
            priority,
            time_restrictions: None,
            status: RuleStatus::Active,
        }
    }

    #[must_use]
    pub fn with_condition(mut self, condition: AccessCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn with_time_restrictions(mut self, restrictions: TimeRestrictions) -> Self {
        self.time_restrictions = Some(restrictions);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: RuleStatus) -> Self {
        self.status = status;
        self
    }
}

/// A policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    /// Unique policy id.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Applies only to this exact secret id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_id: Option<String>,
    /// Applies to secret ids matching this wildcard pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<Vec<SecurityLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Vec<SecretCategory>>,
    #[serde(default)]
    pub rules: Vec<AccessRule>,
    pub default_effect: Effect,
    #[serde(default)]
    pub status: PolicyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

fn default_version() -> String {
    "1.0".to_owned()
}

impl AccessPolicy {
    /// An active, unscoped policy with no rules.
    #[must_use]
    pub fn new(id: &str, name: &str, default_effect: Effect) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            description: None,
            version: default_version(),
            secret_id: None,
            secret_pattern: None,
            security_level: None,
            category: None,
            rules: Vec::new(),
            default_effect,
            status: PolicyStatus::Active,
            created_at: None,
            updated_at: None,
            created_by: None,
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: AccessRule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn for_secret(mut self, secret_id: &str) -> Self {
        self.secret_id = Some(secret_id.to_owned());
        self
    }

    #[must_use]
    pub fn matching(mut self, pattern: &str) -> Self {
        self.secret_pattern = Some(pattern.to_owned());
        self
    }

    #[must_use]
    pub fn for_levels(mut self, levels: &[SecurityLevel]) -> Self {
        self.security_level = Some(levels.to_vec());
        self
    }

    #[must_use]
    pub fn for_categories(mut self, categories: &[SecretCategory]) -> Self {
        self.category = Some(categories.to_vec());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: PolicyStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether every scope filter admits this secret.
    #[must_use]
    pub fn applies_to(&self, secret_id: &str, metadata: &SecretMetadata) -> bool {
        if self.secret_id.as_deref().is_some_and(|id| id != secret_id) {
            return false;
        }
        if self
            .secret_pattern
            .as_deref()
            .is_some_and(|pattern| !pattern_matches(pattern, secret_id))
        {
            return false;
        }
        if self
            .security_level
            .as_ref()
            .is_some_and(|levels| !levels.contains(&metadata.security_level))
        {
            return false;
        }
        if self
            .category
            .as_ref()
            .is_some_and(|categories| !categories.contains(&metadata.category))
        {
            return false;
        }
        true
    }

    /// Lowest priority among active rules; `i32::MAX` when there are none.
    #[must_use]
    pub fn best_rule_priority(&self) -> i32 {
        self.rules
            .iter()
            .filter(|r| r.status == RuleStatus::Active)
            .map(|r| r.priority)
            .min()
            .unwrap_or(i32::MAX)
    }

    /// Structural checks applied on write.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] naming the first problem found.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |reason: String| PolicyError::Invalid { reason };

        if self.id.trim().is_empty() {
            return Err(invalid("policy id is empty".to_owned()));
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(invalid(format!("policy '{}' has a rule with no id", self.id)));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(invalid(format!(
                    "policy '{}' has duplicate rule id '{}'",
                    self.id, rule.id
                )));
            }
            let Some(restrictions) = &rule.time_restrictions else {
                continue;
            };
            if let Some(days) = &restrictions.allowed_days {
                if let Some(day) = days.iter().find(|d| **d > 6) {
                    return Err(invalid(format!(
                        "rule '{}' has allowed day {day}, expected 0-6",
                        rule.id
                    )));
                }
            }
            if let Some(hours) = &restrictions.allowed_hours {
                if condition::parse_clock(&hours.start).is_none()
                    || condition::parse_clock(&hours.end).is_none()
                {
                    return Err(invalid(format!(
                        "rule '{}' has an unparseable allowed-hours window",
                        rule.id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Approximate position of the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

/// Caller-supplied facts about an access request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessContext {
    pub user_id: String,
    #[serde(default)]
    pub user_roles: Vec<String>,
    #[serde(default)]
    pub user_attributes: serde_json::Map<String, Value>,
    /// Request time, with the requester's UTC offset.
    pub timestamp: DateTime<FixedOffset>,
    pub source_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default = "default_method")]
    pub request_method: String,
    #[serde(default)]
    pub resource: String,
}

fn default_method() -> String {
    "GET".to_owned()
}

impl AccessContext {
    /// A `GET` request with no roles or attributes.
    #[must_use]
    pub fn new(user_id: &str, source_ip: &str, timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            user_id: user_id.to_owned(),
            user_roles: Vec::new(),
            user_attributes: serde_json::Map::new(),
            timestamp,
            source_ip: source_ip.to_owned(),
            user_agent: None,
            device_id: None,
            location: None,
            purpose: None,
            session_id: None,
            request_method: default_method(),
            resource: String::new(),
        }
    }

    /// Same request, different method and resource.
    #[must_use]
    pub fn for_request(&self, method: &str, resource: &str) -> Self {
        Self {
            request_method: method.to_owned(),
            resource: resource.to_owned(),
            ..self.clone()
        }
    }
}

/// Audit record of one evaluated rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRule {
    pub rule_id: String,
    pub rule_name: String,
    pub policy_id: String,
    pub effect: Effect,
    pub matched: bool,
}

/// Result of [`PolicyEngine::evaluate_access`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub granted: bool,
    pub reason: String,
    pub applied_rules: Vec<AppliedRule>,
    pub timestamp: DateTime<Utc>,
    /// Evaluation time in milliseconds.
    pub duration: u64,
}

/// Policy persistence.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Insert or replace by id.
    async fn put(&self, policy: AccessPolicy) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<AccessPolicy>, StoreError>;

    /// Returns whether a policy was removed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Every policy, ordered by id.
    async fn list(&self) -> Result<Vec<AccessPolicy>, StoreError>;
}

/// In-memory [`PolicyStore`] ordered by policy id.
#[derive(Debug, Default, Clone)]
pub struct MemoryPolicyStore {
    policies: Arc<RwLock<BTreeMap<String, AccessPolicy>>>,
}

impl MemoryPolicyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn put(&self, policy: AccessPolicy) -> Result<(), StoreError> {
        self.policies.write().await.insert(policy.id.clone(), policy);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<AccessPolicy>, StoreError> {
        Ok(self.policies.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.policies.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<AccessPolicy>, StoreError> {
        Ok(self.policies.read().await.values().cloned().collect())
    }
}

/// Evaluates access requests against the policies in a [`PolicyStore`].
pub struct PolicyEngine {
    store: Arc<dyn PolicyStore>,
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine").finish_non_exhaustive()
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(Arc::new(MemoryPolicyStore::new()))
    }
}

impl PolicyEngine {
    #[must_use]
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// Validate and write a policy, replacing any policy with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] if validation fails or
    /// [`PolicyError::Store`] if the write fails.
    pub async fn add_policy(&self, mut policy: AccessPolicy) -> Result<(), PolicyError> {
        policy.validate()?;

        let now = Utc::now();
        if policy.created_at.is_none() {
            policy.created_at = Some(now);
        }
        policy.updated_at = Some(now);

        info!(id = %policy.id, rules = policy.rules.len(), status = ?policy.status, "policy written");
        self.store.put(policy).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if the delete fails.
    pub async fn remove_policy(&self, id: &str) -> Result<bool, PolicyError> {
        let removed = self.store.delete(id).await?;
        if removed {
            info!(id, "policy deleted");
        }
        Ok(removed)
    }

    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if the read fails.
    pub async fn get_policy(&self, id: &str) -> Result<Option<AccessPolicy>, PolicyError> {
        Ok(self.store.get(id).await?)
    }

    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if the read fails.
    pub async fn list_policies(&self) -> Result<Vec<AccessPolicy>, PolicyError> {
        Ok(self.store.list().await?)
    }

    /// Decide whether `context` may access `secret_id`.
    ///
    /// Never fails: a store error yields a deny decision whose reason starts
    /// with `Policy evaluation failed:`.
    pub async fn evaluate_access(
        &self,
        secret_id: &str,
        metadata: &SecretMetadata,
        context: &AccessContext,
    ) -> AccessDecision {
        let started = Instant::now();
        let mut applied = Vec::new();

        let (granted, reason) = match self.store.list().await {
            Ok(policies) => decide(&policies, secret_id, metadata, context, &mut applied),
            Err(e) => {
                warn!(secret_id, error = %e, "policy evaluation failed");
                (false, format!("Policy evaluation failed: {e}"))
            }
        };

        let duration = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            secret_id,
            user_id = %context.user_id,
            granted,
            rules_evaluated = applied.len(),
            "access evaluated"
        );

        AccessDecision {
            granted,
            reason,
            applied_rules: applied,
            timestamp: Utc::now(),
            duration,
        }
    }
}

fn decide(
    policies: &[AccessPolicy],
    secret_id: &str,
    metadata: &SecretMetadata,
    context: &AccessContext,
    applied: &mut Vec<AppliedRule>,
) -> (bool, String) {
    let mut applicable: Vec<&AccessPolicy> = policies
        .iter()
        .filter(|p| p.applies_to(secret_id, metadata))
        .collect();

    if applicable.is_empty() {
        return (false, "No applicable policies found".to_owned());
    }

    applicable.sort_by(|a, b| {
        (a.status != PolicyStatus::Active)
            .cmp(&(b.status != PolicyStatus::Active))
            .then(a.best_rule_priority().cmp(&b.best_rule_priority()))
            .then(a.id.cmp(&b.id))
    });

    for policy in applicable.iter().filter(|p| p.status == PolicyStatus::Active) {
        let mut rules: Vec<&AccessRule> = policy
            .rules
            .iter()
            .filter(|r| r.status == RuleStatus::Active)
            .collect();
        rules.sort_by_key(|rule| rule.priority);

        for rule in rules {
            let matched = rule_matches(rule, context, metadata);
            applied.push(AppliedRule {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                policy_id: policy.id.clone(),
                effect: rule.effect,
                matched,
            });
            if matched {
                return (
                    rule.effect == Effect::Allow,
                    format!(
                        "Rule \"{}\" matched with effect \"{}\"",
                        rule.name, rule.effect
                    ),
                );
            }
        }
    }

    // Highest-precedence applicable policy, active or not.
    let effect = applicable[0].default_effect;
    (
        effect == Effect::Allow,
        format!("No rules matched, using default effect \"{effect}\""),
    )
}

fn rule_matches(rule: &AccessRule, context: &AccessContext, metadata: &SecretMetadata) -> bool {
    if let Some(restrictions) = &rule.time_restrictions {
        if let Err(rejection) = check_time_restrictions(restrictions, context.timestamp) {
            debug!(rule_id = %rule.id, %rejection, "rule skipped by time restriction");
            return false;
        }
    }
    rule.conditions
        .iter()
        .all(|c| condition::evaluate_condition(c, context, metadata))
}

/// Match `secret_id` against a `secretPattern`.
///
/// A pattern without `*` must equal the id. Otherwise each `*` matches any
/// run of characters, `/` included, and the match is unanchored. Every
/// other character is literal.
#[must_use]
pub fn pattern_matches(pattern: &str, secret_id: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == secret_id;
    }
    let source = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&source).is_ok_and(|re| re.is_match(secret_id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::classifier::classify;

    fn ctx(user: &str, at: &str) -> AccessContext {
        AccessContext::new(user, "10.0.0.5", DateTime::parse_from_rfc3339(at).unwrap())
    }

    fn noon(user: &str) -> AccessContext {
        ctx(user, "2026-03-04T12:00:00+00:00")
    }

    fn deny_user_42() -> AccessPolicy {
        AccessPolicy::new("p1", "block user-42", Effect::Allow).with_rule(
            AccessRule::new("r1", "R1", Effect::Deny, 10).with_condition(AccessCondition::new(
                ConditionType::StringEquals,
                "userId",
                ["user-42"],
            )),
        )
    }

    #[tokio::test]
    async fn deny_rule_matches_user_42() {
        let engine = PolicyEngine::default();
        engine.add_policy(deny_user_42()).await.unwrap();
        let meta = classify("password", "abc123", None);

        let decision = engine.evaluate_access("s1", &meta, &noon("user-42")).await;
        assert!(!decision.granted);
        assert_eq!(decision.reason, "Rule \"R1\" matched with effect \"deny\"");
        assert_eq!(decision.applied_rules.len(), 1);
        assert!(decision.applied_rules[0].matched);
        assert_eq!(decision.applied_rules[0].policy_id, "p1");
    }

    #[tokio::test]
    async fn other_user_falls_back_to_default() {
        let engine = PolicyEngine::default();
        engine.add_policy(deny_user_42()).await.unwrap();
        let meta = classify("password", "abc123", None);

        let decision = engine.evaluate_access("s1", &meta, &noon("user-99")).await;
        assert!(decision.granted);
        assert_eq!(
            decision.reason,
            "No rules matched, using default effect \"allow\""
        );
        assert!(!decision.applied_rules[0].matched);
    }

    #[tokio::test]
    async fn outside_hours_rule_is_recorded_unmatched() {
        let engine = PolicyEngine::default();
        let policy = AccessPolicy::new("p", "business hours", Effect::Deny)
            .with_rule(
                AccessRule::new("r-hours", "office", Effect::Allow, 1).with_time_restrictions(
                    TimeRestrictions {
                        allowed_hours: Some(AllowedHours {
                            start: "09:00".to_owned(),
                            end: "17:00".to_owned(),
                        }),
                        ..TimeRestrictions::default()
                    },
                ),
            )
            .with_rule(AccessRule::new("r-next", "fallthrough", Effect::Allow, 2).with_condition(
                AccessCondition::new(ConditionType::StringEquals, "userId", ["oncall"]),
            ));
        engine.add_policy(policy).await.unwrap();
        let meta = classify("greeting", "hello", None);

        let night = ctx("someone", "2026-03-04T03:00:00+00:00");
        let decision = engine.evaluate_access("s", &meta, &night).await;
        assert!(!decision.granted);
        assert_eq!(decision.applied_rules.len(), 2);
        assert!(!decision.applied_rules[0].matched);
        assert!(decision.reason.contains("default effect \"deny\""));

        let oncall = ctx("oncall", "2026-03-04T03:00:00+00:00");
        let decision = engine.evaluate_access("s", &meta, &oncall).await;
        assert!(decision.granted);
        assert_eq!(decision.applied_rules[1].rule_id, "r-next");

        let day = ctx("someone", "2026-03-04T10:00:00+00:00");
        assert!(engine.evaluate_access("s", &meta, &day).await.granted);
    }

    #[tokio::test]
    async fn no_applicable_policies_denies() {
        let engine = PolicyEngine::default();
        engine
            .add_policy(deny_user_42().for_secret("other"))
            .await
            .unwrap();
        let meta = classify("x", "y", None);
        let decision = engine.evaluate_access("s1", &meta, &noon("u")).await;
        assert!(!decision.granted);
        assert_eq!(decision.reason, "No applicable policies found");
        assert!(decision.applied_rules.is_empty());
    }

    #[tokio::test]
    async fn inactive_only_policies_use_their_default_effect() {
        let engine = PolicyEngine::default();
        engine
            .add_policy(
                AccessPolicy::new("p", "draft", Effect::Allow)
                    .with_status(PolicyStatus::Draft)
                    .with_rule(AccessRule::new("r", "deny all", Effect::Deny, 1)),
            )
            .await
            .unwrap();
        let meta = classify("x", "y", None);
        let decision = engine.evaluate_access("s1", &meta, &noon("u")).await;
        assert!(decision.granted);
        assert_eq!(
            decision.reason,
            "No rules matched, using default effect \"allow\""
        );
        assert!(decision.applied_rules.is_empty());
    }

    #[tokio::test]
    async fn active_policy_outranks_inactive_for_default() {
        let engine = PolicyEngine::default();
        engine
            .add_policy(
                AccessPolicy::new("a", "inactive", Effect::Allow)
                    .with_status(PolicyStatus::Inactive),
            )
            .await
            .unwrap();
        engine
            .add_policy(AccessPolicy::new("b", "active", Effect::Deny))
            .await
            .unwrap();
        let meta = classify("x", "y", None);
        let decision = engine.evaluate_access("s1", &meta, &noon("u")).await;
        assert!(!decision.granted);
        assert!(decision.reason.ends_with("\"deny\""));
    }

    #[tokio::test]
    async fn rules_are_ordered_within_each_policy() {
        let engine = PolicyEngine::default();
        engine
            .add_policy(
                AccessPolicy::new("a", "a", Effect::Deny)
                    .with_rule(AccessRule::new("a10", "a10", Effect::Allow, 10))
                    .with_rule(AccessRule::new("a1", "a1", Effect::Deny, 1).with_condition(
                        AccessCondition::new(ConditionType::StringEquals, "userId", ["nobody"]),
                    )),
            )
            .await
            .unwrap();
        engine
            .add_policy(
                AccessPolicy::new("b", "b", Effect::Deny)
                    .with_rule(AccessRule::new("b5", "b5", Effect::Deny, 5)),
            )
            .await
            .unwrap();
        let meta = classify("x", "y", None);

        let decision = engine.evaluate_access("s", &meta, &noon("u")).await;
        assert!(decision.granted);
        assert_eq!(decision.reason, "Rule \"a10\" matched with effect \"allow\"");
        let order: Vec<&str> = decision
            .applied_rules
            .iter()
            .map(|r| r.rule_id.as_str())
            .collect();
        assert_eq!(order, ["a1", "a10"]);
    }

    #[tokio::test]
    async fn policy_with_best_rule_is_walked_first() {
        let engine = PolicyEngine::default();
        engine
            .add_policy(
                AccessPolicy::new("a", "allow everyone", Effect::Deny)
                    .with_rule(AccessRule::new("allow", "allow all", Effect::Allow, 50)),
            )
            .await
            .unwrap();
        engine
            .add_policy(
                AccessPolicy::new("b", "deny contractors", Effect::Allow).with_rule(
                    AccessRule::new("deny", "deny contractors", Effect::Deny, 5).with_condition(
                        AccessCondition::new(ConditionType::ForAnyValue, "userRoles", ["contractor"]),
                    ),
                ),
            )
            .await
            .unwrap();
        let meta = classify("x", "y", None);

        let mut contractor = noon("c");
        contractor.user_roles = vec!["contractor".to_owned()];
        let decision = engine.evaluate_access("s", &meta, &contractor).await;
        assert!(!decision.granted);
        assert_eq!(decision.applied_rules.len(), 1);
        assert_eq!(decision.applied_rules[0].policy_id, "b");

        let decision = engine.evaluate_access("s", &meta, &noon("staff")).await;
        assert!(decision.granted);
        assert_eq!(decision.applied_rules.len(), 2);
        assert_eq!(decision.applied_rules[1].rule_id, "allow");
    }

    #[tokio::test]
    async fn default_effect_comes_from_highest_precedence_policy() {
        let engine = PolicyEngine::default();
        engine
            .add_policy(
                AccessPolicy::new("a", "late", Effect::Allow)
                    .with_rule(AccessRule::new("r", "never", Effect::Allow, 100).with_condition(
                        AccessCondition::new(ConditionType::StringEquals, "userId", ["nobody"]),
                    )),
            )
            .await
            .unwrap();
        engine
            .add_policy(
                AccessPolicy::new("b", "early", Effect::Deny)
                    .with_rule(AccessRule::new("r", "never", Effect::Allow, 1).with_condition(
                        AccessCondition::new(ConditionType::StringEquals, "userId", ["nobody"]),
                    )),
            )
            .await
            .unwrap();
        let meta = classify("x", "y", None);
        let decision = engine.evaluate_access("s", &meta, &noon("u")).await;
        assert!(!decision.granted);
        assert!(decision.reason.ends_with("\"deny\""));
    }

    #[tokio::test]
    async fn inactive_rules_are_skipped_and_not_recorded() {
        let engine = PolicyEngine::default();
        engine
            .add_policy(
                AccessPolicy::new("p", "p", Effect::Allow).with_rule(
                    AccessRule::new("r", "off", Effect::Deny, 1).with_status(RuleStatus::Inactive),
                ),
            )
            .await
            .unwrap();
        let meta = classify("x", "y", None);
        let decision = engine.evaluate_access("s", &meta, &noon("u")).await;
        assert!(decision.granted);
        assert!(decision.applied_rules.is_empty());
    }

    #[tokio::test]
    async fn scope_filters() {
        let meta = classify("password", "abc123", None);
        let policy = AccessPolicy::new("p", "p", Effect::Allow);
        assert!(policy.clone().matching("prod/*").applies_to("prod/db", &meta));
        assert!(policy.clone().matching("prod/*").applies_to("prod/a/b", &meta));
        assert!(!policy.clone().matching("prod/*").applies_to("dev/db", &meta));
        assert!(policy.clone().matching("prod/db").applies_to("prod/db", &meta));
        assert!(!policy.clone().matching("prod/db").applies_to("prod/db2", &meta));
        assert!(policy.clone().for_levels(&[SecurityLevel::Secret]).applies_to("s", &meta));
        assert!(!policy.clone().for_levels(&[SecurityLevel::Public]).applies_to("s", &meta));
        assert!(
            policy
                .clone()
                .for_categories(&[SecretCategory::UserCredentials])
                .applies_to("s", &meta)
        );
        assert!(!policy.for_categories(&[SecretCategory::Database]).applies_to("s", &meta));
    }

    #[test]
    fn wildcard_patterns() {
        assert!(pattern_matches("prod/*", "prod/a/b"));
        assert!(pattern_matches("db*", "app/db-main"));
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("a.*", "a.b"));
        assert!(!pattern_matches("a.*", "axb"));
        assert!(!pattern_matches("exact", "not-exact"));
        assert!(pattern_matches("exact", "exact"));
    }

    #[tokio::test]
    async fn validation_rejects_bad_policies() {
        let engine = PolicyEngine::default();
        let empty_id = AccessPolicy::new("", "x", Effect::Allow);
        assert!(matches!(
            engine.add_policy(empty_id).await,
            Err(PolicyError::Invalid { .. })
        ));

        let dup = AccessPolicy::new("p", "x", Effect::Allow)
            .with_rule(AccessRule::new("r", "a", Effect::Allow, 1))
            .with_rule(AccessRule::new("r", "b", Effect::Deny, 2));
        assert!(engine.add_policy(dup).await.is_err());

        let bad_day = AccessPolicy::new("p", "x", Effect::Allow).with_rule(
            AccessRule::new("r", "a", Effect::Allow, 1).with_time_restrictions(TimeRestrictions {
                allowed_days: Some(vec![7]),
                ..TimeRestrictions::default()
            }),
        );
        assert!(engine.add_policy(bad_day).await.is_err());
    }

    #[tokio::test]
    async fn registry_operations() {
        let engine = PolicyEngine::default();
        engine.add_policy(deny_user_42()).await.unwrap();
        let stored = engine.get_policy("p1").await.unwrap().unwrap();
        assert!(stored.created_at.is_some());
        assert_eq!(engine.list_policies().await.unwrap().len(), 1);
        assert!(engine.remove_policy("p1").await.unwrap());
        assert!(!engine.remove_policy("p1").await.unwrap());
        assert!(engine.get_policy("p1").await.unwrap().is_none());
    }

    struct FailingStore;

    #[async_trait]
    impl PolicyStore for FailingStore {
        async fn put(&self, _policy: AccessPolicy) -> Result<(), StoreError> {
            Err(StoreError::Backend {
                reason: "offline".to_owned(),
            })
        }
        async fn get(&self, _id: &str) -> Result<Option<AccessPolicy>, StoreError> {
            Ok(None)
        }
        async fn delete(&self, _id: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn list(&self) -> Result<Vec<AccessPolicy>, StoreError> {
            Err(StoreError::Backend {
                reason: "offline".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let engine = PolicyEngine::new(Arc::new(FailingStore));
        let meta = classify("x", "y", None);
        let decision = engine.evaluate_access("s", &meta, &noon("u")).await;
        assert!(!decision.granted);
        assert!(decision.reason.starts_with("Policy evaluation failed:"));
        assert!(decision.reason.contains("offline"));
    }

    #[test]
    fn policy_json_shape() {
        let json = json!({
            "id": "p",
            "name": "from json",
            "defaultEffect": "deny",
            "secretPattern": "prod/*",
            "securityLevel": ["secret", "top_secret"],
            "rules": [{
                "id": "r",
                "name": "admins",
                "policyType": "rbac",
                "effect": "allow",
                "priority": 1,
                "conditions": [
                    { "type": "ForAnyValue", "key": "userRoles", "values": ["admin"] },
                    { "type": "IpAddress", "key": "sourceIp", "values": ["10.0.0.0/8"], "negate": false }
                ],
                "timeRestrictions": { "allowedHours": { "start": "09:00", "end": "17:00" }, "allowedDays": [1, 2, 3, 4, 5] }
            }]
        });
        let policy: AccessPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(policy.status, PolicyStatus::Active);
        assert_eq!(policy.version, "1.0");
        assert_eq!(policy.rules[0].conditions[1].kind, ConditionType::IpAddress);
        assert_eq!(policy.rules[0].policy_type, PolicyType::Rbac);
        assert!(policy.validate().is_ok());
    }
}
