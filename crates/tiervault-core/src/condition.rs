//! Condition and time-restriction evaluation for access rules.
//!
//! Everything here is total: a missing lookup, an unparseable operand, or a
//! malformed window evaluates to "no match" instead of an error.
//!
//! Lookup keys:
//! - `userId`, `userRoles`, `sourceIp`, `requestMethod`, `resource`,
//!   `deviceId`, `userAgent`, `purpose`, `sessionId` read the context.
//! - `location.country`, `location.region`, `location.city` read the
//!   context location.
//! - `securityLevel`, `category`, `ownerId`, `riskScore`, `businessImpact`
//!   read the secret metadata.
//! - `user.<attr>` reads `userAttributes[attr]`; any other key reads
//!   `userAttributes[key]`. Dotted paths descend into nested objects when no
//!   flat key matches.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde_json::Value;

use crate::metadata::SecretMetadata;
use crate::policy::{AccessCondition, AccessContext, ConditionType, TimeRestrictions};

/// Why a rule's time restrictions rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRejection {
    NotYetValid,
    Expired,
    OutsideHours,
    OutsideDays,
}

impl fmt::Display for TimeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotYetValid => "rule not yet valid",
            Self::Expired => "rule expired",
            Self::OutsideHours => "outside allowed hours",
            Self::OutsideDays => "outside allowed days",
        })
    }
}

/// Check `restrictions` against `at`, in `at`'s own UTC offset.
///
/// # Errors
///
/// Returns the first restriction that `at` falls outside of.
pub fn check_time_restrictions(
    restrictions: &TimeRestrictions,
    at: DateTime<FixedOffset>,
) -> Result<(), TimeRejection> {
    let instant = at.with_timezone(&Utc);

    if restrictions.valid_from.is_some_and(|from| instant < from) {
        return Err(TimeRejection::NotYetValid);
    }
    if restrictions.valid_until.is_some_and(|until| instant > until) {
        return Err(TimeRejection::Expired);
    }

    if let Some(hours) = &restrictions.allowed_hours {
        let window = parse_clock(&hours.start).zip(parse_clock(&hours.end));
        let Some((start, end)) = window else {
            return Err(TimeRejection::OutsideHours);
        };
        let minute = at.hour() * 60 + at.minute();
        if !minute_in_window(minute, start, end) {
            return Err(TimeRejection::OutsideHours);
        }
    }

    if let Some(days) = &restrictions.allowed_days {
        let today = at.weekday().num_days_from_sunday();
        if !days.iter().any(|d| u32::from(*d) == today) {
            return Err(TimeRejection::OutsideDays);
        }
    }

    Ok(())
}

/// Inclusive window; `start > end` wraps past midnight.
#[must_use]
pub fn minute_in_window(minute: u32, start: u32, end: u32) -> bool {
    if start <= end {
        (start..=end).contains(&minute)
    } else {
        minute >= start || minute <= end
    }
}

/// Parse `"HH"` or `"HH:MM"` into minutes after midnight.
#[must_use]
pub fn parse_clock(s: &str) -> Option<u32> {
    let (hours, minutes) = match s.trim().split_once(':') {
        Some((h, m)) => (h, m),
        None => (s.trim(), "0"),
    };
    let hours: u32 = hours.trim().parse().ok()?;
    let minutes: u32 = minutes.trim().parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

/// Evaluate one condition, applying `negate`.
#[must_use]
pub fn evaluate_condition(
    condition: &AccessCondition,
    context: &AccessContext,
    metadata: &SecretMetadata,
) -> bool {
    let actual = lookup(&condition.key, context, metadata);
    let result = compare(condition.kind, actual.as_ref(), &condition.values);
    if condition.negate { !result } else { result }
}

/// Resolve a condition key against the request and the secret.
#[must_use]
pub fn lookup(key: &str, context: &AccessContext, metadata: &SecretMetadata) -> Option<Value> {
    match key {
        "userId" => text(&context.user_id),
        "userRoles" => Some(Value::Array(
            context
                .user_roles
                .iter()
                .map(|r| Value::String(r.clone()))
                .collect(),
        )),
        "sourceIp" => text(&context.source_ip),
        "requestMethod" => text(&context.request_method),
        "resource" => text(&context.resource),
        "deviceId" => optional(context.device_id.as_deref()),
        "userAgent" => optional(context.user_agent.as_deref()),
        "purpose" => optional(context.purpose.as_deref()),
        "sessionId" => optional(context.session_id.as_deref()),
        "location.country" => context.location.as_ref().map(|l| Value::String(l.country.clone())),
        "location.region" => context.location.as_ref().and_then(|l| optional(l.region.as_deref())),
        "location.city" => context.location.as_ref().and_then(|l| optional(l.city.as_deref())),
        "securityLevel" => text(metadata.security_level.as_str()),
        "category" => text(metadata.category.as_str()),
        "ownerId" => text(&metadata.owner_id),
        "riskScore" => metadata.risk_score.map(Value::from),
        "businessImpact" => metadata.business_impact.and_then(|b| text(b.as_str())),
        _ => {
            let attr = key.strip_prefix("user.").unwrap_or(key);
            attribute(&context.user_attributes, attr)
        }
    }
}

fn text(s: &str) -> Option<Value> {
    Some(Value::String(s.to_owned()))
}

fn optional(s: Option<&str>) -> Option<Value> {
    s.map(|v| Value::String(v.to_owned()))
}

fn attribute(attributes: &serde_json::Map<String, Value>, path: &str) -> Option<Value> {
    if let Some(value) = attributes.get(path) {
        return present(value);
    }
    if !path.contains('.') {
        return None;
    }

    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = attributes.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    present(current)
}

fn present(value: &Value) -> Option<Value> {
    (!value.is_null()).then(|| value.clone())
}

/// Compare an actual value against the condition's expected values.
#[must_use]
pub fn compare(kind: ConditionType, actual: Option<&Value>, expected: &[Value]) -> bool {
    let Some(actual) = actual else {
        return false;
    };

    match kind {
        ConditionType::StringEquals => {
            let actual = stringify(actual);
            expected.iter().any(|e| stringify(e) == actual)
        }
        ConditionType::StringContains => {
            let actual = stringify(actual).to_lowercase();
            expected
                .iter()
                .any(|e| actual.contains(&stringify(e).to_lowercase()))
        }
        ConditionType::NumericEquals => as_number(actual).is_some_and(|a| {
            expected
                .iter()
                .filter_map(as_number)
                .any(|e| (a - e).abs() < f64::EPSILON)
        }),
        ConditionType::NumericGreaterThan => {
            match (as_number(actual), expected.first().and_then(as_number)) {
                (Some(a), Some(e)) => a > e,
                _ => false,
            }
        }
        ConditionType::NumericLessThan => {
            match (as_number(actual), expected.first().and_then(as_number)) {
                (Some(a), Some(e)) => a < e,
                _ => false,
            }
        }
        ConditionType::Bool => as_bool(actual)
            .is_some_and(|a| expected.iter().filter_map(as_bool).any(|e| e == a)),
        ConditionType::IpAddress => {
            let actual = stringify(actual);
            expected.iter().any(|range| ip_matches(&actual, &stringify(range)))
        }
        ConditionType::DateTime => {
            let Some(at) = actual.as_str().and_then(parse_datetime) else {
                return false;
            };
            expected
                .iter()
                .any(|range| in_datetime_range(at, &stringify(range)))
        }
        ConditionType::ForAllValues => match actual {
            Value::Array(items) => {
                let items: Vec<String> = items.iter().map(stringify).collect();
                expected.iter().all(|e| items.contains(&stringify(e)))
            }
            scalar => {
                let actual = stringify(scalar);
                expected.iter().any(|e| stringify(e) == actual)
            }
        },
        ConditionType::ForAnyValue => match actual {
            Value::Array(items) => {
                let items: Vec<String> = items.iter().map(stringify).collect();
                expected.iter().any(|e| items.contains(&stringify(e)))
            }
            scalar => {
                let actual = stringify(scalar);
                expected.iter().any(|e| stringify(e) == actual)
            }
        },
    }
}

/// Exact address or CIDR membership. IPv4 and IPv6.
#[must_use]
pub fn ip_matches(ip: &str, range: &str) -> bool {
    let Ok(ip) = ip.trim().parse::<IpAddr>() else {
        return false;
    };

    let Some((network, prefix)) = range.trim().split_once('/') else {
        return range.trim().parse::<IpAddr>().is_ok_and(|r| r == ip);
    };
    let (Ok(network), Ok(prefix)) = (network.parse::<IpAddr>(), prefix.parse::<u32>()) else {
        return false;
    };

    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) if prefix <= 32 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) if prefix <= 128 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}

fn in_datetime_range(at: DateTime<FixedOffset>, range: &str) -> bool {
    let Some((start, end)) = range.split_once(',') else {
        return false;
    };
    match (parse_datetime(start), parse_datetime(end)) {
        (Some(start), Some(end)) => start <= at && at <= end,
        _ => false,
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s.trim()).ok()
}

/// String form used by string comparisons. Arrays join their elements with
/// commas (`["a", "b"]` becomes `a,b`), and null elements inside an array
/// become empty.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_owned(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => stringify(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}
