//! Legacy shorthand rules: flat objects such as
//! `{"retentionRisk": ["HIGH"], "giftCountRange": {"min": 2}}` that predate
//! the `{field, operator, value}` form.
//!
//! Each recognised key expands to a fixed set of leaf conditions; the object
//! as a whole is their conjunction. Keys are expanded in a fixed order so the
//! normalized tree does not depend on JSON key order.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use donor_core::{RuleError, RuleErrorKind, RulePath};
use serde_json::{Map, Value};

use crate::rules::{json_type, Condition, DonorField, Operator, Rule};

/// Keys sharing a meaning. The first name wins when both are present.
const GIFT_COUNT_KEYS: [&str; 2] = ["giftCountRange", "totalGiftsRange"];
const GIFT_AMOUNT_KEYS: [&str; 2] = ["totalGiftAmountRange", "totalAmountRange"];

const KNOWN_KEYS: [&str; 9] = [
    "status",
    "retentionRisk",
    "giftCountRange",
    "totalGiftsRange",
    "totalGiftAmountRange",
    "totalAmountRange",
    "lastGiftDateRange",
    "daysSinceLastGift",
    "hasEmail",
];

pub(crate) fn normalize(
    object: &Map<String, Value>,
    path: &RulePath,
    now: DateTime<Utc>,
) -> Result<Rule, RuleError> {
    if let Some(unknown) = object.keys().find(|k| !KNOWN_KEYS.contains(&k.as_str())) {
        return Err(RuleError::new(
            path,
            RuleErrorKind::UnknownLegacyKey(unknown.clone()),
        ));
    }

    let mut leaves = Vec::new();

    if let Some((key, value)) = present(object, &["status"]) {
        leaves.push(enum_condition(DonorField::Status, value, &path.key(key))?);
    }
    if let Some((key, value)) = present(object, &["retentionRisk"]) {
        leaves.push(enum_condition(DonorField::RetentionRisk, value, &path.key(key))?);
    }
    if let Some((key, value)) = present(object, &GIFT_COUNT_KEYS) {
        range(DonorField::TotalGifts, value, &path.key(key), ["min", "max"], &mut leaves)?;
    }
    if let Some((key, value)) = present(object, &GIFT_AMOUNT_KEYS) {
        range(DonorField::TotalAmount, value, &path.key(key), ["min", "max"], &mut leaves)?;
    }
    if let Some((key, value)) = present(object, &["lastGiftDateRange"]) {
        range(DonorField::LastGiftDate, value, &path.key(key), ["start", "end"], &mut leaves)?;
    }
    if let Some((key, value)) = present(object, &["daysSinceLastGift"]) {
        days_since_last_gift(value, &path.key(key), now, &mut leaves)?;
    }
    if let Some((key, value)) = present(object, &["hasEmail"]) {
        let path = path.key(key);
        let Some(has_email) = value.as_bool() else {
            return Err(mismatch(key, "a boolean", value, &path));
        };
        let operator = if has_email {
            Operator::NotEquals
        } else {
            Operator::Equals
        };
        leaves.push(leaf(DonorField::Email, operator, Value::Null, &path));
    }

    Ok(Rule::And(leaves))
}

/// First alias carrying a usable value. Null and empty arrays count as absent.
fn present<'a>(
    object: &'a Map<String, Value>,
    aliases: &[&'static str],
) -> Option<(&'static str, &'a Value)> {
    aliases.iter().find_map(|key| match object.get(*key) {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) if items.is_empty() => None,
        Some(value) => Some((*key, value)),
    })
}

/// `"ACTIVE"` becomes `equals`, `["HIGH", "CRITICAL"]` becomes `in`.
fn enum_condition(field: DonorField, value: &Value, path: &RulePath) -> Result<Rule, RuleError> {
    match value {
        Value::String(_) => Ok(leaf(field, Operator::Equals, value.clone(), path)),
        Value::Array(_) => Ok(leaf(field, Operator::In, value.clone(), path)),
        other => Err(mismatch(field.name(), "a string or an array", other, path)),
    }
}

/// A bounds object becomes up to two inclusive comparisons; absent bounds
/// produce nothing.
fn range(
    field: DonorField,
    value: &Value,
    path: &RulePath,
    [lower, upper]: [&'static str; 2],
    leaves: &mut Vec<Rule>,
) -> Result<(), RuleError> {
    let Some(bounds) = value.as_object() else {
        return Err(RuleError::new(
            path,
            RuleErrorKind::InvalidShape(format!(
                "expected {{\"{lower}\", \"{upper}\"}}, got {}",
                json_type(value)
            )),
        ));
    };
    if let Some(extra) = bounds.keys().find(|k| *k != lower && *k != upper) {
        return Err(RuleError::new(
            path,
            RuleErrorKind::InvalidShape(format!("unexpected bound '{extra}'")),
        ));
    }

    for (bound, operator) in [
        (lower, Operator::GreaterThanOrEqual),
        (upper, Operator::LessThanOrEqual),
    ] {
        match bounds.get(bound) {
            None | Some(Value::Null) => {}
            Some(v) => leaves.push(leaf(field, operator, v.clone(), &path.key(bound))),
        }
    }
    Ok(())
}

/// `daysSinceLastGift: N` keeps donors whose last gift is at least N days
/// old. The `{min, max}` form bounds the age on both sides.
fn days_since_last_gift(
    value: &Value,
    path: &RulePath,
    now: DateTime<Utc>,
    leaves: &mut Vec<Rule>,
) -> Result<(), RuleError> {
    let days_ago = |days: &Value, path: &RulePath| -> Result<Value, RuleError> {
        let Some(days) = days.as_i64().filter(|d| *d >= 0) else {
            return Err(mismatch("daysSinceLastGift", "a non-negative integer", days, path));
        };
        let Some(cutoff) = Duration::try_days(days).and_then(|d| now.checked_sub_signed(d)) else {
            return Err(RuleError::new(
                path,
                RuleErrorKind::InvalidShape(format!("{days} days ago is out of the date range")),
            ));
        };
        Ok(Value::String(cutoff.to_rfc3339_opts(SecondsFormat::Secs, true)))
    };

    match value {
        Value::Object(bounds) => {
            if let Some(extra) = bounds.keys().find(|k| *k != "min" && *k != "max") {
                return Err(RuleError::new(
                    path,
                    RuleErrorKind::InvalidShape(format!("unexpected bound '{extra}'")),
                ));
            }
            // Older than `min` days means a last gift on or before now - min.
            if let Some(min) = bounds.get("min").filter(|v| !v.is_null()) {
                let path = path.key("min");
                let cutoff = days_ago(min, &path)?;
                leaves.push(leaf(
                    DonorField::LastGiftDate,
                    Operator::LessThanOrEqual,
                    cutoff,
                    &path,
                ));
            }
            if let Some(max) = bounds.get("max").filter(|v| !v.is_null()) {
                let path = path.key("max");
                let cutoff = days_ago(max, &path)?;
                leaves.push(leaf(
                    DonorField::LastGiftDate,
                    Operator::GreaterThanOrEqual,
                    cutoff,
                    &path,
                ));
            }
            Ok(())
        }
        other => {
            let cutoff = days_ago(other, path)?;
            leaves.push(leaf(
                DonorField::LastGiftDate,
                Operator::LessThanOrEqual,
                cutoff,
                path,
            ));
            Ok(())
        }
    }
}

fn leaf(field: DonorField, operator: Operator, value: Value, path: &RulePath) -> Rule {
    Rule::Condition(Condition {
        field,
        operator,
        value,
        origin: path.clone(),
    })
}

fn mismatch(field: &str, expected: &'static str, found: &Value, path: &RulePath) -> RuleError {
    RuleError::new(
        path,
        RuleErrorKind::TypeMismatch {
            field: field.to_string(),
            expected,
            found: json_type(found),
        },
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn conditions(rule: Rule) -> Vec<(DonorField, Operator, Value)> {
        let Rule::And(children) = rule else {
            panic!("legacy rules normalize to a conjunction");
        };
        children
            .into_iter()
            .map(|child| match child {
                Rule::Condition(c) => (c.field, c.operator, c.value),
                other => panic!("unexpected node {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_retention_risk_list_becomes_in() {
        let rule = Rule::parse(&json!({ "retentionRisk": ["HIGH", "CRITICAL"] })).unwrap();
        assert_eq!(
            conditions(rule),
            vec![(
                DonorField::RetentionRisk,
                Operator::In,
                json!(["HIGH", "CRITICAL"])
            )]
        );
    }

    #[test]
    fn test_status_scalar_becomes_equals() {
        let rule = Rule::parse(&json!({ "status": "LAPSED" })).unwrap();
        assert_eq!(
            conditions(rule),
            vec![(DonorField::Status, Operator::Equals, json!("LAPSED"))]
        );
    }

    #[test]
    fn test_range_omits_absent_bounds() {
        let rule = Rule::parse(&json!({ "totalAmountRange": { "min": 500 } })).unwrap();
        assert_eq!(
            conditions(rule),
            vec![(
                DonorField::TotalAmount,
                Operator::GreaterThanOrEqual,
                json!(500)
            )]
        );

        let rule = Rule::parse(&json!({ "giftCountRange": { "min": 2, "max": 10 } })).unwrap();
        assert_eq!(
            conditions(rule),
            vec![
                (DonorField::TotalGifts, Operator::GreaterThanOrEqual, json!(2)),
                (DonorField::TotalGifts, Operator::LessThanOrEqual, json!(10)),
            ]
        );
    }

    #[test]
    fn test_preferred_alias_wins() {
        let rule = Rule::parse(&json!({
            "giftCountRange": { "min": 3 },
            "totalGiftsRange": { "min": 99 },
        }))
        .unwrap();
        assert_eq!(
            conditions(rule),
            vec![(DonorField::TotalGifts, Operator::GreaterThanOrEqual, json!(3))]
        );

        let rule = Rule::parse(&json!({ "totalGiftsRange": { "max": 4 } })).unwrap();
        assert_eq!(
            conditions(rule),
            vec![(DonorField::TotalGifts, Operator::LessThanOrEqual, json!(4))]
        );

        let rule = Rule::parse(&json!({
            "totalGiftAmountRange": { "max": 100 },
            "totalAmountRange": { "max": 5 },
        }))
        .unwrap();
        assert_eq!(
            conditions(rule),
            vec![(DonorField::TotalAmount, Operator::LessThanOrEqual, json!(100))]
        );
    }

    #[test]
    fn test_days_since_last_gift() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap();
        let rule = Rule::parse_at(&json!({ "daysSinceLastGift": 30 }), now).unwrap();
        assert_eq!(
            conditions(rule),
            vec![(
                DonorField::LastGiftDate,
                Operator::LessThanOrEqual,
                json!("2024-05-31T12:00:00Z")
            )]
        );

        let rule =
            Rule::parse_at(&json!({ "daysSinceLastGift": { "min": 10, "max": 20 } }), now).unwrap();
        assert_eq!(
            conditions(rule),
            vec![
                (
                    DonorField::LastGiftDate,
                    Operator::LessThanOrEqual,
                    json!("2024-06-20T12:00:00Z")
                ),
                (
                    DonorField::LastGiftDate,
                    Operator::GreaterThanOrEqual,
                    json!("2024-06-10T12:00:00Z")
                ),
            ]
        );

        let err = Rule::parse_at(&json!({ "daysSinceLastGift": -1 }), now).unwrap_err();
        assert!(matches!(err.kind, RuleErrorKind::TypeMismatch { .. }));
        assert_eq!(err.path.to_string(), "$.daysSinceLastGift");
    }

    #[test]
    fn test_days_since_last_gift_out_of_range() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap();
        for (rules, path) in [
            (json!({ "daysSinceLastGift": i64::MAX }), "$.daysSinceLastGift"),
            (json!({ "daysSinceLastGift": 100_000_000 }), "$.daysSinceLastGift"),
            (
                json!({ "daysSinceLastGift": { "max": 100_000_000 } }),
                "$.daysSinceLastGift.max",
            ),
            (
                json!({ "daysSinceLastGift": { "min": 5, "max": i64::MAX } }),
                "$.daysSinceLastGift.max",
            ),
        ] {
            let err = Rule::parse_at(&rules, now).unwrap_err();
            assert!(matches!(err.kind, RuleErrorKind::InvalidShape(_)), "{rules}");
            assert_eq!(err.path.to_string(), path);
        }

        // Large but representable ages still compile.
        let rule = Rule::parse_at(&json!({ "daysSinceLastGift": 36_500 }), now).unwrap();
        assert_eq!(conditions(rule).len(), 1);
    }

    #[test]
    fn test_has_email() {
        let rule = Rule::parse(&json!({ "hasEmail": true })).unwrap();
        assert_eq!(
            conditions(rule),
            vec![(DonorField::Email, Operator::NotEquals, Value::Null)]
        );
        let rule = Rule::parse(&json!({ "hasEmail": false })).unwrap();
        assert_eq!(
            conditions(rule),
            vec![(DonorField::Email, Operator::Equals, Value::Null)]
        );

        let err = Rule::parse(&json!({ "hasEmail": "yes" })).unwrap_err();
        assert!(matches!(err.kind, RuleErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn test_keys_expand_in_fixed_order() {
        let rule = Rule::parse(&json!({
            "hasEmail": true,
            "status": "ACTIVE",
            "lastGiftDateRange": { "start": "2024-01-01", "end": "2024-12-31" },
        }))
        .unwrap();
        let fields: Vec<_> = conditions(rule).into_iter().map(|(f, op, _)| (f, op)).collect();
        assert_eq!(
            fields,
            vec![
                (DonorField::Status, Operator::Equals),
                (DonorField::LastGiftDate, Operator::GreaterThanOrEqual),
                (DonorField::LastGiftDate, Operator::LessThanOrEqual),
                (DonorField::Email, Operator::NotEquals),
            ]
        );
    }

    #[test]
    fn test_empty_and_null_keys_are_absent() {
        let rule = Rule::parse(&json!({ "retentionRisk": [], "status": null })).unwrap();
        assert!(conditions(rule).is_empty());
        assert_eq!(Rule::parse(&json!({})).unwrap(), Rule::And(vec![]));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = Rule::parse(&json!({ "status": "ACTIVE", "zipCode": "02139" })).unwrap_err();
        assert_eq!(err.kind, RuleErrorKind::UnknownLegacyKey("zipCode".into()));

        let err = Rule::parse(&json!({ "giftCountRange": { "min": 1, "avg": 2 } })).unwrap_err();
        assert!(matches!(err.kind, RuleErrorKind::InvalidShape(_)));
        assert_eq!(err.path.to_string(), "$.giftCountRange");

        let err = Rule::parse(&json!({ "giftCountRange": 5 })).unwrap_err();
        assert!(matches!(err.kind, RuleErrorKind::InvalidShape(_)));
    }
}
