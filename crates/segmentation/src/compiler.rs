//! Rule compiler: turns a parsed [`Rule`] into a typed [`Predicate`].
//!
//! Compilation is pure: it checks every condition's value against the
//! field's type and rejects anything it cannot express, naming the offending
//! node. Nothing is cached; callers recompile from the stored document each
//! time they evaluate a segment.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use donor_core::types::{DonorStatus, RetentionRisk};
use donor_core::{RuleError, RuleErrorKind, RulePath};
use serde_json::Value;
use tracing::debug;

use crate::predicates::{Comparison, Predicate, Scalar};
use crate::rules::{json_type, Condition, DonorField, FieldKind, Operator, Rule};

/// Compile a stored rule document against the current time.
pub fn compile(document: &Value) -> Result<Predicate, RuleError> {
    RuleCompiler::new().compile_document(document)
}

#[derive(Debug, Clone, Copy)]
pub struct RuleCompiler {
    now: DateTime<Utc>,
}

impl RuleCompiler {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// A compiler resolving relative shorthand against a fixed instant.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn compile_document(&self, document: &Value) -> Result<Predicate, RuleError> {
        let rule = Rule::parse_at(document, self.now)?;
        self.compile(&rule)
    }

    pub fn compile(&self, rule: &Rule) -> Result<Predicate, RuleError> {
        match rule {
            Rule::And(children) => children
                .iter()
                .map(|c| self.compile(c))
                .collect::<Result<_, _>>()
                .map(Predicate::And),
            Rule::Or(children) => children
                .iter()
                .map(|c| self.compile(c))
                .collect::<Result<_, _>>()
                .map(Predicate::Or),
            Rule::Condition(condition) => {
                let predicate = compile_condition(condition)?;
                debug!(
                    path = %condition.origin,
                    field = condition.field.name(),
                    operator = condition.operator.name(),
                    "Compiled rule condition"
                );
                Ok(predicate)
            }
        }
    }
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_condition(condition: &Condition) -> Result<Predicate, RuleError> {
    let Condition {
        field,
        operator,
        value,
        origin,
    } = condition;
    let field = *field;

    // The only field that crosses into the donations relation.
    if field == DonorField::HasRecurring {
        return compile_has_recurring(*operator, value, origin);
    }

    let predicate = match operator {
        Operator::Equals | Operator::NotEquals => Predicate::Compare {
            field,
            op: if *operator == Operator::Equals {
                Comparison::Eq
            } else {
                Comparison::Ne
            },
            value: typed_value(field, value, origin)?,
        },
        Operator::In | Operator::NotIn => {
            let items: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                scalar => vec![scalar],
            };
            let values = items
                .into_iter()
                .map(|v| typed_value(field, v, origin))
                .collect::<Result<Vec<_>, _>>()?;
            let one_of = Predicate::OneOf { field, values };
            if *operator == Operator::In {
                one_of
            } else {
                one_of.negate()
            }
        }
        Operator::GreaterThan
        | Operator::GreaterThanOrEqual
        | Operator::LessThan
        | Operator::LessThanOrEqual => {
            if !matches!(
                field.kind(),
                FieldKind::Integer | FieldKind::Decimal | FieldKind::Date
            ) {
                return Err(unsupported(field, *operator, origin));
            }
            let op = match operator {
                Operator::GreaterThan => Comparison::Gt,
                Operator::GreaterThanOrEqual => Comparison::Gte,
                Operator::LessThan => Comparison::Lt,
                _ => Comparison::Lte,
            };
            Predicate::Compare {
                field,
                op,
                value: non_null(field, value, origin)?,
            }
        }
        Operator::Contains | Operator::NotContains => {
            if field.kind() != FieldKind::Text {
                return Err(unsupported(field, *operator, origin));
            }
            let Some(needle) = value.as_str() else {
                return Err(mismatch(field, "a string", value, origin));
            };
            let contains = Predicate::Contains {
                field,
                needle: needle.to_lowercase(),
            };
            if *operator == Operator::Contains {
                contains
            } else {
                contains.negate()
            }
        }
        Operator::Before | Operator::After => {
            if field.kind() != FieldKind::Date {
                return Err(unsupported(field, *operator, origin));
            }
            let op = if *operator == Operator::Before {
                Comparison::Lt
            } else {
                Comparison::Gt
            };
            Predicate::Compare {
                field,
                op,
                value: non_null(field, value, origin)?,
            }
        }
    };
    Ok(predicate)
}

fn compile_has_recurring(
    operator: Operator,
    value: &Value,
    origin: &RulePath,
) -> Result<Predicate, RuleError> {
    let field = DonorField::HasRecurring;
    let wanted = match operator {
        Operator::Equals | Operator::NotEquals => value
            .as_bool()
            .ok_or_else(|| mismatch(field, "a boolean", value, origin))?,
        other => return Err(unsupported(field, other, origin)),
    };
    let exists = wanted == (operator == Operator::Equals);
    Ok(if exists {
        Predicate::HasRecurringDonation
    } else {
        Predicate::HasRecurringDonation.negate()
    })
}

/// Check a raw value against the field's type.
fn typed_value(field: DonorField, value: &Value, origin: &RulePath) -> Result<Scalar, RuleError> {
    if value.is_null() {
        return if field.is_nullable() {
            Ok(Scalar::Null)
        } else {
            Err(mismatch(field, "a non-null value", value, origin))
        };
    }

    match field.kind() {
        FieldKind::Status => serde_json::from_value::<DonorStatus>(value.clone())
            .map(Scalar::Status)
            .map_err(|_| {
                mismatch(
                    field,
                    "one of ACTIVE, LAPSED, INACTIVE, DO_NOT_CONTACT",
                    value,
                    origin,
                )
            }),
        FieldKind::RetentionRisk => serde_json::from_value::<RetentionRisk>(value.clone())
            .map(Scalar::Risk)
            .map_err(|_| {
                mismatch(
                    field,
                    "one of LOW, MEDIUM, HIGH, CRITICAL, UNKNOWN",
                    value,
                    origin,
                )
            }),
        FieldKind::Integer | FieldKind::Decimal => value
            .as_f64()
            .map(Scalar::Number)
            .ok_or_else(|| mismatch(field, "a number", value, origin)),
        FieldKind::Date => {
            let Some(raw) = value.as_str() else {
                return Err(mismatch(field, "an ISO date string", value, origin));
            };
            parse_date(raw)
                .map(Scalar::Date)
                .ok_or_else(|| RuleError::new(origin, RuleErrorKind::InvalidDate(raw.to_string())))
        }
        FieldKind::Text => value
            .as_str()
            .map(|s| Scalar::Text(s.to_string()))
            .ok_or_else(|| mismatch(field, "a string", value, origin)),
        FieldKind::Flag => Err(mismatch(field, "a boolean", value, origin)),
    }
}

fn non_null(field: DonorField, value: &Value, origin: &RulePath) -> Result<Scalar, RuleError> {
    match typed_value(field, value, origin)? {
        Scalar::Null => Err(mismatch(field, "a non-null value", value, origin)),
        scalar => Ok(scalar),
    }
}

/// Accepts RFC 3339 timestamps, zone-less timestamps (taken as UTC) and
/// plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn mismatch(
    field: DonorField,
    expected: &'static str,
    found: &Value,
    origin: &RulePath,
) -> RuleError {
    RuleError::new(
        origin,
        RuleErrorKind::TypeMismatch {
            field: field.name().to_string(),
            expected,
            found: json_type(found),
        },
    )
}

fn unsupported(field: DonorField, operator: Operator, origin: &RulePath) -> RuleError {
    RuleError::new(
        origin,
        RuleErrorKind::UnsupportedOperator {
            field: field.name().to_string(),
            operator: operator.name().to_string(),
        },
    )
}
