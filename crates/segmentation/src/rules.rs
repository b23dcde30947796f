//! Rule documents: the declarative JSON form of segment criteria.
//!
//! A stored rule document is one of three shapes: a leaf condition
//! (`{field, operator, value}`), a compound node (`{and: [...]}` or
//! `{or: [...]}`), or a legacy shorthand object. [`Rule::parse`] classifies
//! the document once and normalizes the legacy shape, so everything
//! downstream only ever sees the [`Rule`] union.

use chrono::{DateTime, Utc};
use donor_core::{RuleError, RuleErrorKind, RulePath};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::legacy;

/// Donor attributes a rule may reference. `HasRecurring` is virtual: it
/// tests the donor's donations rather than a column on the donor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DonorField {
    Status,
    RetentionRisk,
    TotalGifts,
    TotalAmount,
    LastGiftDate,
    Email,
    HasRecurring,
}

/// Value type of a field, which decides the operators it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Status,
    RetentionRisk,
    Integer,
    Decimal,
    Date,
    Text,
    Flag,
}

impl DonorField {
    pub const ALL: [DonorField; 7] = [
        DonorField::Status,
        DonorField::RetentionRisk,
        DonorField::TotalGifts,
        DonorField::TotalAmount,
        DonorField::LastGiftDate,
        DonorField::Email,
        DonorField::HasRecurring,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DonorField::Status => "status",
            DonorField::RetentionRisk => "retentionRisk",
            DonorField::TotalGifts => "totalGifts",
            DonorField::TotalAmount => "totalAmount",
            DonorField::LastGiftDate => "lastGiftDate",
            DonorField::Email => "email",
            DonorField::HasRecurring => "hasRecurring",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    pub fn kind(self) -> FieldKind {
        match self {
            DonorField::Status => FieldKind::Status,
            DonorField::RetentionRisk => FieldKind::RetentionRisk,
            DonorField::TotalGifts => FieldKind::Integer,
            DonorField::TotalAmount => FieldKind::Decimal,
            DonorField::LastGiftDate => FieldKind::Date,
            DonorField::Email => FieldKind::Text,
            DonorField::HasRecurring => FieldKind::Flag,
        }
    }

    /// Whether the donor attribute may be absent (null).
    pub fn is_nullable(self) -> bool {
        matches!(self.kind(), FieldKind::Date | FieldKind::Text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    Before,
    After,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Operator::Equals,
        Operator::NotEquals,
        Operator::In,
        Operator::NotIn,
        Operator::GreaterThan,
        Operator::GreaterThanOrEqual,
        Operator::LessThan,
        Operator::LessThanOrEqual,
        Operator::Contains,
        Operator::NotContains,
        Operator::Before,
        Operator::After,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "notEquals",
            Operator::In => "in",
            Operator::NotIn => "notIn",
            Operator::GreaterThan => "greaterThan",
            Operator::GreaterThanOrEqual => "greaterThanOrEqual",
            Operator::LessThan => "lessThan",
            Operator::LessThanOrEqual => "lessThanOrEqual",
            Operator::Contains => "contains",
            Operator::NotContains => "notContains",
            Operator::Before => "before",
            Operator::After => "after",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }
}

/// A single `{field, operator, value}` comparison.
///
/// `value` stays raw JSON until compilation, where it is checked against the
/// field's type. `origin` points back at the node in the stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: DonorField,
    pub operator: Operator,
    pub value: Value,
    pub origin: RulePath,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Condition(Condition),
    And(Vec<Rule>),
    Or(Vec<Rule>),
}

impl Rule {
    /// Parse a stored rule document, normalizing legacy shorthand.
    pub fn parse(document: &Value) -> Result<Rule, RuleError> {
        Self::parse_at(document, Utc::now())
    }

    /// Like [`Rule::parse`], resolving relative shorthand (`daysSinceLastGift`)
    /// against `now`.
    pub fn parse_at(document: &Value, now: DateTime<Utc>) -> Result<Rule, RuleError> {
        parse_node(document, &RulePath::root(), now)
    }
}

fn parse_node(node: &Value, path: &RulePath, now: DateTime<Utc>) -> Result<Rule, RuleError> {
    let Some(object) = node.as_object() else {
        return Err(RuleError::new(
            path,
            RuleErrorKind::InvalidShape(format!("expected an object, got {}", json_type(node))),
        ));
    };

    let has_and = object.contains_key("and");
    let has_or = object.contains_key("or");
    if has_and && has_or {
        return Err(RuleError::new(path, RuleErrorKind::AmbiguousCombinator));
    }
    if has_and || has_or {
        let key = if has_and { "and" } else { "or" };
        let children = parse_children(object, key, path, now)?;
        return Ok(if has_and {
            Rule::And(children)
        } else {
            Rule::Or(children)
        });
    }

    if ["field", "operator", "value"]
        .iter()
        .any(|k| object.contains_key(*k))
    {
        return parse_condition(object, path).map(Rule::Condition);
    }

    legacy::normalize(object, path, now)
}

fn parse_children(
    object: &Map<String, Value>,
    key: &'static str,
    path: &RulePath,
    now: DateTime<Utc>,
) -> Result<Vec<Rule>, RuleError> {
    if let Some(extra) = object.keys().find(|k| k.as_str() != key) {
        return Err(RuleError::new(
            path,
            RuleErrorKind::InvalidShape(format!("unexpected key '{extra}' on '{key}' node")),
        ));
    }

    let list_path = path.key(key);
    let Some(children) = object.get(key).and_then(Value::as_array) else {
        return Err(RuleError::new(
            &list_path,
            RuleErrorKind::InvalidShape(format!("'{key}' must be an array of rules")),
        ));
    };

    children
        .iter()
        .enumerate()
        .map(|(i, child)| parse_node(child, &list_path.index(i), now))
        .collect()
}

fn parse_condition(object: &Map<String, Value>, path: &RulePath) -> Result<Condition, RuleError> {
    let field_name = required_str(object, "field", path)?;
    let operator_name = required_str(object, "operator", path)?;
    let value = object
        .get("value")
        .ok_or_else(|| RuleError::new(path, RuleErrorKind::MissingKey("value")))?;

    let field = DonorField::from_name(field_name)
        .ok_or_else(|| RuleError::new(path, RuleErrorKind::UnknownField(field_name.to_string())))?;
    let operator = Operator::from_name(operator_name).ok_or_else(|| {
        RuleError::new(
            path,
            RuleErrorKind::UnknownOperator(operator_name.to_string()),
        )
    })?;

    Ok(Condition {
        field,
        operator,
        value: value.clone(),
        origin: path.clone(),
    })
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    key: &'static str,
    path: &RulePath,
) -> Result<&'a str, RuleError> {
    match object.get(key) {
        None | Some(Value::Null) => Err(RuleError::new(path, RuleErrorKind::MissingKey(key))),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(RuleError::new(
            path,
            RuleErrorKind::InvalidShape(format!("'{key}' must be a string, got {}", json_type(other))),
        )),
    }
}

/// Short JSON type name for error messages.
pub(crate) fn json_type(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string \"{s}\""),
        Value::Array(_) => "an array".into(),
        Value::Object(_) => "an object".into(),
    }
}
