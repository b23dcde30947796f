//! Rule builder: fluent API for constructing segment rule documents.

use chrono::{DateTime, SecondsFormat, Utc};
use donor_core::types::{DonorStatus, RetentionRisk};
use serde_json::{json, Value};

use crate::rules::{DonorField, Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    Or,
}

/// Builds the canonical `{ "and": [...] }` / `{ "or": [...] }` form.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    combinator: Combinator,
    children: Vec<Value>,
}

impl RuleBuilder {
    pub fn new() -> Self {
        Self {
            combinator: Combinator::And,
            children: Vec::new(),
        }
    }

    /// Match when any child matches instead of all of them.
    pub fn any_of(mut self) -> Self {
        self.combinator = Combinator::Or;
        self
    }

    pub fn condition(mut self, field: DonorField, operator: Operator, value: Value) -> Self {
        self.children.push(json!({
            "field": field.name(),
            "operator": operator.name(),
            "value": value,
        }));
        self
    }

    pub fn status_equals(self, status: DonorStatus) -> Self {
        self.condition(DonorField::Status, Operator::Equals, json!(status))
    }

    pub fn risk_in(self, risks: &[RetentionRisk]) -> Self {
        self.condition(DonorField::RetentionRisk, Operator::In, json!(risks))
    }

    pub fn total_amount_at_least(self, amount: f64) -> Self {
        self.condition(
            DonorField::TotalAmount,
            Operator::GreaterThanOrEqual,
            json!(amount),
        )
    }

    pub fn gifts_equal(self, count: u32) -> Self {
        self.condition(DonorField::TotalGifts, Operator::Equals, json!(count))
    }

    pub fn has_recurring(self, flag: bool) -> Self {
        self.condition(DonorField::HasRecurring, Operator::Equals, json!(flag))
    }

    pub fn email_contains(self, needle: impl Into<String>) -> Self {
        self.condition(DonorField::Email, Operator::Contains, json!(needle.into()))
    }

    pub fn last_gift_before(self, cutoff: DateTime<Utc>) -> Self {
        self.condition(
            DonorField::LastGiftDate,
            Operator::Before,
            json!(cutoff.to_rfc3339_opts(SecondsFormat::Secs, true)),
        )
    }

    /// Nest another builder as a single child.
    pub fn group(mut self, nested: RuleBuilder) -> Self {
        self.children.push(nested.build());
        self
    }

    pub fn build(self) -> Value {
        match self.combinator {
            Combinator::And => json!({ "and": self.children }),
            Combinator::Or => json!({ "or": self.children }),
        }
    }
}

impl Default for RuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
