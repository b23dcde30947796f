//! Compiled predicate tree and its in-memory evaluation over donors.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use donor_core::types::{Donor, DonorStatus, RetentionRisk};
use serde::Serialize;

use crate::rules::DonorField;

/// A typed value, already checked against the field it is compared with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Number(f64),
    Text(String),
    Date(DateTime<Utc>),
    Status(DonorStatus),
    Risk(RetentionRisk),
}

impl Scalar {
    fn ordering(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b),
            (Scalar::Date(a), Scalar::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Backend-neutral boolean expression over donor fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        field: DonorField,
        op: Comparison,
        value: Scalar,
    },
    OneOf {
        field: DonorField,
        values: Vec<Scalar>,
    },
    /// Case-insensitive substring test; `needle` is stored lowercased.
    Contains { field: DonorField, needle: String },
    /// The donor has at least one donation of type RECURRING.
    HasRecurringDonation,
}

impl Predicate {
    pub fn negate(self) -> Predicate {
        match self {
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    pub fn matches(&self, donor: &DonorFacts<'_>) -> bool {
        match self {
            Predicate::And(children) => children.iter().all(|p| p.matches(donor)),
            Predicate::Or(children) => children.iter().any(|p| p.matches(donor)),
            Predicate::Not(inner) => !inner.matches(donor),
            Predicate::Compare { field, op, value } => {
                compare(&donor.attribute(*field), *op, value)
            }
            Predicate::OneOf { field, values } => {
                let actual = donor.attribute(*field);
                values.iter().any(|v| actual == *v)
            }
            Predicate::Contains { field, needle } => match donor.attribute(*field) {
                Scalar::Text(text) => text.to_lowercase().contains(needle.as_str()),
                _ => false,
            },
            Predicate::HasRecurringDonation => donor.has_recurring,
        }
    }

    /// Whether evaluating this predicate needs the donor's donations.
    pub fn references_donations(&self) -> bool {
        match self {
            Predicate::And(children) | Predicate::Or(children) => {
                children.iter().any(Predicate::references_donations)
            }
            Predicate::Not(inner) => inner.references_donations(),
            Predicate::HasRecurringDonation => true,
            _ => false,
        }
    }
}

/// Null only equals null; ordering against null or across types is false.
fn compare(actual: &Scalar, op: Comparison, expected: &Scalar) -> bool {
    match op {
        Comparison::Eq => actual == expected,
        Comparison::Ne => actual != expected,
        Comparison::Gt => actual.ordering(expected) == Some(Ordering::Greater),
        Comparison::Gte => matches!(
            actual.ordering(expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Comparison::Lt => actual.ordering(expected) == Some(Ordering::Less),
        Comparison::Lte => matches!(
            actual.ordering(expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

/// A donor plus the facts derived from related records.
#[derive(Debug, Clone, Copy)]
pub struct DonorFacts<'a> {
    pub donor: &'a Donor,
    pub has_recurring: bool,
}

impl<'a> DonorFacts<'a> {
    pub fn new(donor: &'a Donor, has_recurring: bool) -> Self {
        Self {
            donor,
            has_recurring,
        }
    }

    pub fn attribute(&self, field: DonorField) -> Scalar {
        let donor = self.donor;
        match field {
            DonorField::Status => Scalar::Status(donor.status),
            DonorField::RetentionRisk => Scalar::Risk(donor.retention_risk),
            DonorField::TotalGifts => Scalar::Number(f64::from(donor.total_gifts)),
            DonorField::TotalAmount => Scalar::Number(donor.total_amount),
            DonorField::LastGiftDate => donor.last_gift_date.map_or(Scalar::Null, Scalar::Date),
            DonorField::Email => donor
                .email
                .as_ref()
                .map_or(Scalar::Null, |e| Scalar::Text(e.clone())),
            // Virtual: only reachable through `HasRecurringDonation`.
            DonorField::HasRecurring => Scalar::Null,
        }
    }
}
