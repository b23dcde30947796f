use std::fmt;

use thiserror::Error;
use uuid::Uuid;

pub type SegmentResult<T> = Result<T, SegmentError>;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Rule validation error: {0}")]
    Rule(#[from] RuleError),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl SegmentError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// True when the caller sent something wrong (rules, identifiers), as
    /// opposed to a failure on our side.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Rule(_) | Self::Invalid(_) | Self::NotFound { .. }
        )
    }
}

/// A malformed rule, located by its JSON path inside the rule document.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} at {path}")]
pub struct RuleError {
    pub path: RulePath,
    pub kind: RuleErrorKind,
}

impl RuleError {
    pub fn new(path: &RulePath, kind: RuleErrorKind) -> Self {
        Self {
            path: path.clone(),
            kind,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleErrorKind {
    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("node specifies both 'and' and 'or'")]
    AmbiguousCombinator,

    #[error("invalid rule shape: {0}")]
    InvalidShape(String),

    #[error("field '{field}' expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },

    #[error("'{0}' is not a valid date")]
    InvalidDate(String),

    #[error("operator '{operator}' is not supported on field '{field}'")]
    UnsupportedOperator { field: String, operator: String },

    #[error("unknown shorthand key '{0}'")]
    UnknownLegacyKey(String),
}

/// JSONPath-like location of a rule node, e.g. `$.and[1].or[0]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulePath(Vec<PathSegment>);

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

impl RulePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn key(&self, key: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.0.push(PathSegment::Key(key.into()));
        next
    }

    pub fn index(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.0.push(PathSegment::Index(index));
        next
    }
}

impl fmt::Display for RulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.0 {
            match segment {
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}
