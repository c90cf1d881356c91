//! Routing predicates.
//!
//! Predicates decide whether event data flows along an edge. They are the
//! same rules trigger filters use: exact equality, regex matching and
//! set-membership. A filter holds a list of predicates and passes when any
//! one of them matches.

use crate::error::PredicateError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::OnceLock;

/// A regular expression compiled on first use and kept for later
/// evaluations. Serializes as its source string.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Pattern {
    source: String,
    compiled: OnceLock<Regex>,
}

impl Pattern {
    /// Creates a pattern without compiling it.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            compiled: OnceLock::new(),
        }
    }

    /// The pattern source.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns the compiled regex, compiling it on the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is not a valid regex. Invalid patterns
    /// are not cached and fail on every call.
    pub fn regex(&self) -> Result<&Regex, PredicateError> {
        if let Some(regex) = self.compiled.get() {
            return Ok(regex);
        }
        let regex = compile(&self.source)?;
        Ok(self.compiled.get_or_init(|| regex))
    }
}

impl From<String> for Pattern {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.source
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

/// A single filter rule applied to a string subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Predicate {
    /// Subject equals the value exactly.
    Equals { value: String },
    /// Subject differs from the value.
    NotEquals { value: String },
    /// Subject matches the regular expression (unanchored).
    Matches { value: Pattern },
    /// Subject is one of the values.
    In { values: Vec<String> },
}

impl Predicate {
    /// Creates an `equals` predicate.
    #[must_use]
    pub fn equals(value: impl Into<String>) -> Self {
        Self::Equals {
            value: value.into(),
        }
    }

    /// Creates a `notEquals` predicate.
    #[must_use]
    pub fn not_equals(value: impl Into<String>) -> Self {
        Self::NotEquals {
            value: value.into(),
        }
    }

    /// Creates a `matches` predicate.
    #[must_use]
    pub fn matches(pattern: impl Into<String>) -> Self {
        Self::Matches {
            value: Pattern::new(pattern),
        }
    }

    /// Creates a set-membership predicate.
    #[must_use]
    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::In {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluates the predicate against a string subject.
    ///
    /// # Errors
    ///
    /// Returns an error if a `matches` pattern is not a valid regex.
    pub fn evaluate(&self, subject: &str) -> Result<bool, PredicateError> {
        match self {
            Self::Equals { value } => Ok(subject == value),
            Self::NotEquals { value } => Ok(subject != value),
            Self::Matches { value } => Ok(value.regex()?.is_match(subject)),
            Self::In { values } => Ok(values.iter().any(|v| v == subject)),
        }
    }

    /// Checks that the predicate can be evaluated. A valid `matches`
    /// pattern stays compiled for later evaluations.
    ///
    /// # Errors
    ///
    /// Returns an error if a `matches` pattern is not a valid regex.
    pub fn validate(&self) -> Result<(), PredicateError> {
        if let Self::Matches { value } = self {
            value.regex()?;
        }
        Ok(())
    }
}

fn compile(pattern: &str) -> Result<Regex, PredicateError> {
    Regex::new(pattern).map_err(|e| PredicateError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Returns true if any predicate matches the subject.
///
/// An empty predicate list matches nothing.
///
/// # Errors
///
/// Returns the first evaluation error encountered.
pub fn matches_any(predicates: &[Predicate], subject: &str) -> Result<bool, PredicateError> {
    for predicate in predicates {
        if predicate.evaluate(subject)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A predicate list bound to a location in event data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// JSON pointer (RFC 6901) into the data; the whole value when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Predicates, any of which may match.
    pub predicates: Vec<Predicate>,
}

impl Filter {
    /// Creates a filter over the whole data value.
    #[must_use]
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self {
            field: None,
            predicates,
        }
    }

    /// Creates a filter over a field selected by JSON pointer.
    #[must_use]
    pub fn on_field(field: impl Into<String>, predicates: Vec<Predicate>) -> Self {
        Self {
            field: Some(field.into()),
            predicates,
        }
    }

    /// Evaluates the filter against event data.
    ///
    /// Only strings, numbers and booleans can be matched; any other value
    /// (or a missing field) does not pass.
    ///
    /// # Errors
    ///
    /// Returns an error if a predicate cannot be evaluated.
    pub fn evaluate(&self, data: &JsonValue) -> Result<bool, PredicateError> {
        let selected = match &self.field {
            Some(pointer) => data.pointer(pointer),
            None => Some(data),
        };

        let Some(subject) = selected.and_then(subject_string) else {
            return Ok(false);
        };

        matches_any(&self.predicates, &subject)
    }

    /// Checks every predicate in the filter.
    ///
    /// # Errors
    ///
    /// Returns the first invalid predicate's error.
    pub fn validate(&self) -> Result<(), PredicateError> {
        self.predicates.iter().try_for_each(Predicate::validate)
    }
}

fn subject_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
