//! Search filters in disjunctive normal form.
//!
//! A [`Filter`] is an OR of [`ConjunctiveCriterion`]s, each an AND of
//! [`Criterion`]s. Backends either evaluate it directly against a document
//! ([`Filter::matches`]) or compile it into their own query language.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::projection::SearchDocument;

/// Comparison applied by a single criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    /// Field is absent or JSON `null`.
    IsNull,
    /// Field is present and not `null`.
    Exists,
    /// Field (or any element of an array field) equals one of `values`.
    Equal,
}

/// A single field test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub field: String,
    pub condition: Condition,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default)]
    pub negated: bool,
}

impl Criterion {
    pub fn is_null(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            condition: Condition::IsNull,
            values: Vec::new(),
            negated: false,
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            condition: Condition::Exists,
            values: Vec::new(),
            negated: false,
        }
    }

    pub fn equal(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            condition: Condition::Equal,
            values: vec![value.into()],
            negated: false,
        }
    }

    #[must_use]
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Evaluate against a document.
    pub fn matches(&self, doc: &SearchDocument) -> bool {
        let value = doc.get(&self.field).filter(|v| !v.is_null());
        let hit = match self.condition {
            Condition::IsNull => value.is_none(),
            Condition::Exists => value.is_some(),
            Condition::Equal => value.is_some_and(|v| value_equals_any(v, &self.values)),
        };
        hit != self.negated
    }
}

fn value_equals_any(value: &serde_json::Value, candidates: &[String]) -> bool {
    match value {
        serde_json::Value::Array(items) => items.iter().any(|v| value_equals_any(v, candidates)),
        serde_json::Value::String(s) => candidates.iter().any(|c| c == s),
        serde_json::Value::Null => false,
        other => {
            let rendered = other.to_string();
            candidates.iter().any(|c| *c == rendered)
        }
    }
}

/// AND of criteria.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConjunctiveCriterion {
    pub and: Vec<Criterion>,
}

impl ConjunctiveCriterion {
    pub fn new(and: Vec<Criterion>) -> Self {
        Self { and }
    }

    pub fn matches(&self, doc: &SearchDocument) -> bool {
        self.and.iter().all(|c| c.matches(doc))
    }
}

/// OR of conjunctions. An empty filter matches every document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub or: Vec<ConjunctiveCriterion>,
}

/// A filter references a field name backends cannot address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filter field name: {0:?}")]
pub struct InvalidFieldName(pub String);

impl Filter {
    /// Documents missing at least one of `fields`.
    ///
    /// A record lacking a single field still qualifies for a full restate.
    pub fn missing_any<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            or: fields
                .into_iter()
                .map(|f| ConjunctiveCriterion::new(vec![Criterion::is_null(f)]))
                .collect(),
        }
    }

    pub fn matches(&self, doc: &SearchDocument) -> bool {
        self.or.is_empty() || self.or.iter().any(|c| c.matches(doc))
    }

    /// Every field name referenced by the filter, in order of appearance.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.or
            .iter()
            .flat_map(|c| c.and.iter())
            .map(|c| c.field.as_str())
    }

    /// Check that all field names are addressable (`[A-Za-z0-9_.]+`).
    pub fn validate(&self) -> Result<(), InvalidFieldName> {
        for field in self.fields() {
            if !is_valid_field_name(field) {
                return Err(InvalidFieldName(field.to_string()));
            }
        }
        Ok(())
    }
}

pub(crate) fn is_valid_field_name(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
