//! Error types for fieldsweep-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::InvalidFieldName;
use crate::urn::{Urn, UrnError};

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Stable classification shared by the index and store boundaries.
///
/// The backfiller uses it to tell malformed candidates apart from failed
/// writes; the step runner uses it to decide whether a retry can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient; the same call may succeed later.
    Retryable,
    /// The identity or payload cannot be parsed.
    Format,
    /// A conditional write lost a race.
    Conflict,
    /// The request itself is wrong; retrying will not help.
    TerminalData,
    /// The backing service is down or misconfigured.
    Unavailable,
}

/// Main error type for fieldsweep-core
#[derive(Error, Debug)]
pub enum Error {
    /// Search index errors
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    /// Authoritative store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Error class of the underlying failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Search(e) => e.class(),
            Self::Store(e) => e.class(),
            Self::Config(_) | Self::Json(_) => ErrorClass::TerminalData,
            Self::Io(_) => ErrorClass::Retryable,
        }
    }
}

/// Errors raised by a [`SearchService`](crate::search::SearchService).
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("invalid scroll id: {0}")]
    InvalidScrollId(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] InvalidFieldName),

    #[error("invalid search request: {0}")]
    InvalidRequest(String),

    #[error("search backend unavailable: {0}")]
    Unavailable(String),

    #[error("search backend error: {0}")]
    Backend(String),
}

impl SearchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidScrollId(_) | Self::InvalidFilter(_) | Self::InvalidRequest(_) => {
                ErrorClass::TerminalData
            }
            Self::Unavailable(_) => ErrorClass::Unavailable,
            Self::Backend(_) => ErrorClass::Retryable,
        }
    }
}

impl From<rusqlite::Error> for SearchError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Errors raised by an [`EntityStore`](crate::store::EntityStore).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("malformed urn: {0}")]
    MalformedUrn(#[from] UrnError),

    #[error("urn {urn} does not belong to entity type {entity_type}")]
    EntityTypeMismatch { urn: Urn, entity_type: String },

    #[error("aspect {aspect} of {urn} failed validation: {reason}")]
    InvalidAspect {
        urn: Urn,
        aspect: String,
        reason: String,
    },

    #[error("version conflict on {urn}/{aspect}: expected {expected}, found {actual:?}")]
    VersionConflict {
        urn: Urn,
        aspect: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable error-class mapping for isolation and retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MalformedUrn(_) | Self::EntityTypeMismatch { .. } => ErrorClass::Format,
            Self::InvalidAspect { .. } | Self::Json(_) => ErrorClass::TerminalData,
            Self::VersionConflict { .. } => ErrorClass::Conflict,
            Self::Unavailable(_) => ErrorClass::Unavailable,
            Self::Database(_) => ErrorClass::Retryable,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_classes() {
        let urn = Urn::parse("urn:li:dataHubPolicy:p1").unwrap();
        assert_eq!(
            StoreError::MalformedUrn(UrnError::EmptyKey("x".into())).class(),
            ErrorClass::Format
        );
        assert_eq!(
            StoreError::VersionConflict {
                urn,
                aspect: "a".into(),
                expected: 1,
                actual: Some(2),
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            StoreError::Database("locked".into()).class(),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn crate_error_delegates_class() {
        let err: Error = SearchError::Unavailable("down".into()).into();
        assert_eq!(err.class(), ErrorClass::Unavailable);
        let err: Error = ConfigError::ValidationError("bad".into()).into();
        assert_eq!(err.class(), ErrorClass::TerminalData);
    }

    #[test]
    fn display_includes_context() {
        let err = Error::Search(SearchError::InvalidScrollId("zzz".into()));
        assert_eq!(err.to_string(), "Search error: invalid scroll id: zzz");
    }
}
