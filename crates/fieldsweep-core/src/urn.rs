//! Typed entity references.
//!
//! Every record in the authoritative store and every document in the search
//! index is keyed by an urn of the form `urn:li:<entityType>:<key>`. The
//! index hands identities back as raw strings, so parsing is the first
//! place a malformed candidate can surface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Urn scheme prefix shared by all entity references.
pub const URN_PREFIX: &str = "urn:li:";

/// Entity type of access policies.
pub const POLICY_ENTITY_NAME: &str = "dataHubPolicy";

/// Entity type of upgrade bookkeeping records (completion markers).
pub const UPGRADE_ENTITY_NAME: &str = "dataHubUpgrade";

/// Actor recorded on writes issued by system sweeps.
pub const SYSTEM_ACTOR: &str = "urn:li:corpuser:__datahub_system";

/// Reasons an urn string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrnError {
    #[error("urn must start with '{URN_PREFIX}': {0:?}")]
    MissingPrefix(String),

    #[error("urn has an empty entity type: {0:?}")]
    EmptyEntityType(String),

    #[error("urn has an empty key: {0:?}")]
    EmptyKey(String),

    #[error("urn entity type contains invalid characters: {0:?}")]
    InvalidEntityType(String),
}

/// A parsed entity reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Urn {
    entity_type: String,
    key: String,
}

impl Urn {
    /// Build an urn from its parts, validating both.
    pub fn new(entity_type: impl Into<String>, key: impl Into<String>) -> Result<Self, UrnError> {
        let entity_type = entity_type.into();
        let key = key.into();
        let rendered = format!("{URN_PREFIX}{entity_type}:{key}");
        validate_entity_type(&entity_type, &rendered)?;
        if key.trim().is_empty() {
            return Err(UrnError::EmptyKey(rendered));
        }
        Ok(Self { entity_type, key })
    }

    /// Parse the textual `urn:li:<entityType>:<key>` form.
    ///
    /// The key may itself contain `:` (tuple keys such as
    /// `urn:li:dataset:(urn:li:dataPlatform:hive,db.t,PROD)`), so only the
    /// first separator after the entity type is significant.
    pub fn parse(raw: &str) -> Result<Self, UrnError> {
        let rest = raw
            .strip_prefix(URN_PREFIX)
            .ok_or_else(|| UrnError::MissingPrefix(raw.to_string()))?;
        let (entity_type, key) = match rest.split_once(':') {
            Some(parts) => parts,
            None if rest.is_empty() => return Err(UrnError::EmptyEntityType(raw.to_string())),
            None => return Err(UrnError::EmptyKey(raw.to_string())),
        };
        validate_entity_type(entity_type, raw)?;
        if key.trim().is_empty() {
            return Err(UrnError::EmptyKey(raw.to_string()));
        }
        Ok(Self {
            entity_type: entity_type.to_string(),
            key: key.to_string(),
        })
    }

    /// The actor stamped on writes issued by system sweeps ([`SYSTEM_ACTOR`]).
    pub fn system_actor() -> Self {
        Self {
            entity_type: "corpuser".to_string(),
            key: "__datahub_system".to_string(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

fn validate_entity_type(entity_type: &str, raw: &str) -> Result<(), UrnError> {
    if entity_type.is_empty() {
        return Err(UrnError::EmptyEntityType(raw.to_string()));
    }
    if !entity_type.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(UrnError::InvalidEntityType(raw.to_string()));
    }
    Ok(())
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URN_PREFIX}{}:{}", self.entity_type, self.key)
    }
}

impl FromStr for Urn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Urn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Urn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
