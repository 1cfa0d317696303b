//! Versioned aspects, write proposals, and provenance stamps.
//!
//! An aspect is one named, versioned payload attached to an entity. The
//! authoritative store hands aspects out as [`VersionedAspect`] and accepts
//! writes as [`MetadataChangeProposal`]s stamped with an [`AuditStamp`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::urn::Urn;

/// Aspect holding a policy's definition.
pub const POLICY_INFO_ASPECT_NAME: &str = "dataHubPolicyInfo";

/// Aspect holding an upgrade step's completion record.
pub const UPGRADE_RESULT_ASPECT_NAME: &str = "dataHubUpgradeResult";

/// Run id used when the caller does not supply one.
pub const DEFAULT_RUN_ID: &str = "no-run-id-provided";

/// Who issued a write, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStamp {
    pub actor: Urn,
    pub time_ms: u64,
}

impl AuditStamp {
    /// Stamp attributed to the system actor.
    pub fn system(time_ms: u64) -> Self {
        Self {
            actor: Urn::system_actor(),
            time_ms,
        }
    }
}

/// Ingestion metadata carried alongside a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetadata {
    pub run_id: String,
    pub last_observed_ms: u64,
}

impl SystemMetadata {
    pub fn new(run_id: impl Into<String>, last_observed_ms: u64) -> Self {
        Self {
            run_id: run_id.into(),
            last_observed_ms,
        }
    }
}

/// Kind of change a proposal asserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Insert or replace the aspect payload.
    Upsert,
    /// Re-emit the current payload so derived projections are regenerated.
    /// Does not assert that the payload changed.
    Restate,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upsert => f.write_str("UPSERT"),
            Self::Restate => f.write_str("RESTATE"),
        }
    }
}

/// One aspect as stored, with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedAspect {
    pub name: String,
    /// Monotonic per (urn, aspect); starts at 1.
    pub version: u64,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_metadata: Option<SystemMetadata>,
}

/// Point-lookup response: the requested aspects that exist for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityResponse {
    pub urn: Urn,
    pub entity_type: String,
    pub aspects: BTreeMap<String, VersionedAspect>,
}

impl EntityResponse {
    pub fn aspect(&self, name: &str) -> Option<&VersionedAspect> {
        self.aspects.get(name)
    }
}

/// A write request against the authoritative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataChangeProposal {
    pub entity_urn: Urn,
    pub entity_type: String,
    pub aspect_name: String,
    pub change_type: ChangeType,
    pub system_metadata: SystemMetadata,
    /// Serialized aspect payload.
    pub aspect: serde_json::Value,
    /// Conditional write: reject unless the stored version equals this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_version_match: Option<u64>,
}

impl MetadataChangeProposal {
    /// Restate `aspect` unchanged for `urn`.
    ///
    /// The proposal is a pure function of the aspect as read: replaying it
    /// any number of times converges on the same stored state.
    pub fn restate(urn: &Urn, aspect: &VersionedAspect, system_metadata: SystemMetadata) -> Self {
        Self {
            entity_urn: urn.clone(),
            entity_type: urn.entity_type().to_string(),
            aspect_name: aspect.name.clone(),
            change_type: ChangeType::Restate,
            system_metadata,
            aspect: aspect.value.clone(),
            if_version_match: None,
        }
    }

    /// Upsert `value` as `aspect_name` for `urn`.
    pub fn upsert(
        urn: &Urn,
        aspect_name: impl Into<String>,
        value: serde_json::Value,
        system_metadata: SystemMetadata,
    ) -> Self {
        Self {
            entity_urn: urn.clone(),
            entity_type: urn.entity_type().to_string(),
            aspect_name: aspect_name.into(),
            change_type: ChangeType::Upsert,
            system_metadata,
            aspect: value,
            if_version_match: None,
        }
    }

    /// Make the write conditional on the stored version.
    #[must_use]
    pub fn with_version_match(mut self, version: u64) -> Self {
        self.if_version_match = Some(version);
        self
    }
}

/// What the store did with an accepted proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub urn: Urn,
    pub aspect_name: String,
    pub change_type: ChangeType,
    /// Stored version after the write.
    pub version: u64,
    /// Whether the stored payload changed.
    pub payload_changed: bool,
    /// Whether the search projection was regenerated as part of the write.
    pub projection_updated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urn::SYSTEM_ACTOR;
    use serde_json::json;

    fn policy_aspect() -> VersionedAspect {
        VersionedAspect {
            name: POLICY_INFO_ASPECT_NAME.to_string(),
            version: 3,
            value: json!({"displayName": "All Users", "state": "ACTIVE"}),
            system_metadata: None,
        }
    }

    #[test]
    fn restate_copies_payload_verbatim() {
        let urn = Urn::parse("urn:li:dataHubPolicy:p1").unwrap();
        let aspect = policy_aspect();
        let mcp = MetadataChangeProposal::restate(
            &urn,
            &aspect,
            SystemMetadata::new(DEFAULT_RUN_ID, 42),
        );
        assert_eq!(mcp.change_type, ChangeType::Restate);
        assert_eq!(mcp.entity_type, "dataHubPolicy");
        assert_eq!(mcp.aspect_name, POLICY_INFO_ASPECT_NAME);
        assert_eq!(mcp.aspect, aspect.value);
        assert_eq!(mcp.if_version_match, None);
    }

    #[test]
    fn restate_is_pure_in_payload() {
        let urn = Urn::parse("urn:li:dataHubPolicy:p1").unwrap();
        let aspect = policy_aspect();
        let a = MetadataChangeProposal::restate(&urn, &aspect, SystemMetadata::new("r", 1));
        let b = MetadataChangeProposal::restate(&urn, &aspect, SystemMetadata::new("r", 2));
        assert_eq!(a.aspect, b.aspect);
        assert_eq!(a.entity_urn, b.entity_urn);
        assert_ne!(a.system_metadata, b.system_metadata);
    }

    #[test]
    fn system_stamp_uses_system_actor() {
        let stamp = AuditStamp::system(7);
        assert_eq!(stamp.actor.to_string(), SYSTEM_ACTOR);
        assert_eq!(stamp.time_ms, 7);
    }

    #[test]
    fn change_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&ChangeType::Restate).unwrap(),
            "\"RESTATE\""
        );
        assert_eq!(ChangeType::Upsert.to_string(), "UPSERT");
    }

    #[test]
    fn version_match_is_omitted_when_unset() {
        let urn = Urn::parse("urn:li:dataHubPolicy:p1").unwrap();
        let mcp = MetadataChangeProposal::restate(
            &urn,
            &policy_aspect(),
            SystemMetadata::new("r", 1),
        );
        let json = serde_json::to_value(&mcp).unwrap();
        assert!(json.get("ifVersionMatch").is_none());
        let guarded = serde_json::to_value(mcp.with_version_match(3)).unwrap();
        assert_eq!(guarded["ifVersionMatch"], 3);
    }
}
