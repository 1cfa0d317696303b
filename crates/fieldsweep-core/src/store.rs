//! Authoritative record store boundary.

use std::collections::BTreeSet;

use crate::aspect::{AuditStamp, EntityResponse, IngestResult, MetadataChangeProposal};
use crate::error::StoreError;
use crate::urn::Urn;

/// Source-of-truth store for entity aspects.
///
/// Writes regenerate the entity's search projection through the store's own
/// pipeline; callers never touch the index directly.
#[allow(async_fn_in_trait)]
pub trait EntityStore: Send + Sync {
    /// Fetch the named aspects of one entity.
    ///
    /// Returns `Ok(None)` when the entity has none of the requested
    /// aspects. Fails with [`StoreError::MalformedUrn`] or
    /// [`StoreError::EntityTypeMismatch`] when the identity is unusable.
    async fn get_entity(
        &self,
        entity_type: &str,
        urn: &Urn,
        aspect_names: &BTreeSet<String>,
    ) -> std::result::Result<Option<EntityResponse>, StoreError>;

    /// Apply a proposal.
    ///
    /// `RESTATE` keeps the stored version when the payload is unchanged and
    /// always regenerates the projection, so replaying it is harmless.
    /// With `synchronous = false` the projection may be deferred.
    async fn ingest_proposal(
        &self,
        proposal: &MetadataChangeProposal,
        audit: &AuditStamp,
        synchronous: bool,
    ) -> std::result::Result<IngestResult, StoreError>;

    /// Whether any aspect exists for `urn`.
    async fn exists(&self, urn: &Urn) -> std::result::Result<bool, StoreError>;
}

/// Entity-type check shared by backends.
pub(crate) fn check_entity_type(entity_type: &str, urn: &Urn) -> Result<(), StoreError> {
    if urn.entity_type() == entity_type {
        Ok(())
    } else {
        Err(StoreError::EntityTypeMismatch {
            urn: urn.clone(),
            entity_type: entity_type.to_string(),
        })
    }
}

/// Shared write decision: given the currently stored aspect (if any), what
/// version does the proposal produce and does the payload change?
pub(crate) fn plan_write(
    proposal: &MetadataChangeProposal,
    current: Option<(u64, &serde_json::Value)>,
) -> Result<WritePlan, StoreError> {
    if let Some(expected) = proposal.if_version_match {
        let actual = current.map(|(v, _)| v);
        if actual != Some(expected) {
            return Err(StoreError::VersionConflict {
                urn: proposal.entity_urn.clone(),
                aspect: proposal.aspect_name.clone(),
                expected,
                actual,
            });
        }
    }
    Ok(match current {
        Some((version, value)) if *value == proposal.aspect => WritePlan {
            version,
            payload_changed: false,
        },
        Some((version, _)) => WritePlan {
            version: version + 1,
            payload_changed: true,
        },
        None => WritePlan {
            version: 1,
            payload_changed: true,
        },
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WritePlan {
    pub version: u64,
    pub payload_changed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aspect::{SystemMetadata, VersionedAspect};
    use serde_json::json;

    fn urn() -> Urn {
        Urn::parse("urn:li:dataHubPolicy:p1").unwrap()
    }

    fn restate(value: serde_json::Value) -> MetadataChangeProposal {
        let aspect = VersionedAspect {
            name: "dataHubPolicyInfo".into(),
            version: 1,
            value,
            system_metadata: None,
        };
        MetadataChangeProposal::restate(&urn(), &aspect, SystemMetadata::new("r", 0))
    }

    #[test]
    fn identical_payload_keeps_version() {
        let value = json!({"state": "ACTIVE"});
        let plan = plan_write(&restate(value.clone()), Some((4, &value))).unwrap();
        assert_eq!(
            plan,
            WritePlan {
                version: 4,
                payload_changed: false
            }
        );
    }

    #[test]
    fn changed_payload_bumps_version() {
        let stored = json!({"state": "INACTIVE"});
        let plan = plan_write(&restate(json!({"state": "ACTIVE"})), Some((4, &stored))).unwrap();
        assert_eq!(plan.version, 5);
        assert!(plan.payload_changed);
    }

    #[test]
    fn first_write_is_version_one() {
        let plan = plan_write(&restate(json!({})), None).unwrap();
        assert_eq!(plan.version, 1);
    }

    #[test]
    fn version_match_guards_write() {
        let stored = json!({"state": "ACTIVE"});
        let guarded = restate(stored.clone()).with_version_match(3);
        let err = plan_write(&guarded, Some((4, &stored))).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 3,
                actual: Some(4),
                ..
            }
        ));
        assert!(plan_write(&guarded, None).is_err());
        let matching = restate(stored.clone()).with_version_match(4);
        assert!(plan_write(&matching, Some((4, &stored))).is_ok());
    }

    #[test]
    fn entity_type_check() {
        assert!(check_entity_type("dataHubPolicy", &urn()).is_ok());
        assert!(matches!(
            check_entity_type("dataset", &urn()),
            Err(StoreError::EntityTypeMismatch { .. })
        ));
    }
}
