//! Per-candidate repair.
//!
//! [`FieldBackfiller::backfill`] never fails past its own boundary: every
//! candidate ends in exactly one [`BackfillOutcome`], and the sweep only
//! counts them.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::aspect::{AuditStamp, MetadataChangeProposal, SystemMetadata};
use crate::error::ErrorClass;
use crate::scanner::Candidate;
use crate::store::EntityStore;

/// Provenance attached to every restate issued by one sweep run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub audit: AuditStamp,
    pub run_id: String,
}

impl Provenance {
    /// System-actor provenance stamped at `time_ms`.
    pub fn system(run_id: impl Into<String>, time_ms: u64) -> Self {
        Self {
            audit: AuditStamp::system(time_ms),
            run_id: run_id.into(),
        }
    }

    fn system_metadata(&self) -> SystemMetadata {
        SystemMetadata::new(self.run_id.clone(), self.audit.time_ms)
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackfillOutcome {
    /// A restate was accepted; the store now holds `version`.
    Applied { version: u64 },
    /// The entity has no such aspect; nothing to restate.
    SkippedNoAspect,
    /// The identity could not be parsed or resolved.
    SkippedParseError { reason: String },
    /// The read or the write failed.
    Failed { cause: String },
}

impl BackfillOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::SkippedNoAspect => "skipped_no_aspect",
            Self::SkippedParseError { .. } => "skipped_parse_error",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Restates one aspect of candidate entities from the authoritative store.
#[derive(Debug)]
pub struct FieldBackfiller<E> {
    store: Arc<E>,
    entity_type: String,
    aspect_name: String,
    guard_concurrent_writes: bool,
}

impl<E: EntityStore> FieldBackfiller<E> {
    pub fn new(
        store: Arc<E>,
        entity_type: impl Into<String>,
        aspect_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            entity_type: entity_type.into(),
            aspect_name: aspect_name.into(),
            guard_concurrent_writes: false,
        }
    }

    /// Make each restate conditional on the version it was read at.
    #[must_use]
    pub fn with_version_guard(mut self, enabled: bool) -> Self {
        self.guard_concurrent_writes = enabled;
        self
    }

    pub fn aspect_name(&self) -> &str {
        &self.aspect_name
    }

    /// Read the candidate's aspect and restate it unchanged.
    pub async fn backfill(
        &self,
        candidate: &Candidate,
        provenance: &Provenance,
    ) -> BackfillOutcome {
        let urn = match candidate.urn() {
            Ok(urn) => urn,
            Err(e) => {
                warn!(urn = %candidate, error = %e, "skipping candidate with malformed urn");
                return BackfillOutcome::SkippedParseError {
                    reason: e.to_string(),
                };
            }
        };

        let names = BTreeSet::from([self.aspect_name.clone()]);
        let response = match self.store.get_entity(&self.entity_type, &urn, &names).await {
            Ok(response) => response,
            Err(e) if e.class() == ErrorClass::Format => {
                warn!(urn = %urn, error = %e, "skipping candidate the store cannot resolve");
                return BackfillOutcome::SkippedParseError {
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                error!(
                    urn = %urn,
                    aspect = %self.aspect_name,
                    error = %e,
                    error_class = ?e.class(),
                    "failed to read aspect"
                );
                return BackfillOutcome::Failed {
                    cause: e.to_string(),
                };
            }
        };

        let Some(aspect) = response
            .as_ref()
            .and_then(|r| r.aspect(&self.aspect_name))
        else {
            debug!(urn = %urn, aspect = %self.aspect_name, "no aspect to restate");
            return BackfillOutcome::SkippedNoAspect;
        };

        let mut proposal =
            MetadataChangeProposal::restate(&urn, aspect, provenance.system_metadata());
        if self.guard_concurrent_writes {
            proposal = proposal.with_version_match(aspect.version);
        }

        match self
            .store
            .ingest_proposal(&proposal, &provenance.audit, true)
            .await
        {
            Ok(result) => {
                debug!(
                    urn = %urn,
                    aspect = %self.aspect_name,
                    version = result.version,
                    payload_changed = result.payload_changed,
                    outcome = "applied",
                    "restated aspect"
                );
                BackfillOutcome::Applied {
                    version: result.version,
                }
            }
            Err(e) => {
                error!(
                    urn = %urn,
                    aspect = %self.aspect_name,
                    error = %e,
                    error_class = ?e.class(),
                    "failed to restate aspect"
                );
                BackfillOutcome::Failed {
                    cause: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aspect::{ChangeType, POLICY_INFO_ASPECT_NAME, VersionedAspect};
    use crate::memory::InMemoryBackend;
    use crate::urn::Urn;
    use serde_json::json;

    fn policy() -> serde_json::Value {
        json!({
            "displayName": "Root",
            "type": "PLATFORM",
            "state": "ACTIVE",
            "privileges": ["MANAGE_POLICIES"]
        })
    }

    async fn seeded(key: &str, version: u64) -> (Arc<InMemoryBackend>, Urn) {
        let backend = Arc::new(InMemoryBackend::new());
        let urn = Urn::new("dataHubPolicy", key).unwrap();
        backend
            .put_raw_aspect(
                &urn,
                VersionedAspect {
                    name: POLICY_INFO_ASPECT_NAME.to_string(),
                    version,
                    value: policy(),
                    system_metadata: None,
                },
            )
            .await;
        (backend, urn)
    }

    fn backfiller(backend: &Arc<InMemoryBackend>) -> FieldBackfiller<InMemoryBackend> {
        FieldBackfiller::new(Arc::clone(backend), "dataHubPolicy", POLICY_INFO_ASPECT_NAME)
    }

    #[tokio::test]
    async fn restates_existing_aspect() {
        let (backend, urn) = seeded("p1", 4).await;
        let provenance = Provenance::system("run-1", 1_700_000_000_000);
        let outcome = backfiller(&backend)
            .backfill(&Candidate::new(urn.to_string()), &provenance)
            .await;
        assert_eq!(outcome, BackfillOutcome::Applied { version: 4 });

        let stored = backend.aspect(&urn, POLICY_INFO_ASPECT_NAME).await.unwrap();
        assert_eq!(stored.value, policy());
        let md = stored.system_metadata.unwrap();
        assert_eq!(md.run_id, "run-1");
        assert_eq!(md.last_observed_ms, 1_700_000_000_000);

        let stats = backend.stats().await;
        assert_eq!(stats.restates, 1);
        assert_eq!(stats.upserts, 0);
        let doc = backend.document(&urn.to_string()).await.unwrap();
        assert_eq!(doc["state"], "ACTIVE");
    }

    #[tokio::test]
    async fn malformed_urn_is_skipped_without_reads() {
        let backend = Arc::new(InMemoryBackend::new());
        let outcome = backfiller(&backend)
            .backfill(&Candidate::new("not-a-urn"), &Provenance::system("r", 0))
            .await;
        assert!(matches!(outcome, BackfillOutcome::SkippedParseError { .. }));
        assert_eq!(backend.stats().await.get_calls, 0);
    }

    #[tokio::test]
    async fn wrong_entity_type_is_a_parse_skip() {
        let backend = Arc::new(InMemoryBackend::new());
        let outcome = backfiller(&backend)
            .backfill(
                &Candidate::new("urn:li:corpuser:alice"),
                &Provenance::system("r", 0),
            )
            .await;
        assert!(matches!(outcome, BackfillOutcome::SkippedParseError { .. }));
    }

    #[tokio::test]
    async fn missing_aspect_is_skipped() {
        let backend = Arc::new(InMemoryBackend::new());
        let outcome = backfiller(&backend)
            .backfill(
                &Candidate::new("urn:li:dataHubPolicy:ghost"),
                &Provenance::system("r", 0),
            )
            .await;
        assert_eq!(outcome, BackfillOutcome::SkippedNoAspect);
        let stats = backend.stats().await;
        assert_eq!(stats.restates + stats.upserts, 0);
    }

    #[tokio::test]
    async fn guarded_write_carries_read_version() {
        let (backend, urn) = seeded("p1", 9).await;
        let outcome = backfiller(&backend)
            .with_version_guard(true)
            .backfill(&Candidate::new(urn.to_string()), &Provenance::system("r", 0))
            .await;
        assert_eq!(outcome, BackfillOutcome::Applied { version: 9 });
    }

    #[test]
    fn outcome_labels_and_serde() {
        let applied = BackfillOutcome::Applied { version: 2 };
        assert_eq!(applied.label(), "applied");
        assert!(applied.is_applied());
        assert_eq!(
            serde_json::to_value(&applied).unwrap(),
            json!({"outcome": "applied", "version": 2})
        );
        assert_eq!(
            BackfillOutcome::Failed { cause: "x".into() }.label(),
            "failed"
        );
        assert_eq!(ChangeType::Restate.to_string(), "RESTATE");
    }
}
