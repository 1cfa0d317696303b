//! In-process store and index.
//!
//! [`InMemoryBackend`] implements both [`EntityStore`] and [`SearchService`]
//! over shared state, regenerating search documents on every write the way
//! a real store pipeline would. Raw documents can be staged directly to
//! model projections written by older projector versions.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::aspect::{
    AuditStamp, ChangeType, EntityResponse, IngestResult, MetadataChangeProposal, VersionedAspect,
};
use crate::error::{SearchError, StoreError};
use crate::projection::{Projection, SearchDocument, project};
use crate::search::{
    ScrollPosition, ScrollRequest, ScrollResult, SearchEntity, SearchService, SortOrder,
    validate_request,
};
use crate::store::{EntityStore, check_entity_type, plan_write};
use crate::urn::Urn;

/// Call counters, for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStats {
    pub scroll_calls: u64,
    pub get_calls: u64,
    pub exists_calls: u64,
    pub upserts: u64,
    pub restates: u64,
    pub projections_written: u64,
}

/// A document as held by the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub entity_type: String,
    pub document: SearchDocument,
}

#[derive(Debug, Default)]
struct MemoryState {
    aspects: BTreeMap<Urn, BTreeMap<String, VersionedAspect>>,
    /// Keyed by the identity string as indexed, which need not parse.
    documents: BTreeMap<String, IndexedDocument>,
    pending: Vec<(Urn, String)>,
    stats: BackendStats,
}

/// Shared in-memory store + index.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a document in the index without touching the store.
    pub async fn put_raw_document(
        &self,
        entity: impl Into<String>,
        entity_type: impl Into<String>,
        document: SearchDocument,
    ) {
        let mut state = self.state.lock().await;
        state.documents.insert(
            entity.into(),
            IndexedDocument {
                entity_type: entity_type.into(),
                document,
            },
        );
    }

    /// Write an aspect directly, bypassing proposals and projection.
    pub async fn put_raw_aspect(&self, urn: &Urn, aspect: VersionedAspect) {
        let mut state = self.state.lock().await;
        state
            .aspects
            .entry(urn.clone())
            .or_default()
            .insert(aspect.name.clone(), aspect);
    }

    pub async fn aspect(&self, urn: &Urn, name: &str) -> Option<VersionedAspect> {
        let state = self.state.lock().await;
        state.aspects.get(urn).and_then(|a| a.get(name)).cloned()
    }

    pub async fn document(&self, entity: &str) -> Option<SearchDocument> {
        let state = self.state.lock().await;
        state.documents.get(entity).map(|d| d.document.clone())
    }

    pub async fn stats(&self) -> BackendStats {
        self.state.lock().await.stats.clone()
    }

    /// Apply projections deferred by asynchronous ingestion.
    ///
    /// Returns the number of documents written.
    pub async fn flush_projections(&self) -> usize {
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.pending);
        let mut written = 0;
        for (urn, aspect_name) in pending {
            let value = state
                .aspects
                .get(&urn)
                .and_then(|a| a.get(&aspect_name))
                .map(|a| a.value.clone());
            if let Some(value) = value {
                if let Projection::Document(doc) = project(urn.entity_type(), &aspect_name, &value)
                {
                    write_document(&mut state, &urn, doc);
                    written += 1;
                }
            }
        }
        written
    }
}

fn write_document(state: &mut MemoryState, urn: &Urn, document: SearchDocument) {
    state.documents.insert(
        urn.to_string(),
        IndexedDocument {
            entity_type: urn.entity_type().to_string(),
            document,
        },
    );
    state.stats.projections_written += 1;
}

fn matches_query(query: &str, doc: &SearchDocument) -> bool {
    let query = query.trim();
    if query.is_empty() || query == "*" {
        return true;
    }
    let needle = query.to_lowercase();
    doc.values()
        .filter_map(|v| v.as_str())
        .any(|s| s.to_lowercase().contains(&needle))
}

impl SearchService for InMemoryBackend {
    async fn scroll_across_entities(
        &self,
        request: &ScrollRequest,
    ) -> std::result::Result<ScrollResult, SearchError> {
        validate_request(request)?;
        if let Some(sort) = &request.sort {
            if sort.field != "urn" || sort.order != SortOrder::Ascending {
                return Err(SearchError::InvalidRequest(format!(
                    "unsupported sort {}:{:?}; scrolls are ordered by urn ascending",
                    sort.field, sort.order
                )));
            }
        }
        let start = match &request.scroll_id {
            Some(id) => Bound::Excluded(ScrollPosition::decode(id)?.after),
            None => Bound::Unbounded,
        };

        let mut state = self.state.lock().await;
        state.stats.scroll_calls += 1;

        let entities: Vec<SearchEntity> = state
            .documents
            .range::<String, _>((start, Bound::Unbounded))
            .filter(|(_, d)| request.entity_types.iter().any(|t| *t == d.entity_type))
            .filter(|(_, d)| matches_query(&request.query, &d.document))
            .filter(|(_, d)| {
                request
                    .filter
                    .as_ref()
                    .is_none_or(|f| f.matches(&d.document))
            })
            .take(request.count)
            .map(|(entity, _)| SearchEntity {
                entity: entity.clone(),
            })
            .collect();

        let scroll_id = if entities.len() == request.count {
            entities.last().map(|last| {
                ScrollPosition {
                    after: last.entity.clone(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(ScrollResult {
            num_entities: entities.len(),
            entities,
            scroll_id,
        })
    }
}

impl EntityStore for InMemoryBackend {
    async fn get_entity(
        &self,
        entity_type: &str,
        urn: &Urn,
        aspect_names: &BTreeSet<String>,
    ) -> std::result::Result<Option<EntityResponse>, StoreError> {
        check_entity_type(entity_type, urn)?;
        let mut state = self.state.lock().await;
        state.stats.get_calls += 1;

        let aspects: BTreeMap<String, VersionedAspect> = state
            .aspects
            .get(urn)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|(name, _)| aspect_names.contains(*name))
                    .map(|(name, a)| (name.clone(), a.clone()))
                    .collect()
            })
            .unwrap_or_default();

        if aspects.is_empty() {
            return Ok(None);
        }
        Ok(Some(EntityResponse {
            urn: urn.clone(),
            entity_type: entity_type.to_string(),
            aspects,
        }))
    }

    async fn ingest_proposal(
        &self,
        proposal: &MetadataChangeProposal,
        audit: &AuditStamp,
        synchronous: bool,
    ) -> std::result::Result<IngestResult, StoreError> {
        let urn = &proposal.entity_urn;
        check_entity_type(&proposal.entity_type, urn)?;

        let projection = project(urn.entity_type(), &proposal.aspect_name, &proposal.aspect);
        if let Projection::Invalid(reason) = &projection {
            return Err(StoreError::InvalidAspect {
                urn: urn.clone(),
                aspect: proposal.aspect_name.clone(),
                reason: reason.clone(),
            });
        }

        let mut state = self.state.lock().await;
        let current = state
            .aspects
            .get(urn)
            .and_then(|a| a.get(&proposal.aspect_name))
            .map(|a| (a.version, a.value.clone()));
        let plan = plan_write(proposal, current.as_ref().map(|(v, value)| (*v, value)))?;

        tracing::trace!(
            urn = %urn,
            aspect = %proposal.aspect_name,
            change_type = %proposal.change_type,
            actor = %audit.actor,
            version = plan.version,
            "Applying proposal"
        );

        state.aspects.entry(urn.clone()).or_default().insert(
            proposal.aspect_name.clone(),
            VersionedAspect {
                name: proposal.aspect_name.clone(),
                version: plan.version,
                value: proposal.aspect.clone(),
                system_metadata: Some(proposal.system_metadata.clone()),
            },
        );
        match proposal.change_type {
            ChangeType::Upsert => state.stats.upserts += 1,
            ChangeType::Restate => state.stats.restates += 1,
        }

        let projection_updated = match projection {
            Projection::Document(doc) if synchronous => {
                write_document(&mut state, urn, doc);
                true
            }
            Projection::Document(_) => {
                state
                    .pending
                    .push((urn.clone(), proposal.aspect_name.clone()));
                false
            }
            Projection::NotIndexed | Projection::Invalid(_) => false,
        };

        Ok(IngestResult {
            urn: urn.clone(),
            aspect_name: proposal.aspect_name.clone(),
            change_type: proposal.change_type,
            version: plan.version,
            payload_changed: plan.payload_changed,
            projection_updated,
        })
    }

    async fn exists(&self, urn: &Urn) -> std::result::Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.stats.exists_calls += 1;
        Ok(state.aspects.get(urn).is_some_and(|a| !a.is_empty()))
    }
}
