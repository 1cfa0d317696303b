//! Shared test infrastructure for fieldsweep-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::{Value, json};

use fieldsweep_core::aspect::{
    AuditStamp, ChangeType, EntityResponse, IngestResult, MetadataChangeProposal,
    POLICY_INFO_ASPECT_NAME, SystemMetadata,
};
use fieldsweep_core::config::SweepConfig;
use fieldsweep_core::error::{SearchError, StoreError};
use fieldsweep_core::memory::InMemoryBackend;
use fieldsweep_core::projection::SearchDocument;
use fieldsweep_core::search::{ScrollRequest, ScrollResult, SearchService};
use fieldsweep_core::store::EntityStore;
use fieldsweep_core::urn::Urn;
use fieldsweep_core::{POLICY_FIELDS_SWEEP, SweepController};

// ────────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────────

pub const POLICY_FIELDS: [&str; 4] = ["privilege", "editable", "state", "type"];

pub fn policy_urn(key: &str) -> Urn {
    Urn::new("dataHubPolicy", key).unwrap()
}

pub fn policy_info(name: &str) -> Value {
    json!({
        "displayName": name,
        "description": format!("{name} policy"),
        "type": "METADATA",
        "state": "ACTIVE",
        "privileges": ["VIEW_ENTITY_PAGE"],
        "actors": {"allUsers": true},
        "editable": true
    })
}

/// A document as an older projector wrote it: `missing` fields absent.
pub fn legacy_document(name: &str, missing: &[&str]) -> SearchDocument {
    let mut doc = json!({
        "name": name,
        "type": "METADATA",
        "state": "ACTIVE",
        "editable": true,
        "privilege": ["VIEW_ENTITY_PAGE"],
        "allUsers": true
    })
    .as_object()
    .cloned()
    .unwrap();
    for field in missing {
        doc.remove(*field);
    }
    doc
}

/// Store a policy and replace its projection with a legacy one.
pub async fn seed_policy(backend: &InMemoryBackend, key: &str, missing: &[&str]) {
    let urn = policy_urn(key);
    let mcp = MetadataChangeProposal::upsert(
        &urn,
        POLICY_INFO_ASPECT_NAME,
        policy_info(key),
        SystemMetadata::new("seed", 1),
    );
    backend
        .ingest_proposal(&mcp, &AuditStamp::system(1), true)
        .await
        .unwrap();
    if !missing.is_empty() {
        backend
            .put_raw_document(urn.to_string(), "dataHubPolicy", legacy_document(key, missing))
            .await;
    }
}

/// Index entry without any backing aspect.
pub async fn seed_orphan_document(backend: &InMemoryBackend, entity: &str) {
    backend
        .put_raw_document(entity, "dataHubPolicy", legacy_document("orphan", &POLICY_FIELDS))
        .await;
}

pub fn sweep_config(batch_size: usize) -> SweepConfig {
    SweepConfig {
        batch_size,
        run_id: "test-run".to_string(),
        ..SweepConfig::default()
    }
}

pub fn controller<S: SearchService, E: EntityStore>(
    search: &Arc<S>,
    store: &Arc<E>,
    config: SweepConfig,
) -> SweepController<S, E> {
    SweepController::new(
        POLICY_FIELDS_SWEEP,
        config,
        Arc::clone(search),
        Arc::clone(store),
    )
}

// ────────────────────────────────────────────────────────────────────
// Fault-injecting wrappers
// ────────────────────────────────────────────────────────────────────

/// Index wrapper that records requests and can fail chosen calls.
pub struct RecordingSearch<S> {
    inner: Arc<S>,
    requests: Mutex<Vec<ScrollRequest>>,
    /// Identities returned by each successful call, in call order.
    pages: Mutex<Vec<Vec<String>>>,
    /// 1-based call numbers that fail with `Unavailable`.
    fail_calls: Mutex<HashSet<usize>>,
}

impl<S: SearchService> RecordingSearch<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            requests: Mutex::new(Vec::new()),
            pages: Mutex::new(Vec::new()),
            fail_calls: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_call(&self, n: usize) {
        self.fail_calls.lock().unwrap().insert(n);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ScrollRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn pages(&self) -> Vec<Vec<String>> {
        self.pages.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.requests.lock().unwrap().clear();
        self.pages.lock().unwrap().clear();
        self.fail_calls.lock().unwrap().clear();
    }
}

impl<S: SearchService> SearchService for RecordingSearch<S> {
    async fn scroll_across_entities(
        &self,
        request: &ScrollRequest,
    ) -> Result<ScrollResult, SearchError> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        if self.fail_calls.lock().unwrap().contains(&n) {
            return Err(SearchError::Unavailable(format!("injected failure on call {n}")));
        }
        let result = self.inner.scroll_across_entities(request).await?;
        self.pages
            .lock()
            .unwrap()
            .push(result.entities.iter().map(|e| e.entity.clone()).collect());
        Ok(result)
    }
}

/// Store wrapper that records reads and proposals and can inject faults.
pub struct RecordingStore<E> {
    inner: Arc<E>,
    gets: Mutex<Vec<Urn>>,
    proposals: Mutex<Vec<MetadataChangeProposal>>,
    fail_ingest: Mutex<HashSet<Urn>>,
    /// Urns whose aspect is rewritten by a "concurrent writer" right after
    /// each read.
    race_after_read: Mutex<HashSet<Urn>>,
}

impl<E: EntityStore> RecordingStore<E> {
    pub fn new(inner: Arc<E>) -> Self {
        Self {
            inner,
            gets: Mutex::new(Vec::new()),
            proposals: Mutex::new(Vec::new()),
            fail_ingest: Mutex::new(HashSet::new()),
            race_after_read: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_ingest_for(&self, urn: Urn) {
        self.fail_ingest.lock().unwrap().insert(urn);
    }

    pub fn race_after_read(&self, urn: Urn) {
        self.race_after_read.lock().unwrap().insert(urn);
    }

    pub fn gets(&self) -> Vec<Urn> {
        self.gets.lock().unwrap().clone()
    }

    pub fn proposals(&self) -> Vec<MetadataChangeProposal> {
        self.proposals.lock().unwrap().clone()
    }

    pub fn proposals_of(&self, change_type: ChangeType) -> Vec<MetadataChangeProposal> {
        self.proposals()
            .into_iter()
            .filter(|p| p.change_type == change_type)
            .collect()
    }

    pub fn reset(&self) {
        self.gets.lock().unwrap().clear();
        self.proposals.lock().unwrap().clear();
    }
}

impl<E: EntityStore> EntityStore for RecordingStore<E> {
    async fn get_entity(
        &self,
        entity_type: &str,
        urn: &Urn,
        aspect_names: &BTreeSet<String>,
    ) -> Result<Option<EntityResponse>, StoreError> {
        self.gets.lock().unwrap().push(urn.clone());
        let response = self.inner.get_entity(entity_type, urn, aspect_names).await?;
        let race = self.race_after_read.lock().unwrap().contains(urn);
        if race {
            let concurrent = MetadataChangeProposal::upsert(
                urn,
                POLICY_INFO_ASPECT_NAME,
                json!({
                    "displayName": "edited concurrently",
                    "type": "METADATA",
                    "state": "INACTIVE"
                }),
                SystemMetadata::new("other-writer", 2),
            );
            self.inner
                .ingest_proposal(&concurrent, &AuditStamp::system(2), true)
                .await?;
        }
        Ok(response)
    }

    async fn ingest_proposal(
        &self,
        proposal: &MetadataChangeProposal,
        audit: &AuditStamp,
        synchronous: bool,
    ) -> Result<IngestResult, StoreError> {
        self.proposals.lock().unwrap().push(proposal.clone());
        if self
            .fail_ingest
            .lock()
            .unwrap()
            .contains(&proposal.entity_urn)
        {
            return Err(StoreError::Unavailable(format!(
                "injected ingest failure for {}",
                proposal.entity_urn
            )));
        }
        self.inner.ingest_proposal(proposal, audit, synchronous).await
    }

    async fn exists(&self, urn: &Urn) -> Result<bool, StoreError> {
        self.inner.exists(urn).await
    }
}
