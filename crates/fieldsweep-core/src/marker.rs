//! Durable "this sweep has completed" records.
//!
//! A marker is an ordinary aspect (`dataHubUpgradeResult`) on the synthetic
//! entity `urn:li:dataHubUpgrade:<sweep id>`, so it shares the store's
//! durability and read-your-writes behaviour.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aspect::{
    AuditStamp, IngestResult, MetadataChangeProposal, SystemMetadata, UPGRADE_RESULT_ASPECT_NAME,
};
use crate::error::StoreError;
use crate::store::EntityStore;
use crate::urn::{UPGRADE_ENTITY_NAME, Urn};

/// Payload of the `dataHubUpgradeResult` aspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeResult {
    pub timestamp_ms: u64,
    #[serde(default)]
    pub result: BTreeMap<String, String>,
}

/// Reads and writes completion markers.
#[derive(Debug)]
pub struct CompletionMarker<E> {
    store: Arc<E>,
}

impl<E> Clone for CompletionMarker<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<E: EntityStore> CompletionMarker<E> {
    pub fn new(store: Arc<E>) -> Self {
        Self { store }
    }

    /// Synthetic identity holding the marker for `sweep_id`.
    pub fn upgrade_urn(sweep_id: &str) -> std::result::Result<Urn, StoreError> {
        Urn::new(UPGRADE_ENTITY_NAME, sweep_id).map_err(StoreError::from)
    }

    pub async fn exists(&self, sweep_id: &str) -> std::result::Result<bool, StoreError> {
        self.store.exists(&Self::upgrade_urn(sweep_id)?).await
    }

    /// Record completion. Rewriting an existing marker replaces its payload.
    pub async fn write(
        &self,
        sweep_id: &str,
        run_id: &str,
        timestamp_ms: u64,
        result: BTreeMap<String, String>,
    ) -> std::result::Result<IngestResult, StoreError> {
        let urn = Self::upgrade_urn(sweep_id)?;
        let payload = UpgradeResult {
            timestamp_ms,
            result,
        };
        let proposal = MetadataChangeProposal::upsert(
            &urn,
            UPGRADE_RESULT_ASPECT_NAME,
            serde_json::to_value(&payload)?,
            SystemMetadata::new(run_id, timestamp_ms),
        );
        let written = self
            .store
            .ingest_proposal(&proposal, &AuditStamp::system(timestamp_ms), true)
            .await?;
        info!(sweep_id, version = written.version, "completion marker written");
        Ok(written)
    }

    /// The stored marker, if any.
    pub async fn read(
        &self,
        sweep_id: &str,
    ) -> std::result::Result<Option<UpgradeResult>, StoreError> {
        let urn = Self::upgrade_urn(sweep_id)?;
        let names = BTreeSet::from([UPGRADE_RESULT_ASPECT_NAME.to_string()]);
        let Some(response) = self
            .store
            .get_entity(UPGRADE_ENTITY_NAME, &urn, &names)
            .await?
        else {
            return Ok(None);
        };
        response
            .aspect(UPGRADE_RESULT_ASPECT_NAME)
            .map(|a| serde_json::from_value(a.value.clone()))
            .transpose()
            .map_err(StoreError::from)
    }
}
