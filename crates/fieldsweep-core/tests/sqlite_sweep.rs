//! Sweeps against the SQLite backend, including resumption across reopen.

mod common;

use std::sync::Arc;

use common::{POLICY_FIELDS, legacy_document, policy_info, policy_urn, sweep_config};
use fieldsweep_core::aspect::{
    AuditStamp, MetadataChangeProposal, POLICY_INFO_ASPECT_NAME, SystemMetadata,
};
use fieldsweep_core::config::SweepConfig;
use fieldsweep_core::sqlite::SqliteBackend;
use fieldsweep_core::store::EntityStore;
use fieldsweep_core::{POLICY_FIELDS_SWEEP, SweepController};

async fn seed(backend: &SqliteBackend, key: &str, missing: &[&str]) {
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
            .put_raw_document(&urn.to_string(), "dataHubPolicy", legacy_document(key, missing))
            .await
            .unwrap();
    }
}

fn controller(
    backend: &Arc<SqliteBackend>,
    config: SweepConfig,
) -> SweepController<SqliteBackend, SqliteBackend> {
    SweepController::new(
        POLICY_FIELDS_SWEEP,
        config,
        Arc::clone(backend),
        Arc::clone(backend),
    )
}

#[tokio::test]
async fn sweep_repairs_documents_in_sqlite() {
    let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
    seed(&backend, "p1", &["state"]).await;
    seed(&backend, "p2", &[]).await;
    seed(&backend, "p3", &POLICY_FIELDS).await;

    let report = controller(&backend, sweep_config(1)).run().await.unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(report.applied, 2);
    // Two full single-entity pages, then the empty one.
    assert_eq!(report.scroll_calls, 3);
    assert!(report.marker_written);

    for key in ["p1", "p3"] {
        let doc = backend
            .document(&policy_urn(key).to_string())
            .await
            .unwrap()
            .unwrap();
        for field in POLICY_FIELDS {
            assert!(doc.contains_key(field), "{key} lacks {field}");
        }
    }

    let again = controller(&backend, sweep_config(1)).run().await.unwrap();
    assert!(again.skipped);
}

#[tokio::test]
async fn bounded_run_resumes_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sweep.db");

    {
        let backend = Arc::new(SqliteBackend::open(&path).unwrap());
        for i in 0..5 {
            seed(&backend, &format!("k{i}"), &["type"]).await;
        }
        let cfg = SweepConfig {
            max_pages: Some(1),
            ..sweep_config(2)
        };
        let report = controller(&backend, cfg).run().await.unwrap();
        assert_eq!(report.applied, 2);
        assert!(!report.exhausted);
        assert!(!report.marker_written);
    }

    let backend = Arc::new(SqliteBackend::open(&path).unwrap());
    let report = controller(&backend, sweep_config(2)).run().await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.candidates, 3);
    assert!(report.marker_written);

    let marker = controller(&backend, sweep_config(2))
        .marker()
        .read(POLICY_FIELDS_SWEEP.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.result["candidates"], "3");
    assert_eq!(marker.result["runId"], "test-run");
}
