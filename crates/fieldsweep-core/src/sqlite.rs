//! SQLite-backed store and index.
//!
//! Two tables share one database file:
//!
//! - `aspects`: the authoritative versioned payloads, one row per
//!   (urn, aspect).
//! - `search_documents`: the derived search projection, one row per
//!   indexed identity, regenerated on every write.
//!
//! Filters compile to `json_extract`/`json_each` predicates so scans never
//! materialise non-matching documents.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::aspect::{
    AuditStamp, EntityResponse, IngestResult, MetadataChangeProposal, SystemMetadata,
    VersionedAspect,
};
use crate::error::{SearchError, StoreError};
use crate::filter::{Condition, Criterion, Filter};
use crate::projection::{Projection, SearchDocument, project};
use crate::search::{
    ScrollPosition, ScrollRequest, ScrollResult, SearchEntity, SearchService, SortOrder,
    validate_request,
};
use crate::store::{EntityStore, check_entity_type, plan_write};
use crate::urn::Urn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS aspects (
    urn              TEXT    NOT NULL,
    aspect           TEXT    NOT NULL,
    version          INTEGER NOT NULL,
    payload          TEXT    NOT NULL,
    run_id           TEXT,
    last_observed_ms INTEGER,
    created_by       TEXT    NOT NULL,
    created_at_ms    INTEGER NOT NULL,
    PRIMARY KEY (urn, aspect)
);
CREATE TABLE IF NOT EXISTS search_documents (
    urn           TEXT    PRIMARY KEY,
    entity_type   TEXT    NOT NULL,
    document      TEXT    NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_search_documents_type ON search_documents (entity_type, urn);
CREATE TABLE IF NOT EXISTS pending_projections (
    urn    TEXT NOT NULL,
    aspect TEXT NOT NULL,
    PRIMARY KEY (urn, aspect)
);
";

/// Create tables and indexes if missing.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// SQLite store + index.
///
/// Statements run on tokio's blocking pool; the connection is shared with
/// those tasks behind a std mutex.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> std::result::Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> std::result::Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> std::result::Result<Self, StoreError> {
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection via `spawn_blocking`.
    ///
    /// `lost` builds the error reported when the task panics or the lock is
    /// poisoned by an earlier panic.
    async fn blocking<T, E, F>(&self, lost: fn(String) -> E, op: F) -> std::result::Result<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(&mut Connection) -> std::result::Result<T, E> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| lost(format!("connection lock poisoned: {e}")))?;
            op(&mut *guard)
        })
        .await
        .map_err(|e| lost(format!("task join: {e}")))?
    }

    /// Stage a document in the index without touching the store.
    pub async fn put_raw_document(
        &self,
        entity: &str,
        entity_type: &str,
        document: SearchDocument,
    ) -> std::result::Result<(), StoreError> {
        let entity = entity.to_string();
        let entity_type = entity_type.to_string();
        self.blocking(StoreError::Unavailable, move |conn| {
            upsert_document(conn, &entity, &entity_type, &document, epoch_ms_now())
        })
        .await
    }

    /// Fetch the indexed document for an identity.
    pub async fn document(
        &self,
        entity: &str,
    ) -> std::result::Result<Option<SearchDocument>, StoreError> {
        let entity = entity.to_string();
        self.blocking(StoreError::Unavailable, move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT document FROM search_documents WHERE urn = ?1",
                    [&entity],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    /// Apply projections deferred by asynchronous ingestion.
    pub async fn flush_projections(&self) -> std::result::Result<usize, StoreError> {
        self.blocking(StoreError::Unavailable, flush_projections_sync).await
    }
}

fn flush_projections_sync(conn: &mut Connection) -> std::result::Result<usize, StoreError> {
    let tx = conn.transaction()?;
    let pending: Vec<(String, String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT p.urn, p.aspect, a.payload
             FROM pending_projections p
             JOIN aspects a ON a.urn = p.urn AND a.aspect = p.aspect",
        )?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?
    };
    let now = epoch_ms_now();
    let mut written = 0;
    for (raw_urn, aspect, payload) in &pending {
        let urn = Urn::parse(raw_urn)?;
        let value: serde_json::Value = serde_json::from_str(payload)?;
        if let Projection::Document(doc) = project(urn.entity_type(), aspect, &value) {
            upsert_document(&tx, raw_urn, urn.entity_type(), &doc, now)?;
            written += 1;
        }
    }
    tx.execute("DELETE FROM pending_projections", [])?;
    tx.commit()?;
    Ok(written)
}

fn upsert_document(
    conn: &Connection,
    entity: &str,
    entity_type: &str,
    document: &SearchDocument,
    now_ms: u64,
) -> std::result::Result<(), StoreError> {
    let json = serde_json::to_string(document)?;
    conn.execute(
        "INSERT INTO search_documents (urn, entity_type, document, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(urn) DO UPDATE SET
             entity_type = excluded.entity_type,
             document = excluded.document,
             updated_at_ms = excluded.updated_at_ms",
        params![entity, entity_type, json, now_ms as i64],
    )?;
    Ok(())
}

/// Compiles a [`Filter`] into a SQL predicate over `search_documents.document`.
struct FilterSql {
    clause: String,
    params: Vec<SqlValue>,
}

impl FilterSql {
    fn compile(filter: &Filter) -> Self {
        let mut params = Vec::new();
        if filter.or.is_empty() {
            return Self {
                clause: "1".to_string(),
                params,
            };
        }
        let disjuncts: Vec<String> = filter
            .or
            .iter()
            .map(|conj| {
                if conj.and.is_empty() {
                    return "1".to_string();
                }
                let conjuncts: Vec<String> = conj
                    .and
                    .iter()
                    .map(|c| criterion_sql(c, &mut params))
                    .collect();
                format!("({})", conjuncts.join(" AND "))
            })
            .collect();
        Self {
            clause: format!("({})", disjuncts.join(" OR ")),
            params,
        }
    }
}

fn criterion_sql(criterion: &Criterion, params: &mut Vec<SqlValue>) -> String {
    // Field names are validated before compilation; quoting keeps dotted
    // names addressing a single flat key.
    let path = format!("$.\"{}\"", criterion.field);
    let base = match criterion.condition {
        Condition::IsNull => {
            params.push(SqlValue::Text(path));
            "json_extract(document, ?) IS NULL".to_string()
        }
        Condition::Exists => {
            params.push(SqlValue::Text(path));
            "json_extract(document, ?) IS NOT NULL".to_string()
        }
        Condition::Equal => {
            params.push(SqlValue::Text(path));
            let placeholders = vec!["?"; criterion.values.len().max(1)].join(", ");
            if criterion.values.is_empty() {
                params.push(SqlValue::Null);
            }
            for v in &criterion.values {
                params.push(SqlValue::Text(v.clone()));
            }
            format!(
                "EXISTS (SELECT 1 FROM json_each(document, ?) j WHERE \
                 (CASE j.type WHEN 'true' THEN 'true' WHEN 'false' THEN 'false' \
                 ELSE CAST(j.value AS TEXT) END) IN ({placeholders}))"
            )
        }
    };
    if criterion.negated {
        format!("NOT ({base})")
    } else {
        base
    }
}

impl SearchService for SqliteBackend {
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

        let mut params: Vec<SqlValue> = Vec::new();
        let type_placeholders = vec!["?"; request.entity_types.len()].join(", ");
        params.extend(request.entity_types.iter().cloned().map(SqlValue::Text));

        let mut sql = format!(
            "SELECT urn FROM search_documents WHERE entity_type IN ({type_placeholders})"
        );
        if let Some(id) = &request.scroll_id {
            let position = ScrollPosition::decode(id)?;
            sql.push_str(" AND urn > ?");
            params.push(SqlValue::Text(position.after));
        }
        let query = request.query.trim();
        if !query.is_empty() && query != "*" {
            sql.push_str(" AND instr(lower(document), lower(?)) > 0");
            params.push(SqlValue::Text(query.to_string()));
        }
        if let Some(filter) = &request.filter {
            let compiled = FilterSql::compile(filter);
            sql.push_str(" AND ");
            sql.push_str(&compiled.clause);
            params.extend(compiled.params);
        }
        sql.push_str(" ORDER BY urn ASC LIMIT ?");
        params.push(SqlValue::Integer(request.count as i64));

        let entities = self
            .blocking(SearchError::Backend, move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(params), |row| {
                        Ok(SearchEntity { entity: row.get(0)? })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

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

impl EntityStore for SqliteBackend {
    async fn get_entity(
        &self,
        entity_type: &str,
        urn: &Urn,
        aspect_names: &BTreeSet<String>,
    ) -> std::result::Result<Option<EntityResponse>, StoreError> {
        check_entity_type(entity_type, urn)?;
        let raw_urn = urn.to_string();
        let rows = self
            .blocking(StoreError::Unavailable, move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT aspect, version, payload, run_id, last_observed_ms
                     FROM aspects WHERE urn = ?1",
                )?;
                let rows = stmt
                    .query_map([raw_urn], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)? as u64,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut aspects = BTreeMap::new();
        for (name, version, payload, run_id, last_observed_ms) in rows {
            if !aspect_names.contains(&name) {
                continue;
            }
            let value = serde_json::from_str(&payload)?;
            let system_metadata = run_id.map(|run_id| SystemMetadata {
                run_id,
                last_observed_ms: last_observed_ms.unwrap_or(0),
            });
            aspects.insert(
                name.clone(),
                VersionedAspect {
                    name,
                    version,
                    value,
                    system_metadata,
                },
            );
        }

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

        let owned = proposal.clone();
        let audit = audit.clone();
        let (version, payload_changed, projection_updated) = self
            .blocking(StoreError::Unavailable, move |conn| {
                write_aspect(conn, &owned, &audit, projection, synchronous)
            })
            .await?;

        Ok(IngestResult {
            urn: urn.clone(),
            aspect_name: proposal.aspect_name.clone(),
            change_type: proposal.change_type,
            version,
            payload_changed,
            projection_updated,
        })
    }

    async fn exists(&self, urn: &Urn) -> std::result::Result<bool, StoreError> {
        let raw_urn = urn.to_string();
        self.blocking(StoreError::Unavailable, move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM aspects WHERE urn = ?1 LIMIT 1",
                    [raw_urn],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}

/// Versioned write plus projection inside one transaction.
///
/// Returns `(version, payload_changed, projection_updated)`.
fn write_aspect(
    conn: &mut Connection,
    proposal: &MetadataChangeProposal,
    audit: &AuditStamp,
    projection: Projection,
    synchronous: bool,
) -> std::result::Result<(u64, bool, bool), StoreError> {
    let urn = &proposal.entity_urn;
    let raw_urn = urn.to_string();
    let tx = conn.transaction()?;

    let current: Option<(u64, serde_json::Value)> = tx
        .query_row(
            "SELECT version, payload FROM aspects WHERE urn = ?1 AND aspect = ?2",
            params![raw_urn, proposal.aspect_name],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?)),
        )
        .optional()?
        .map(|(v, payload)| serde_json::from_str(&payload).map(|value| (v, value)))
        .transpose()?;
    let plan = plan_write(proposal, current.as_ref().map(|(v, value)| (*v, value)))?;

    tx.execute(
        "INSERT INTO aspects (urn, aspect, version, payload, run_id, last_observed_ms,
                              created_by, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(urn, aspect) DO UPDATE SET
             version = excluded.version,
             payload = excluded.payload,
             run_id = excluded.run_id,
             last_observed_ms = excluded.last_observed_ms,
             created_by = excluded.created_by,
             created_at_ms = excluded.created_at_ms",
        params![
            raw_urn,
            proposal.aspect_name,
            plan.version as i64,
            serde_json::to_string(&proposal.aspect)?,
            proposal.system_metadata.run_id,
            proposal.system_metadata.last_observed_ms as i64,
            audit.actor.to_string(),
            audit.time_ms as i64,
        ],
    )?;

    let projection_updated = match projection {
        Projection::Document(doc) if synchronous => {
            upsert_document(&tx, &raw_urn, urn.entity_type(), &doc, epoch_ms_now())?;
            true
        }
        Projection::Document(_) => {
            tx.execute(
                "INSERT OR IGNORE INTO pending_projections (urn, aspect) VALUES (?1, ?2)",
                params![raw_urn, proposal.aspect_name],
            )?;
            false
        }
        Projection::NotIndexed | Projection::Invalid(_) => false,
    };
    tx.commit()?;
    Ok((plan.version, plan.payload_changed, projection_updated))
}

fn epoch_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
