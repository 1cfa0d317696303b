//! Sweep orchestration.
//!
//! A [`SweepController`] decides whether a sweep still needs to run, pulls
//! candidate pages strictly in sequence, backfills each candidate in scan
//! order, and writes the completion marker only once the scan is exhausted.
//!
//! The scan cursor lives only in the loop. A sweep interrupted part-way
//! leaves no marker, and the next invocation starts a fresh scan; records
//! repaired by the earlier attempt no longer match the filter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info};

use crate::aspect::POLICY_INFO_ASPECT_NAME;
use crate::backfiller::{BackfillOutcome, FieldBackfiller, Provenance};
use crate::config::SweepConfig;
use crate::error::{Result, StoreError};
use crate::filter::Filter;
use crate::marker::CompletionMarker;
use crate::scanner::CandidateScanner;
use crate::search::{ScrollId, SearchService};
use crate::store::EntityStore;
use crate::urn::POLICY_ENTITY_NAME;

/// What a sweep repairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepDefinition {
    /// Stable identity; keys the completion marker and log correlation.
    pub id: &'static str,
    pub entity_type: &'static str,
    /// Aspect whose restate regenerates the missing fields.
    pub aspect_name: &'static str,
    /// Index fields; a record missing any one of them is a candidate.
    pub missing_fields: &'static [&'static str],
}

impl SweepDefinition {
    pub fn filter(&self) -> Filter {
        Filter::missing_any(self.missing_fields.iter().copied())
    }
}

/// Regenerates the policy search fields added after policies were first
/// indexed.
pub const POLICY_FIELDS_SWEEP: SweepDefinition = SweepDefinition {
    id: "BackfillPolicyFieldsStep",
    entity_type: POLICY_ENTITY_NAME,
    aspect_name: POLICY_INFO_ASPECT_NAME,
    missing_fields: &["privilege", "editable", "state", "type"],
};

/// Counters for one sweep invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub sweep_id: String,
    pub run_id: String,
    /// The skip gate fired; nothing was scanned or written.
    pub skipped: bool,
    /// Scroll calls made, the terminal one included.
    pub scroll_calls: u64,
    /// Non-empty pages processed.
    pub pages_fetched: u64,
    pub candidates: u64,
    pub applied: u64,
    pub skipped_no_aspect: u64,
    pub skipped_parse_error: u64,
    pub failed: u64,
    /// The scan reached its terminal page.
    pub exhausted: bool,
    pub marker_written: bool,
    pub elapsed_ms: u64,
}

impl SweepReport {
    fn new(sweep_id: &str, run_id: &str) -> Self {
        Self {
            sweep_id: sweep_id.to_string(),
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: &BackfillOutcome) {
        self.candidates += 1;
        match outcome {
            BackfillOutcome::Applied { .. } => self.applied += 1,
            BackfillOutcome::SkippedNoAspect => self.skipped_no_aspect += 1,
            BackfillOutcome::SkippedParseError { .. } => self.skipped_parse_error += 1,
            BackfillOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Counts stored in the completion marker.
    pub fn to_result_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("runId".to_string(), self.run_id.clone()),
            ("pagesFetched".to_string(), self.pages_fetched.to_string()),
            ("candidates".to_string(), self.candidates.to_string()),
            ("applied".to_string(), self.applied.to_string()),
            ("skippedNoAspect".to_string(), self.skipped_no_aspect.to_string()),
            (
                "skippedParseError".to_string(),
                self.skipped_parse_error.to_string(),
            ),
            ("failed".to_string(), self.failed.to_string()),
        ])
    }
}

/// Drives one sweep end to end.
#[derive(Debug)]
pub struct SweepController<S, E> {
    definition: SweepDefinition,
    config: SweepConfig,
    scanner: CandidateScanner<S>,
    backfiller: FieldBackfiller<E>,
    marker: CompletionMarker<E>,
}

impl<S: SearchService, E: EntityStore> SweepController<S, E> {
    pub fn new(
        definition: SweepDefinition,
        config: SweepConfig,
        search: Arc<S>,
        store: Arc<E>,
    ) -> Self {
        let scanner = CandidateScanner::new(
            search,
            vec![definition.entity_type.to_string()],
            definition.filter(),
            config.batch_size.max(1),
        );
        let backfiller = FieldBackfiller::new(
            Arc::clone(&store),
            definition.entity_type,
            definition.aspect_name,
        )
        .with_version_guard(config.guard_concurrent_writes);
        Self {
            definition,
            config,
            scanner,
            backfiller,
            marker: CompletionMarker::new(store),
        }
    }

    pub fn definition(&self) -> &SweepDefinition {
        &self.definition
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn marker(&self) -> &CompletionMarker<E> {
        &self.marker
    }

    /// Pre-execution gate.
    ///
    /// Disabled sweeps skip without touching the store. With `reprocess`
    /// set the marker is ignored; otherwise an existing marker skips.
    pub async fn should_skip(&self) -> std::result::Result<bool, StoreError> {
        if !self.config.enabled {
            info!(sweep_id = self.definition.id, "sweep disabled; skipping");
            return Ok(true);
        }
        if self.config.reprocess {
            info!(
                sweep_id = self.definition.id,
                "reprocess requested; ignoring completion marker"
            );
            return Ok(false);
        }
        let done = self.marker.exists(self.definition.id).await?;
        if done {
            info!(
                sweep_id = self.definition.id,
                "sweep already completed; skipping"
            );
        }
        Ok(done)
    }

    /// Gate, then execute when the gate does not fire.
    pub async fn run(&self) -> Result<SweepReport> {
        if self.should_skip().await? {
            let mut report = SweepReport::new(self.definition.id, &self.config.run_id);
            report.skipped = true;
            return Ok(report);
        }
        self.execute().await
    }

    /// Scan and backfill until exhaustion, then mark completion.
    ///
    /// Per-candidate failures are counted, never returned. Scan and marker
    /// failures are returned and leave the marker unwritten.
    pub async fn execute(&self) -> Result<SweepReport> {
        let span = crate::sweep_span!(
            "sweep",
            sweep_id = self.definition.id,
            run_id = self.config.run_id.as_str()
        );
        self.execute_inner().instrument(span).await
    }

    async fn execute_inner(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport::new(self.definition.id, &self.config.run_id);
        let provenance = Provenance::system(self.config.run_id.clone(), epoch_ms_now());

        info!(
            batch_size = self.scanner.page_size(),
            max_pages = ?self.config.max_pages,
            "starting sweep"
        );

        let mut cursor: Option<ScrollId> = None;
        loop {
            if let Some(max) = self.config.max_pages {
                if report.pages_fetched >= max {
                    info!(pages = report.pages_fetched, "page bound reached; stopping early");
                    break;
                }
            }

            let page = self.scanner.next_page(cursor.as_ref()).await?;
            report.scroll_calls += 1;
            if page.candidates.is_empty() {
                report.exhausted = true;
                break;
            }
            report.pages_fetched += 1;
            let page_no = report.pages_fetched;

            for candidate in &page.candidates {
                let outcome = self.backfiller.backfill(candidate, &provenance).await;
                debug!(
                    page = page_no,
                    urn = %candidate,
                    outcome = outcome.label(),
                    "candidate processed"
                );
                report.record(&outcome);
            }

            info!(
                page = page_no,
                candidates = page.candidates.len(),
                applied = report.applied,
                failed = report.failed,
                "page processed"
            );

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    report.exhausted = true;
                    break;
                }
            }
        }

        if report.exhausted {
            report.elapsed_ms = elapsed_ms(started);
            self.marker
                .write(
                    self.definition.id,
                    &self.config.run_id,
                    epoch_ms_now(),
                    report.to_result_map(),
                )
                .await?;
            report.marker_written = true;
        }
        report.elapsed_ms = elapsed_ms(started);

        info!(
            pages = report.pages_fetched,
            candidates = report.candidates,
            applied = report.applied,
            skipped_no_aspect = report.skipped_no_aspect,
            skipped_parse_error = report.skipped_parse_error,
            failed = report.failed,
            exhausted = report.exhausted,
            elapsed_ms = report.elapsed_ms,
            "sweep finished"
        );
        Ok(report)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn epoch_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
