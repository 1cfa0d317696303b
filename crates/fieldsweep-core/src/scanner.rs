//! Candidate discovery over the search index.
//!
//! A [`CandidateScanner`] turns a missing-field filter into successive pages
//! of candidate identities. It never mutates the index; termination is
//! signalled by an empty page or an absent continuation cursor.

use std::sync::Arc;

use tracing::trace;

use crate::error::SearchError;
use crate::filter::Filter;
use crate::search::{ScrollId, ScrollRequest, SearchFlags, SearchService};
use crate::urn::{Urn, UrnError};

/// An identity the index reports as lacking one or more target fields.
///
/// Held as the raw string the index returned; parsing is deferred to the
/// backfiller so one malformed identity cannot fail a whole page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    raw: String,
}

impl Candidate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn urn(&self) -> Result<Urn, UrnError> {
        Urn::parse(&self.raw)
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One page of candidates plus the cursor for the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidatePage {
    pub candidates: Vec<Candidate>,
    /// `None` once the scan is exhausted.
    pub next_cursor: Option<ScrollId>,
}

impl CandidatePage {
    /// No more pages follow this one.
    pub fn is_terminal(&self) -> bool {
        self.candidates.is_empty() || self.next_cursor.is_none()
    }
}

/// Pages through index entries matching a filter.
#[derive(Debug)]
pub struct CandidateScanner<S> {
    search: Arc<S>,
    entity_types: Vec<String>,
    filter: Filter,
    page_size: usize,
}

impl<S: SearchService> CandidateScanner<S> {
    pub fn new(
        search: Arc<S>,
        entity_types: Vec<String>,
        filter: Filter,
        page_size: usize,
    ) -> Self {
        Self {
            search,
            entity_types,
            filter,
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Request for the page after `cursor` (the first page for `None`).
    ///
    /// The query runs in full-text mode over `*` with no sort, so page order
    /// is the backend's default. Highlighting and aggregation are skipped and
    /// the cache is bypassed, so records repaired earlier in the same sweep
    /// are not served back from stale results.
    pub fn request(&self, cursor: Option<&ScrollId>) -> ScrollRequest {
        ScrollRequest {
            entity_types: self.entity_types.clone(),
            query: "*".to_string(),
            filter: Some(self.filter.clone()),
            sort: None,
            scroll_id: cursor.cloned(),
            facets: None,
            count: self.page_size,
            flags: SearchFlags::existence_scan(),
        }
    }

    /// Fetch one page. Index failures are returned unchanged.
    pub async fn next_page(
        &self,
        cursor: Option<&ScrollId>,
    ) -> std::result::Result<CandidatePage, SearchError> {
        let result = self
            .search
            .scroll_across_entities(&self.request(cursor))
            .await?;

        if result.num_entities == 0 || result.entities.is_empty() {
            return Ok(CandidatePage::default());
        }

        let candidates: Vec<Candidate> = result
            .entities
            .into_iter()
            .map(|e| Candidate::new(e.entity))
            .collect();
        trace!(
            count = candidates.len(),
            has_next = result.scroll_id.is_some(),
            "scroll page"
        );
        Ok(CandidatePage {
            candidates,
            next_cursor: result.scroll_id,
        })
    }
}
