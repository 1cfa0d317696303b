//! Search index boundary: filtered, cursor-paginated scans.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::SearchError;
use crate::filter::Filter;

/// Opaque continuation token for a scroll.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScrollId(pub String);

impl ScrollId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScrollId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keyset position carried inside the reference backends' scroll ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollPosition {
    /// Sort key of the last entity returned; the next page starts after it.
    pub after: String,
}

impl ScrollPosition {
    pub fn encode(&self) -> ScrollId {
        // Serializing a single-string struct cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        ScrollId(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(id: &ScrollId) -> Result<Self, SearchError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(id.as_str())
            .map_err(|e| SearchError::InvalidScrollId(format!("{id}: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SearchError::InvalidScrollId(format!("{id}: {e}")))
    }
}

/// Execution hints for a search call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFlags {
    pub fulltext: bool,
    pub skip_cache: bool,
    pub skip_highlighting: bool,
    pub skip_aggregates: bool,
}

impl SearchFlags {
    /// Flags for an existence-filtered page fetch: full-text mode with no
    /// caching, no highlighting and no aggregation.
    pub fn existence_scan() -> Self {
        Self {
            fulltext: true,
            skip_cache: true,
            skip_highlighting: true,
            skip_aggregates: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortCriterion {
    pub field: String,
    pub order: SortOrder,
}

/// Parameters of one scroll call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollRequest {
    pub entity_types: Vec<String>,
    pub query: String,
    pub filter: Option<Filter>,
    pub sort: Option<SortCriterion>,
    pub scroll_id: Option<ScrollId>,
    pub facets: Option<Vec<String>>,
    pub count: usize,
    pub flags: SearchFlags,
}

/// One hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEntity {
    /// Identity as stored in the index. Not guaranteed to parse.
    pub entity: String,
}

/// One page of a scroll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollResult {
    pub entities: Vec<SearchEntity>,
    /// Present when more results may follow.
    pub scroll_id: Option<ScrollId>,
    pub num_entities: usize,
}

/// Search index boundary used by sweeps.
///
/// Implementations must not mutate index state and must eventually return
/// an empty page or a `None` scroll id for any filter.
#[allow(async_fn_in_trait)]
pub trait SearchService: Send + Sync {
    async fn scroll_across_entities(
        &self,
        request: &ScrollRequest,
    ) -> std::result::Result<ScrollResult, SearchError>;
}

/// Validate the parts of a request every backend relies on.
pub(crate) fn validate_request(request: &ScrollRequest) -> Result<(), SearchError> {
    if request.count == 0 {
        return Err(SearchError::InvalidRequest("count must be >= 1".to_string()));
    }
    if request.entity_types.is_empty() {
        return Err(SearchError::InvalidRequest(
            "at least one entity type is required".to_string(),
        ));
    }
    if let Some(filter) = &request.filter {
        filter.validate()?;
    }
    Ok(())
}
