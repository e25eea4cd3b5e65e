use std::{collections::HashSet, fmt, time::Duration};

use serde::Serialize;
use tracing::debug;

use crate::{
    embedding::QueryEncoder,
    error::{Error, Result},
    schema::RankProfile,
    store::{DEFAULT_TIMEOUT, IndexStore, QueryRequest, StoredHit},
};

pub const DEFAULT_TOP_K: usize = 3;

/// Per-engine query settings.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub rank_profile: RankProfile,
    /// Overrides the profile's rescore depth.
    pub rerank_count: Option<usize>,
    pub timeout: Duration,
    /// Ask the store for the stored image blob of each hit.
    pub include_image: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rank_profile: RankProfile::default(),
            rerank_count: None,
            timeout: DEFAULT_TIMEOUT,
            include_image: false,
        }
    }
}

/// A retrieved page, best first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedHit {
    /// 0-indexed position in the result list.
    pub rank: usize,
    pub score: f32,
    pub page_id: String,
    pub document_name: String,
    pub path: String,
    pub page_number: u32,
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Idle,
    QueryEmbedded,
    Candidates,
    Ranked,
    Returned,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Idle => "idle",
            Stage::QueryEmbedded => "query_embedded",
            Stage::Candidates => "candidates",
            Stage::Ranked => "ranked",
            Stage::Returned => "returned",
            Stage::Failed => "failed",
        })
    }
}

/// Answers one query at a time against an [`IndexStore`].
///
/// Holds no per-query state; the same engine can serve any number of
/// queries.
pub struct RetrievalEngine<'a> {
    store: &'a dyn IndexStore,
    config: RetrievalConfig,
}

impl<'a> RetrievalEngine<'a> {
    pub fn new(store: &'a dyn IndexStore, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve the `top_k` best pages for `query`.
    ///
    /// Rejects an empty query or a zero `top_k` before encoding anything.
    /// Issues exactly one store call; every store failure is reported as
    /// [`Error::RetrievalBackend`]. No hits is an empty success.
    pub fn retrieve(
        &self,
        encoder: &mut dyn QueryEncoder,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RankedHit>> {
        debug!(stage = %Stage::Idle, top_k, "retrieve");
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidQuery("query text is empty".into()));
        }
        if top_k == 0 {
            return Err(Error::InvalidQuery("top_k must be at least 1".into()));
        }

        let query_tensor = encoder.encode_query(query)?;
        debug!(
            stage = %Stage::QueryEmbedded,
            tokens = query_tensor.rows,
            "query encoded"
        );

        let request = QueryRequest {
            user_query: query.to_string(),
            hits: top_k,
            rank_profile: self.config.rank_profile,
            rerank_count: self.config.rerank_count,
            timeout: self.config.timeout,
            query_tensor,
            include_image: self.config.include_image,
        };
        let response = self.store.query(&request).map_err(|e| {
            let e = e.into_backend();
            debug!(stage = %Stage::Failed, error = %e, "store query failed");
            e
        })?;
        debug!(
            stage = %Stage::Candidates,
            hits = response.hits.len(),
            total = ?response.total_count,
            "store answered"
        );

        let hits = finalize(response.hits, top_k);
        debug!(stage = %Stage::Ranked, hits = hits.len(), "hits ranked");
        debug!(stage = %Stage::Returned, "retrieve done");
        Ok(hits)
    }
}

/// Deduplicate by page id (first occurrence wins), sort by descending
/// score keeping store order on ties, cut to `top_k` and number the ranks.
fn finalize(hits: Vec<StoredHit>, top_k: usize) -> Vec<RankedHit> {
    let mut seen = HashSet::new();
    let mut hits: Vec<StoredHit> = hits
        .into_iter()
        .filter(|h| seen.insert(h.page_id.clone()))
        .collect();
    hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    hits.truncate(top_k);

    hits.into_iter()
        .enumerate()
        .map(|(rank, h)| RankedHit {
            rank,
            score: h.relevance,
            page_id: h.page_id,
            document_name: h.document_name,
            path: h.path,
            page_number: h.page_number,
            image: h.image,
        })
        .collect()
}

/// Print hits for a terminal.
pub fn format_human(query: &str, hits: &[RankedHit]) {
    if hits.is_empty() {
        println!("No pages found for {query:?}.");
        return;
    }

    for h in hits {
        println!(
            "{:>3}. [{:.3}] {} p.{} #{}",
            h.rank,
            h.score,
            h.document_name,
            h.page_number + 1,
            &h.page_id[..h.page_id.len().min(8)]
        );
    }
    println!("\n{} page(s)", hits.len());
}
