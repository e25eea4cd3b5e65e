//! Index stores: where fed pages live and where two-phase queries run.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{
    data_dir::DataDir,
    embedding::EmbeddingMatrix,
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    page::Page,
    page_id::PageId,
    reranker,
    schema::RankProfile,
    tantivy_index::{LexicalHit, PageIndex},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// One two-phase query.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Raw user text for the lexical first phase.
    pub user_query: String,
    /// Maximum number of hits to return.
    pub hits: usize,
    pub rank_profile: RankProfile,
    /// Overrides the profile's second-phase depth.
    pub rerank_count: Option<usize>,
    pub timeout: Duration,
    /// Float query-token vectors. Never quantized by the caller.
    pub query_tensor: EmbeddingMatrix,
    /// Return the stored image blob with each hit.
    pub include_image: bool,
}

impl QueryRequest {
    pub fn effective_rerank_count(&self) -> usize {
        self.rerank_count
            .unwrap_or_else(|| self.rank_profile.rerank_count())
    }
}

/// A hit as the store reports it, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredHit {
    pub page_id: String,
    pub relevance: f32,
    pub document_name: String,
    pub path: String,
    pub page_number: u32,
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub hits: Vec<StoredHit>,
    /// Total number of first-phase matches, when the store reports it.
    pub total_count: Option<u64>,
}

/// Outcome of feeding a batch of pages. Failures are per page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedReport {
    pub fed: usize,
    /// `(page id, reason)` for every page that was not stored.
    pub failed: Vec<(String, String)>,
}

impl FeedReport {
    pub fn merge(&mut self, other: FeedReport) {
        self.fed += other.fed;
        self.failed.extend(other.failed);
    }
}

/// Backend-neutral index store.
///
/// Feeding is an upsert keyed by page id, so feeding the same page twice
/// leaves one copy.
pub trait IndexStore: Send + Sync {
    fn feed(&self, pages: &[Page]) -> Result<FeedReport>;

    fn query(&self, request: &QueryRequest) -> Result<QueryResponse>;

    fn page_count(&self) -> Result<u64>;

    fn delete_pages(&self, ids: &[PageId]) -> Result<()>;
}

const WRITER_MEMORY: usize = 50_000_000;

/// Embedded store: tantivy for the lexical phase and stored fields, redb
/// for the packed patches. The second phase runs in-process.
#[derive(Debug)]
pub struct LocalStore {
    index: PageIndex,
    embeddings: EmbeddingDb,
}

impl LocalStore {
    pub fn new(index: PageIndex, embeddings: EmbeddingDb) -> Self {
        Self { index, embeddings }
    }

    pub fn open(data_dir: &DataDir) -> Result<Self> {
        Ok(Self::new(
            PageIndex::open(&data_dir.tantivy_dir()?)?,
            EmbeddingDb::open(&data_dir.embeddings_db())?,
        ))
    }

    /// Open for querying only. Takes no redb writer lock, so several
    /// retrieving processes can share one data directory.
    pub fn open_read_only(data_dir: &DataDir) -> Result<Self> {
        Ok(Self::new(
            PageIndex::open(&data_dir.tantivy_dir()?)?,
            EmbeddingDb::open_read_only(&data_dir.embeddings_db())?,
        ))
    }
}

/// `None` when the timeout is too large to represent, i.e. no deadline.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(at) if Instant::now() > at => {
            Err(Error::RetrievalBackend("query timed out".into()))
        }
        _ => Ok(()),
    }
}

impl IndexStore for LocalStore {
    fn feed(&self, pages: &[Page]) -> Result<FeedReport> {
        let mut report = FeedReport::default();
        if pages.is_empty() {
            return Ok(report);
        }

        // Patches go in first so a lexical match never lacks them.
        let entries: Vec<_> = pages
            .iter()
            .map(|p| (p.id.numeric, &p.embedding))
            .collect();
        self.embeddings.batch_store(&entries)?;

        let mut writer = self.index.writer(WRITER_MEMORY)?;
        for page in pages {
            match self.index.add_page(&writer, page) {
                Ok(()) => report.fed += 1,
                Err(e) => {
                    warn!(page = %page.id, error = %e, "failed to feed page");
                    report.failed.push((page.id.hex.clone(), e.to_string()));
                }
            }
        }
        writer.commit()?;

        Ok(report)
    }

    fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let deadline = deadline_after(request.timeout);
        let depth = request.effective_rerank_count();
        let limit = request.hits.max(depth);

        let candidates = self.index.search(
            &request.user_query,
            limit,
            request.include_image,
        )?;
        let total_count = self.index.count(&request.user_query)? as u64;
        debug!(candidates = candidates.len(), depth, "first phase done");
        check_deadline(deadline)?;

        let ids: Vec<u64> =
            candidates.iter().take(depth).map(|c| c.num_id).collect();
        let loaded: std::collections::HashMap<u64, _> = self
            .embeddings
            .batch_load(&ids)?
            .into_iter()
            .filter_map(|(id, p)| p.map(|p| (id, p)))
            .collect();

        let profile = request.rank_profile;
        let query = &request.query_tensor;
        let first_phase: Vec<(LexicalHit, f32)> = candidates
            .into_iter()
            .map(|c| {
                let s = c.score;
                (c, s)
            })
            .collect();

        let ranked = reranker::rank_two_phase(first_phase, depth, |hit| {
            check_deadline(deadline)?;
            match loaded.get(&hit.num_id) {
                Some(patches) => {
                    reranker::score(profile, query, patches).map(Some)
                }
                None => {
                    warn!(page = %hit.id, "no stored patches, dropping hit");
                    Ok(None)
                }
            }
        })?;
        debug!(rescored = ranked.rescored, "second phase done");

        let hits = ranked
            .ranked
            .into_iter()
            .take(request.hits)
            .map(|(hit, relevance)| StoredHit {
                page_id: hit.id,
                relevance,
                document_name: hit.name,
                path: hit.path,
                page_number: hit.page_number,
                image: hit.image,
            })
            .collect();

        Ok(QueryResponse {
            hits,
            total_count: Some(total_count),
        })
    }

    fn page_count(&self) -> Result<u64> {
        self.index.num_pages()
    }

    fn delete_pages(&self, ids: &[PageId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut writer = self.index.writer(WRITER_MEMORY)?;
        for id in ids {
            self.index.delete_page(&writer, &id.hex)?;
        }
        writer.commit()?;

        let numeric: Vec<u64> = ids.iter().map(|id| id.numeric).collect();
        self.embeddings.batch_remove(&numeric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::BinaryPatches;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(
            PageIndex::open_in_ram().unwrap(),
            EmbeddingDb::open(&tmp.path().join("emb.redb")).unwrap(),
        );
        (tmp, store)
    }

    /// One 8-bit patch per page.
    fn page(name: &str, number: u32, text: &str, bits: u8) -> Page {
        Page {
            id: PageId::new(name, number),
            document_name: name.to_string(),
            path: name.to_string(),
            page_number: number,
            raw_text: text.to_string(),
            image: vec![number as u8],
            embedding: BinaryPatches::from_packed(1, 8, vec![bits]).unwrap(),
        }
    }

    fn request(text: &str, hits: usize) -> QueryRequest {
        QueryRequest {
            user_query: text.to_string(),
            hits,
            rank_profile: RankProfile::Default,
            rerank_count: None,
            timeout: DEFAULT_TIMEOUT,
            query_tensor: EmbeddingMatrix::new(
                1,
                8,
                vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            )
            .unwrap(),
            include_image: false,
        }
    }

    #[test]
    fn second_phase_decides_order() {
        let (_tmp, store) = store();
        store
            .feed(&[
                page("a.pdf", 0, "dosing dosing dosing", 0b0000_0000),
                page("b.pdf", 0, "dosing", 0b1111_0000),
            ])
            .unwrap();

        let resp = store.query(&request("dosing", 10)).unwrap();
        let names: Vec<_> =
            resp.hits.iter().map(|h| h.document_name.as_str()).collect();
        assert_eq!(names, vec!["b.pdf", "a.pdf"]);
        assert!((resp.hits[0].relevance - 4.0).abs() < 1e-6);
        assert_eq!(resp.total_count, Some(2));
    }

    #[test]
    fn feed_is_idempotent() {
        let (_tmp, store) = store();
        let pages = vec![page("a.pdf", 0, "x", 1), page("a.pdf", 1, "x", 1)];
        store.feed(&pages).unwrap();
        let report = store.feed(&pages).unwrap();

        assert_eq!(report.fed, 2);
        assert!(report.failed.is_empty());
        assert_eq!(store.page_count().unwrap(), 2);
    }

    #[test]
    fn images_only_on_request() {
        let (_tmp, store) = store();
        store.feed(&[page("a.pdf", 7, "warfarin", 1)]).unwrap();

        let without = store.query(&request("warfarin", 1)).unwrap();
        assert!(without.hits[0].image.is_none());

        let mut req = request("warfarin", 1);
        req.include_image = true;
        let with = store.query(&req).unwrap();
        assert_eq!(with.hits[0].image.as_deref(), Some(&[7u8][..]));
    }

    #[test]
    fn delete_removes_both_halves() {
        let (_tmp, store) = store();
        let p = page("a.pdf", 0, "warfarin", 1);
        store.feed(std::slice::from_ref(&p)).unwrap();
        store.delete_pages(&[p.id.clone()]).unwrap();

        assert_eq!(store.page_count().unwrap(), 0);
        assert!(store.query(&request("warfarin", 5)).unwrap().hits.is_empty());
        let loaded = store.embeddings.batch_load(&[p.id.numeric]).unwrap();
        assert_eq!(loaded, vec![(p.id.numeric, None)]);
    }

    #[test]
    fn unrepresentable_timeout_means_no_deadline() {
        let (_tmp, store) = store();
        store.feed(&[page("a.pdf", 0, "warfarin", 1)]).unwrap();

        let mut req = request("warfarin", 1);
        req.timeout = Duration::from_secs(u64::MAX);
        let resp = store.query(&req).unwrap();
        assert_eq!(resp.hits.len(), 1);
        assert!(deadline_after(Duration::MAX).is_none());
    }

    #[test]
    fn huge_hit_count_is_bounded_by_corpus() {
        let (_tmp, store) = store();
        store
            .feed(&[
                page("a.pdf", 0, "codeine", 1),
                page("b.pdf", 0, "codeine", 2),
            ])
            .unwrap();

        let mut req = request("codeine", usize::MAX / 4);
        req.rerank_count = Some(usize::MAX / 4);
        let resp = store.query(&req).unwrap();
        assert_eq!(resp.hits.len(), 2);
    }

    #[test]
    fn zero_timeout_is_backend_error() {
        let (_tmp, store) = store();
        store.feed(&[page("a.pdf", 0, "warfarin", 1)]).unwrap();

        let mut req = request("warfarin", 1);
        req.timeout = Duration::ZERO;
        let err = store.query(&req).unwrap_err();
        assert!(matches!(err, Error::RetrievalBackend(_)));
    }

    #[test]
    fn read_only_stores_retrieve_concurrently() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        {
            let writer = LocalStore::open(&data_dir).unwrap();
            writer
                .feed(&[
                    page("a.pdf", 0, "dosing", 0b0000_0000),
                    page("b.pdf", 0, "dosing", 0b1111_0000),
                ])
                .unwrap();
        }

        let first = LocalStore::open_read_only(&data_dir).unwrap();
        let second = LocalStore::open_read_only(&data_dir).unwrap();
        let stores: [&dyn IndexStore; 3] = [&first, &second, &first];
        std::thread::scope(|scope| {
            let handles: Vec<_> = stores
                .iter()
                .map(|store| {
                    scope.spawn(move || {
                        let resp = store.query(&request("dosing", 2)).unwrap();
                        resp.hits
                            .into_iter()
                            .map(|h| h.document_name)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), vec!["b.pdf", "a.pdf"]);
            }
        });

        assert!(first.feed(&[page("c.pdf", 0, "dosing", 1)]).is_err());
    }
}
