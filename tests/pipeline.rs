use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use image::RgbImage;
use pgxrag::{
    ConfigDb,
    Corpus,
    EmbeddingDb,
    Error,
    IndexStore,
    LocalStore,
    PageId,
    PageIndex,
    Result,
    corpus::PageContent,
    embedding::{EmbeddingMatrix, PageEmbedder, QueryEncoder},
    indexer::IndexBuilder,
    materialize::ResultMaterializer,
    page::Page,
    render::{PageRenderer, RenderedDocument},
    retrieval::{RetrievalConfig, RetrievalEngine},
    store::{FeedReport, QueryRequest, QueryResponse},
};

const VOCAB: [&str; 8] = [
    "alpha", "beta", "gamma", "delta", "warfarin", "codeine", "cyp2c9",
    "cyp2d6",
];
const DIM: usize = VOCAB.len();

/// `hit` on the components of words present in `text`, `miss` elsewhere.
fn word_vector(text: &str, hit: f32, miss: f32) -> Vec<f32> {
    let words: Vec<String> =
        text.split_whitespace().map(str::to_lowercase).collect();
    VOCAB
        .iter()
        .map(|w| if words.iter().any(|x| x == w) { hit } else { miss })
        .collect()
}

/// Documents are text files; `|` separates pages.
struct TextRenderer;

impl PageRenderer for TextRenderer {
    fn render_document(&self, path: &Path) -> Result<RenderedDocument> {
        let content = std::fs::read_to_string(path)?;
        let texts: Vec<String> =
            content.split('|').map(|t| t.trim().to_string()).collect();
        Ok(RenderedDocument {
            images: vec![RgbImage::new(10, 20); texts.len()],
            texts,
        })
    }

    fn render_page(&self, _: &Path, _: u32) -> Result<RgbImage> {
        Ok(RgbImage::new(10, 20))
    }
}

/// Patch 0 carries the page's words, patch 1 is empty.
struct WordEmbedder;

impl PageEmbedder for WordEmbedder {
    fn patches_per_page(&self) -> usize {
        2
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn embed_pages(
        &mut self,
        pages: &[PageContent],
    ) -> Result<Vec<EmbeddingMatrix>> {
        pages
            .iter()
            .map(|p| {
                EmbeddingMatrix::from_rows(vec![
                    word_vector(&p.text, 1.0, -1.0),
                    vec![-1.0; DIM],
                ])
            })
            .collect()
    }
}

/// One query token per word, one-hot over the vocabulary.
#[derive(Default)]
struct WordQueryEncoder {
    calls: usize,
}

impl QueryEncoder for WordQueryEncoder {
    fn encode_query(&mut self, query: &str) -> Result<EmbeddingMatrix> {
        self.calls += 1;
        EmbeddingMatrix::from_rows(
            query
                .split_whitespace()
                .map(|w| word_vector(w, 1.0, 0.0))
                .collect(),
        )
    }
}

/// Counts calls on the way to a real store.
struct CountingStore<'a> {
    inner: &'a dyn IndexStore,
    queries: AtomicUsize,
}

impl IndexStore for CountingStore<'_> {
    fn feed(&self, pages: &[Page]) -> Result<FeedReport> {
        self.inner.feed(pages)
    }

    fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(request)
    }

    fn page_count(&self) -> Result<u64> {
        self.inner.page_count()
    }

    fn delete_pages(&self, ids: &[PageId]) -> Result<()> {
        self.inner.delete_pages(ids)
    }
}

struct Workspace {
    tmp: tempfile::TempDir,
    store: LocalStore,
    config: ConfigDb,
}

impl Workspace {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("corpus")).unwrap();
        let store = LocalStore::new(
            PageIndex::open(&tmp.path().join("tantivy")).unwrap(),
            EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap(),
        );
        let config = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        Self { tmp, store, config }
    }

    fn corpus_dir(&self) -> PathBuf {
        self.tmp.path().join("corpus")
    }

    fn add_document(&self, name: &str, pages: &[&str]) -> PathBuf {
        let path = self.corpus_dir().join(name);
        std::fs::write(&path, pages.join("|")).unwrap();
        path
    }

    fn index(&self) {
        let corpus = Corpus::scan(&self.corpus_dir(), &[]).unwrap();
        let mut embedder = WordEmbedder;
        let report = IndexBuilder::new(
            &TextRenderer,
            &mut embedder,
            &self.store,
            &self.config,
        )
        .build(&corpus)
        .unwrap();
        assert!(report.is_clean(), "{report:?}");
    }

    fn engine(&self) -> RetrievalEngine<'_> {
        RetrievalEngine::new(&self.store, RetrievalConfig::default())
    }
}

#[test]
fn best_page_of_single_document() {
    let ws = Workspace::new();
    ws.add_document("guideline.pdf", &["alpha", "beta", "gamma"]);
    ws.index();

    let hits = ws
        .engine()
        .retrieve(&mut WordQueryEncoder::default(), "alpha", 1)
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].page_number, 0);
    assert_eq!(hits[0].document_name, "guideline.pdf");
    assert_eq!(hits[0].page_id, PageId::new("guideline.pdf", 0).hex);
    assert_eq!(hits[0].rank, 0);
}

#[test]
fn small_corpus_is_never_padded() {
    let ws = Workspace::new();
    ws.add_document("a.pdf", &["warfarin cyp2c9"]);
    ws.add_document("b.pdf", &["warfarin dosing"]);
    ws.index();

    let hits = ws
        .engine()
        .retrieve(&mut WordQueryEncoder::default(), "warfarin cyp2c9", 5)
        .unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].document_name, "a.pdf");
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn reindexing_identical_corpus_adds_nothing() {
    let ws = Workspace::new();
    ws.add_document(
        "codeine.pdf",
        &["codeine", "cyp2d6", "alpha", "beta", "gamma"],
    );
    ws.add_document(
        "warfarin.pdf",
        &["warfarin", "cyp2c9", "delta", "alpha beta", "gamma delta"],
    );

    ws.index();
    assert_eq!(ws.store.page_count().unwrap(), 10);
    ws.index();
    assert_eq!(ws.store.page_count().unwrap(), 10);

    let hits = ws
        .engine()
        .retrieve(&mut WordQueryEncoder::default(), "alpha", 20)
        .unwrap();
    let ids: BTreeSet<_> = hits.iter().map(|h| h.page_id.clone()).collect();
    assert_eq!(ids.len(), hits.len());
    assert_eq!(hits.len(), 2);
}

#[test]
fn empty_query_never_reaches_encoder_or_store() {
    let ws = Workspace::new();
    let counting = CountingStore {
        inner: &ws.store,
        queries: AtomicUsize::new(0),
    };
    let engine = RetrievalEngine::new(&counting, RetrievalConfig::default());
    let mut encoder = WordQueryEncoder::default();

    for query in ["", "  ", "\n\t"] {
        let err = engine.retrieve(&mut encoder, query, 3).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    assert_eq!(encoder.calls, 0);
    assert_eq!(counting.queries.load(Ordering::SeqCst), 0);
}

#[test]
fn deleted_document_drops_only_its_hit() {
    let ws = Workspace::new();
    ws.add_document("a.pdf", &["codeine cyp2d6 alpha"]);
    ws.add_document("b.pdf", &["codeine cyp2d6"]);
    ws.add_document("c.pdf", &["codeine"]);
    ws.index();

    let hits = ws
        .engine()
        .retrieve(
            &mut WordQueryEncoder::default(),
            "codeine cyp2d6 alpha",
            3,
        )
        .unwrap();
    assert_eq!(hits.len(), 3);
    std::fs::remove_file(&hits[1].path).unwrap();

    let out = ws.tmp.path().join("retrieved_pages");
    let report = ResultMaterializer::new(&TextRenderer)
        .save(&hits, &out)
        .unwrap();

    assert_eq!(report.saved.len(), 2);
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].rank, 1);
    assert!(out.join("00_a_p1.png").is_file());
    assert!(out.join("02_c_p1.png").is_file());
}

#[test]
fn one_engine_serves_concurrent_queries() {
    let ws = Workspace::new();
    ws.add_document("warfarin.pdf", &["warfarin cyp2c9", "delta"]);
    ws.add_document("codeine.pdf", &["codeine cyp2d6"]);
    ws.index();

    let engine = ws.engine();
    std::thread::scope(|scope| {
        let handles: Vec<_> = ["warfarin cyp2c9", "codeine cyp2d6", "delta"]
            .into_iter()
            .map(|query| {
                let engine = &engine;
                scope.spawn(move || {
                    let mut encoder = WordQueryEncoder::default();
                    let hits = engine.retrieve(&mut encoder, query, 1).unwrap();
                    (hits[0].document_name.clone(), hits[0].page_number)
                })
            })
            .collect();
        let best: Vec<_> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            best,
            vec![
                ("warfarin.pdf".to_string(), 0),
                ("codeine.pdf".to_string(), 0),
                ("warfarin.pdf".to_string(), 1),
            ]
        );
    });
}
