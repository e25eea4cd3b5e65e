//! Offline build: render, embed, quantize and feed every page of a corpus.

use std::{
    collections::BTreeMap,
    io::{BufRead, Write},
};

use kdam::{BarExt, tqdm};
use tracing::{debug, info, warn};

use crate::{
    config_db::{ConfigDb, DocumentRecord},
    corpus::{Corpus, DocumentPages},
    embedding::{self, PageEmbedder},
    error::{Error, Result},
    page::{FeedRecord, Page},
    page_id::PageId,
    render::{PageRenderer, ResizeSpec},
    store::IndexStore,
    vespa::PutOperation,
    walker::DiscoveredFile,
};

pub const DEFAULT_BATCH_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Pages per embedder call.
    pub batch_size: usize,
    /// Bound for the stored page image. `None` stores the full render.
    pub thumbnail: Option<ResizeSpec>,
    /// Skip documents whose modification time matches the manifest.
    pub changed_only: bool,
    pub progress: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            thumbnail: None,
            changed_only: false,
            progress: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct IndexReport {
    pub documents_indexed: usize,
    pub documents_unchanged: usize,
    pub pages_fed: usize,
    /// `(document name, reason)` for documents that could not be read.
    pub failed_documents: Vec<(String, String)>,
    /// `(page id, reason)` for pages the store rejected.
    pub failed_pages: Vec<(String, String)>,
}

impl IndexReport {
    pub fn is_clean(&self) -> bool {
        self.failed_documents.is_empty() && self.failed_pages.is_empty()
    }
}

/// Drives one build over a corpus.
///
/// Errors that concern a single document (unreadable file, page count
/// mismatch) or a single page (store rejection) are warned about and
/// recorded in the [`IndexReport`]. Anything else, including an encoder
/// producing the wrong shape, aborts the build.
pub struct IndexBuilder<'a, R: ?Sized, E: ?Sized, S: ?Sized> {
    renderer: &'a R,
    embedder: &'a mut E,
    store: &'a S,
    config_db: &'a ConfigDb,
    options: IndexOptions,
    feed_output: Option<FeedOutput<'a>>,
}

/// Sink for JSONL `put` operations, and the document type they name.
struct FeedOutput<'a> {
    out: &'a mut dyn Write,
    namespace: String,
    schema: String,
}

impl<'a, R, E, S> IndexBuilder<'a, R, E, S>
where
    R: PageRenderer + ?Sized,
    E: PageEmbedder + ?Sized,
    S: IndexStore + ?Sized,
{
    pub fn new(
        renderer: &'a R,
        embedder: &'a mut E,
        store: &'a S,
        config_db: &'a ConfigDb,
    ) -> Self {
        Self {
            renderer,
            embedder,
            store,
            config_db,
            options: IndexOptions::default(),
            feed_output: None,
        }
    }

    pub fn with_options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    /// Also write every fed page as a JSONL `put` operation for
    /// `id:<namespace>:<schema>::<page id>`.
    pub fn with_feed_output(
        mut self,
        out: &'a mut dyn Write,
        namespace: &str,
        schema: &str,
    ) -> Self {
        self.feed_output = Some(FeedOutput {
            out,
            namespace: namespace.to_string(),
            schema: schema.to_string(),
        });
        self
    }

    pub fn build(mut self, corpus: &Corpus) -> Result<IndexReport> {
        self.config_db.check_encoder_shape(
            self.embedder.patches_per_page(),
            self.embedder.dimension(),
        )?;

        let mut report = IndexReport::default();
        let mut pb = tqdm!(
            total = corpus.len(),
            desc = "indexing",
            unit = "doc",
            disable = !self.options.progress
        );

        // The manifest is read once up front so unchanged documents are
        // skipped before anything renders them.
        let manifest: BTreeMap<String, DocumentRecord> =
            self.config_db.list_documents()?.into_iter().collect();
        let changed_only = self.options.changed_only;
        let needs_render = |file: &DiscoveredFile| {
            !(changed_only
                && manifest
                    .get(&file.document_name())
                    .is_some_and(|r| r.mtime == file.mtime))
        };

        for (file, extracted) in
            corpus.documents_where(self.renderer, needs_render)
        {
            let name = file.document_name();
            let Some(extracted) = extracted else {
                debug!(document = %name, "unchanged, skipping");
                report.documents_unchanged += 1;
                pb.update(1).ok();
                continue;
            };

            match extracted {
                Ok(doc) => {
                    let previous = manifest.get(&name).cloned();
                    self.index_document(&doc, previous, &mut report)?;
                }
                Err(
                    e @ (Error::CorpusRead { .. }
                    | Error::PageCountMismatch { .. }),
                ) => {
                    warn!(document = %name, error = %e, "skipping document");
                    report.failed_documents.push((name, e.to_string()));
                }
                Err(e) => return Err(e),
            }
            pb.update(1).ok();
        }

        if let Some(feed) = self.feed_output.as_mut() {
            feed.out.flush()?;
        }

        info!(
            documents = report.documents_indexed,
            unchanged = report.documents_unchanged,
            pages = report.pages_fed,
            failed_documents = report.failed_documents.len(),
            failed_pages = report.failed_pages.len(),
            "build finished"
        );
        Ok(report)
    }

    fn index_document(
        &mut self,
        doc: &DocumentPages,
        previous: Option<DocumentRecord>,
        report: &mut IndexReport,
    ) -> Result<()> {
        let embeddings = embedding::embed_in_batches(
            &mut *self.embedder,
            &doc.pages,
            self.options.batch_size,
            |n| debug!(document = %doc.document_name, pages = n, "embedded batch"),
        )?;

        let path = doc.path.to_string_lossy();
        let pages = doc
            .pages
            .iter()
            .zip(&embeddings)
            .enumerate()
            .map(|(i, (content, matrix))| {
                Page::assemble(
                    &doc.document_name,
                    &path,
                    i as u32,
                    content,
                    matrix,
                    self.options.thumbnail,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let feed = self.store.feed(&pages)?;
        let clean = feed.failed.is_empty();
        report.pages_fed += feed.fed;
        report.failed_pages.extend(feed.failed);

        if let Some(feed) = self.feed_output.as_mut() {
            for page in &pages {
                let op = PutOperation::new(
                    &feed.namespace,
                    &feed.schema,
                    FeedRecord::from(page),
                );
                serde_json::to_writer(&mut *feed.out, &op)?;
                writeln!(feed.out)?;
            }
        }

        // Pages past the new end of a shrunk document would otherwise linger.
        let page_count = pages.len() as u32;
        if let Some(old) = previous.filter(|r| r.page_count > page_count) {
            let stale: Vec<PageId> = (page_count..old.page_count)
                .map(|n| PageId::new(&doc.document_name, n))
                .collect();
            debug!(
                document = %doc.document_name,
                stale = stale.len(),
                "removing pages past the new end"
            );
            self.store.delete_pages(&stale)?;
        }

        // A document with rejected pages is left out of the manifest so the
        // next changed-only build retries it.
        if clean {
            self.config_db.set_document(
                &doc.document_name,
                &DocumentRecord {
                    path: path.into_owned(),
                    mtime: doc.mtime,
                    page_count,
                },
            )?;
        }
        report.documents_indexed += 1;
        Ok(())
    }
}

/// Delete every page of a document from the store and forget it.
///
/// Returns the number of pages removed.
pub fn remove_document<S: IndexStore + ?Sized>(
    store: &S,
    config_db: &ConfigDb,
    document_name: &str,
) -> Result<u32> {
    let record =
        config_db
            .get_document(document_name)?
            .ok_or_else(|| Error::NotFound {
                kind: "document",
                name: document_name.to_string(),
            })?;

    let ids: Vec<PageId> = (0..record.page_count)
        .map(|n| PageId::new(document_name, n))
        .collect();
    store.delete_pages(&ids)?;
    config_db.remove_document(document_name)?;
    Ok(record.page_count)
}

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub pages_fed: usize,
    /// Documents whose manifest entry was written or extended.
    pub documents: usize,
    /// `(1-based line number, reason)` for lines that could not be decoded.
    pub failed_lines: Vec<(usize, String)>,
    /// `(page id, reason)` for pages the store rejected.
    pub failed_pages: Vec<(String, String)>,
}

/// What a replay saw of one document.
struct DocumentTally {
    path: String,
    page_count: u32,
    clean: bool,
}

/// Feed JSONL `put` operations, as written by
/// [`IndexBuilder::with_feed_output`], into a store without rendering or
/// embedding anything.
///
/// `dimension` is the bit width of each patch. The patch count of the first
/// decoded page is checked against the index like a build would. Documents
/// whose pages all went in are added to the manifest with an unknown
/// modification time, so a later changed-only build re-renders them.
pub fn replay_feed<S, R>(
    store: &S,
    config_db: &ConfigDb,
    input: R,
    dimension: u32,
    batch_size: usize,
) -> Result<ReplayReport>
where
    S: IndexStore + ?Sized,
    R: BufRead,
{
    let batch_size = batch_size.max(1);
    let mut report = ReplayReport::default();
    let mut tallies: BTreeMap<String, DocumentTally> = BTreeMap::new();
    let mut batch = Vec::with_capacity(batch_size);
    let mut shape_checked = false;

    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let decoded = serde_json::from_str::<PutOperation>(&line)
            .map_err(Error::from)
            .and_then(PutOperation::into_record)
            .and_then(|record| record.into_page(dimension));
        let page = match decoded {
            Ok(page) => page,
            Err(e) => {
                warn!(line = idx + 1, error = %e, "skipping feed line");
                report.failed_lines.push((idx + 1, e.to_string()));
                continue;
            }
        };

        if !shape_checked {
            config_db.check_encoder_shape(
                page.embedding.num_patches() as usize,
                dimension as usize,
            )?;
            shape_checked = true;
        }

        let tally = tallies
            .entry(page.document_name.clone())
            .or_insert_with(|| DocumentTally {
                path: page.path.clone(),
                page_count: 0,
                clean: true,
            });
        tally.page_count = tally.page_count.max(page.page_number + 1);

        batch.push(page);
        if batch.len() >= batch_size {
            feed_batch(store, &mut batch, &mut report, &mut tallies)?;
        }
    }
    feed_batch(store, &mut batch, &mut report, &mut tallies)?;

    for (name, tally) in tallies.into_iter().filter(|(_, t)| t.clean) {
        let page_count = config_db
            .get_document(&name)?
            .map_or(tally.page_count, |r| r.page_count.max(tally.page_count));
        config_db.set_document(
            &name,
            &DocumentRecord {
                path: tally.path,
                mtime: 0,
                page_count,
            },
        )?;
        report.documents += 1;
    }

    info!(
        pages = report.pages_fed,
        documents = report.documents,
        failed_lines = report.failed_lines.len(),
        failed_pages = report.failed_pages.len(),
        "feed replayed"
    );
    Ok(report)
}

fn feed_batch<S: IndexStore + ?Sized>(
    store: &S,
    batch: &mut Vec<Page>,
    report: &mut ReplayReport,
    tallies: &mut BTreeMap<String, DocumentTally>,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let feed = store.feed(batch)?;
    report.pages_fed += feed.fed;
    for (id, _) in &feed.failed {
        let owner = batch.iter().find(|p| &p.id.hex == id);
        if let Some(tally) =
            owner.and_then(|p| tallies.get_mut(&p.document_name))
        {
            tally.clean = false;
        }
    }
    report.failed_pages.extend(feed.failed);
    batch.clear();
    Ok(())
}
