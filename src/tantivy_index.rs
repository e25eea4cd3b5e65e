use std::path::Path;

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    collector::{Count, TopDocs},
    doc,
    query::QueryParser,
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::{error::Result, page::Page, schema::fields};

const NUM_ID: &str = "num_id";

/// The lexical half of the local index store: one tantivy document per page
/// with BM25 over `name` and `text` plus the stored fields a hit returns.
pub struct PageIndex {
    index: Index,
    reader: IndexReader,
    schema: Schema,
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub id: Field,
    pub num_id: Field,
    pub name: Field,
    pub path: Field,
    pub page_number: Field,
    pub text: Field,
    pub image: Field,
}

/// A first-phase match.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub score: f32,
    pub id: String,
    pub num_id: u64,
    pub name: String,
    pub path: String,
    pub page_number: u32,
    pub image: Option<Vec<u8>>,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::ID, STRING | STORED);
    builder.add_u64_field(NUM_ID, STORED | FAST);

    let stemmed = TextFieldIndexing::default()
        .set_tokenizer("en_stem")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    builder.add_text_field(
        fields::NAME,
        TextOptions::default()
            .set_indexing_options(stemmed.clone())
            .set_stored(),
    );
    builder.add_text_field(fields::PATH, STRING | STORED);
    builder.add_u64_field(fields::PAGE_NUMBER, STORED | FAST);
    builder.add_text_field(
        fields::TEXT,
        TextOptions::default().set_indexing_options(stemmed),
    );
    builder.add_bytes_field(fields::IMAGE, STORED);

    builder.build()
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

impl PageIndex {
    /// Open or create a page index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let schema = build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(
                mmap_dir,
                schema.clone(),
                tantivy::IndexSettings::default(),
            )?
        };

        Self::from_index(index, schema)
    }

    /// Create an in-memory page index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let schema = build_schema();
        let index = Index::create_in_ram(schema.clone());
        Self::from_index(index, schema)
    }

    fn from_index(index: Index, schema: Schema) -> Result<Self> {
        register_tokenizers(&index);
        let reader = index.reader()?;
        Ok(Self {
            index,
            reader,
            schema,
        })
    }

    pub fn fields(&self) -> Result<SchemaFields> {
        let f = |name: &str| self.schema.get_field(name);
        Ok(SchemaFields {
            id: f(fields::ID)?,
            num_id: f(NUM_ID)?,
            name: f(fields::NAME)?,
            path: f(fields::PATH)?,
            page_number: f(fields::PAGE_NUMBER)?,
            text: f(fields::TEXT)?,
            image: f(fields::IMAGE)?,
        })
    }

    /// Create a writer with the given memory budget (in bytes).
    pub fn writer(&self, memory_budget: usize) -> Result<IndexWriter> {
        Ok(self.index.writer(memory_budget)?)
    }

    /// Upsert a page: any document with the same id is deleted in the same
    /// commit.
    pub fn add_page(&self, writer: &IndexWriter, page: &Page) -> Result<()> {
        let f = self.fields()?;

        writer.delete_term(Term::from_field_text(f.id, &page.id.hex));
        writer.add_document(doc!(
            f.id => page.id.hex.as_str(),
            f.num_id => page.id.numeric,
            f.name => page.document_name.as_str(),
            f.path => page.path.as_str(),
            f.page_number => u64::from(page.page_number),
            f.text => page.raw_text.as_str(),
            f.image => page.image.clone(),
        ))?;

        Ok(())
    }

    pub fn delete_page(&self, writer: &IndexWriter, id: &str) -> Result<()> {
        let f = self.fields()?;
        writer.delete_term(Term::from_field_text(f.id, id));
        Ok(())
    }

    /// BM25 over `name` and `text`. Only pages matching at least one query
    /// term are returned.
    pub fn search(
        &self,
        query_str: &str,
        limit: usize,
        with_image: bool,
    ) -> Result<Vec<LexicalHit>> {
        let f = self.fields()?;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let parser = QueryParser::for_index(&self.index, vec![f.name, f.text]);
        let (query, _errors) = parser.parse_query_lenient(query_str);
        // The collector preallocates for `limit`; never ask for more pages
        // than the index holds.
        let limit = limit.min(searcher.num_docs() as usize).max(1);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            results.push(LexicalHit {
                score,
                id: extract_text(&doc, f.id),
                num_id: extract_u64(&doc, f.num_id),
                name: extract_text(&doc, f.name),
                path: extract_text(&doc, f.path),
                page_number: extract_u64(&doc, f.page_number) as u32,
                image: with_image.then(|| extract_bytes(&doc, f.image)),
            });
        }

        Ok(results)
    }

    /// Number of pages the lexical query matches.
    pub fn count(&self, query_str: &str) -> Result<usize> {
        let f = self.fields()?;
        self.reader.reload()?;
        let parser = QueryParser::for_index(&self.index, vec![f.name, f.text]);
        let (query, _errors) = parser.parse_query_lenient(query_str);
        Ok(self.reader.searcher().search(&query, &Count)?)
    }

    pub fn num_pages(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }
}

impl std::fmt::Debug for PageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageIndex").finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn extract_bytes(doc: &TantivyDocument, field: Field) -> Vec<u8> {
    doc.get_first(field)
        .and_then(|v| v.as_bytes())
        .map(<[u8]>::to_vec)
        .unwrap_or_default()
}
