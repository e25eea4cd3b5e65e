//! pgxrag - page-level late-interaction retrieval over pharmacogenomics
//! guideline PDFs.
//!
//! Every page of every guideline is rendered, embedded into a fixed number
//! of patch vectors by a ColPali vision encoder (or, optionally, a ColBERT
//! text encoder), sign-quantized and indexed. A query is answered in two
//! phases: BM25 over the page text picks candidates, then a MaxSim score of
//! the float query tokens against the stored sign bits orders them. The
//! index lives either in the local data directory
//! ([tantivy](https://github.com/quickwit-oss/tantivy) plus redb) or in a
//! Vespa application.
//!
//! # Quick start
//!
//! ```no_run
//! use pgxrag::{DataDir, LocalStore, ModelManager, PdfiumRenderer};
//! use pgxrag::materialize::ResultMaterializer;
//! use pgxrag::model_manager::EmbedderKind;
//! use pgxrag::retrieval::{RetrievalConfig, RetrievalEngine};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let store = LocalStore::open_read_only(&data_dir).unwrap();
//! let kind = EmbedderKind::Visual;
//! let mut model = ModelManager::new(kind, kind.default_model_id().into());
//!
//! let engine = RetrievalEngine::new(&store, RetrievalConfig::default());
//! let hits = engine
//!     .retrieve(&mut model, "dose adjustment for CYP2C19 poor metabolizer", 3)
//!     .unwrap();
//!
//! let renderer = PdfiumRenderer::new().unwrap();
//! let report = ResultMaterializer::new(&renderer)
//!     .save(&hits, std::path::Path::new("retrieved_pages"))
//!     .unwrap();
//! for page in &report.saved {
//!     println!("{}", page.file.display());
//! }
//! ```

pub mod binary;
pub mod cli;
pub mod colpali;
pub mod config_db;
pub mod corpus;
pub mod data_dir;
pub mod embedding;
pub mod embedding_db;
pub mod error;
pub mod indexer;
pub mod materialize;
pub mod model_manager;
pub mod page;
pub mod page_id;
mod redb_handle;
pub mod render;
pub mod reranker;
pub mod retrieval;
pub mod rewrite;
pub mod schema;
pub mod store;
pub mod tantivy_index;
pub mod vespa;
pub mod walker;

pub use config_db::ConfigDb;
pub use corpus::Corpus;
pub use data_dir::DataDir;
pub use embedding_db::EmbeddingDb;
pub use error::{Error, Result};
pub use model_manager::ModelManager;
pub use page_id::PageId;
pub use render::PdfiumRenderer;
pub use store::{IndexStore, LocalStore};
pub use tantivy_index::PageIndex;
pub use vespa::VespaStore;
