use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("search index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("model error: {0}")]
    Model(#[from] pylate_rs::ColbertError),

    #[error("model download failed: {0}")]
    ModelDownload(#[from] hf_hub::api::sync::ApiError),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot read document {path}: {reason}")]
    CorpusRead { path: PathBuf, reason: String },

    #[error(
        "page count mismatch in {path}: {images} rendered pages but {texts} text pages"
    )]
    PageCountMismatch {
        path: PathBuf,
        images: usize,
        texts: usize,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("retrieval backend error: {0}")]
    RetrievalBackend(String),

    #[error("cannot resolve page {page_number} of {path}: {reason}")]
    PageResolution {
        path: PathBuf,
        page_number: u32,
        reason: String,
    },

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("query rewrite failed: {0}")]
    Rewrite(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Collapse any failure raised while talking to an index store into a
    /// [`Error::RetrievalBackend`], keeping the original message.
    pub fn into_backend(self) -> Self {
        match self {
            Error::RetrievalBackend(_) => self,
            other => Error::RetrievalBackend(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::RetrievalBackend(format!("request timed out: {e}"))
        } else {
            Error::RetrievalBackend(e.to_string())
        }
    }
}
