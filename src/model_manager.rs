use std::{fmt, str::FromStr};

use candle_core::{DType, Device};
use image::RgbImage;
use pylate_rs::ColBERT;
use tracing::info;

use crate::{
    colpali::{self, ColPali},
    corpus::PageContent,
    embedding::{EmbeddingMatrix, PageEmbedder, QueryEncoder},
    error::{Error, Result},
};

pub const TEXT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "PGXRAG_MODEL";

pub const TEXT_PATCHES_PER_PAGE: usize = 300;
pub const DEFAULT_DIMENSION: usize = 128;

/// Which side of a page the page encoder reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedderKind {
    /// ColPali over the rendered page image, one row per image patch.
    #[default]
    Visual,
    /// ColBERT over the extracted page text, one row per token.
    Text,
}

impl EmbedderKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Text => "text",
        }
    }

    pub fn default_model_id(self) -> &'static str {
        match self {
            Self::Visual => colpali::DEFAULT_MODEL_ID,
            Self::Text => TEXT_MODEL_ID,
        }
    }

    pub fn default_patches_per_page(self) -> usize {
        match self {
            Self::Visual => colpali::IMAGE_PATCHES,
            Self::Text => TEXT_PATCHES_PER_PAGE,
        }
    }
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EmbedderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "visual" => Ok(Self::Visual),
            "text" => Ok(Self::Text),
            other => Err(Error::Config(format!("unknown embedder {other:?}"))),
        }
    }
}

/// Pick the embedder: the flag, else the one the index was built with,
/// else [`EmbedderKind::Visual`]. A flag that disagrees with the index is
/// an error, since its vectors would not be comparable.
pub fn resolve_embedder(
    flag: Option<EmbedderKind>,
    stored: Option<&str>,
) -> Result<EmbedderKind> {
    let stored = stored.map(str::parse::<EmbedderKind>).transpose()?;
    match (flag, stored) {
        (Some(f), Some(s)) if f != s => Err(Error::Config(format!(
            "index was built with the {s} embedder, not {f}; \
             rebuild into a fresh data directory"
        ))),
        (flag, stored) => Ok(flag.or(stored).unwrap_or_default()),
    }
}

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Pick the model id: an explicit flag wins, then `PGXRAG_MODEL`, then the
/// id stored in the config database, then the embedder's default.
pub fn resolve_model_id(
    kind: EmbedderKind,
    flag: Option<&str>,
    stored: Option<String>,
) -> String {
    if let Some(id) = flag {
        return id.to_string();
    }
    if let Ok(id) = std::env::var(MODEL_ENV_VAR) {
        return id;
    }
    stored.unwrap_or_else(|| kind.default_model_id().to_string())
}

enum Encoder {
    Visual(ColPali),
    Text(ColBERT),
}

/// Owns the late-interaction encoder for both sides of retrieval.
///
/// The model is loaded on first use. Page mode fixes every page to
/// `patches_per_page` rows; query mode keeps one row per query token.
pub struct ModelManager {
    kind: EmbedderKind,
    encoder: Option<Encoder>,
    model_id: String,
    patches_per_page: usize,
    dimension: usize,
}

impl ModelManager {
    pub fn new(kind: EmbedderKind, model_id: String) -> Self {
        Self {
            kind,
            encoder: None,
            model_id,
            patches_per_page: kind.default_patches_per_page(),
            dimension: DEFAULT_DIMENSION,
        }
    }

    pub fn with_patches_per_page(mut self, patches: usize) -> Self {
        self.patches_per_page = patches;
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn kind(&self) -> EmbedderKind {
        self.kind
    }

    /// Returns the model ID that will be (or has been) loaded.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.encoder.is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut Encoder> {
        if self.encoder.is_none() {
            info!(model = %self.model_id, kind = %self.kind, "loading encoder");
            let device = default_device();
            let encoder = match self.kind {
                EmbedderKind::Visual => {
                    Encoder::Visual(ColPali::load(&self.model_id, device)?)
                }
                EmbedderKind::Text => Encoder::Text(
                    ColBERT::from(&self.model_id)
                        .with_device(device)
                        .try_into()?,
                ),
            };
            self.encoder = Some(encoder);
        }

        self.encoder
            .as_mut()
            .ok_or_else(|| Error::Config("model failed to load".into()))
    }
}

/// Truncate to exactly `rows` rows, or pad by cycling through the real
/// rows. Repeated rows leave every MaxSim maximum unchanged.
fn fit_rows(
    mut tokens: Vec<Vec<f32>>,
    rows: usize,
    dimension: usize,
) -> Result<EmbeddingMatrix> {
    if let Some(row) = tokens.iter().find(|r| r.len() != dimension) {
        return Err(Error::Embedding(format!(
            "model produced {}-dimensional vectors, expected {dimension}",
            row.len()
        )));
    }
    tokens.truncate(rows);
    let real = tokens.len();
    if real == 0 && rows > 0 {
        return Err(Error::Embedding("model produced no vectors".into()));
    }
    for i in real..rows {
        let row = tokens[i % real].clone();
        tokens.push(row);
    }
    EmbeddingMatrix::from_rows(tokens)
}

impl PageEmbedder for ModelManager {
    fn patches_per_page(&self) -> usize {
        self.patches_per_page
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_pages(
        &mut self,
        pages: &[PageContent],
    ) -> Result<Vec<EmbeddingMatrix>> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }
        let (rows, dimension) = (self.patches_per_page, self.dimension);

        let batch = match self.ensure_loaded()? {
            Encoder::Visual(colpali) => {
                let images: Vec<&RgbImage> =
                    pages.iter().map(|p| &p.image).collect();
                colpali.embed_images(&images)?
            }
            Encoder::Text(colbert) => {
                let texts: Vec<String> =
                    pages.iter().map(|p| p.text.clone()).collect();
                colbert
                    .encode(&texts, false)?
                    .to_dtype(DType::F32)?
                    .to_vec3::<f32>()?
            }
        };

        batch
            .into_iter()
            .map(|tokens| fit_rows(tokens, rows, dimension))
            .collect()
    }
}

impl QueryEncoder for ModelManager {
    fn encode_query(&mut self, query: &str) -> Result<EmbeddingMatrix> {
        let tokens = match self.ensure_loaded()? {
            Encoder::Visual(colpali) => colpali.embed_query(query)?,
            Encoder::Text(colbert) => colbert
                .encode(&[query.to_string()], true)?
                .squeeze(0)?
                .to_dtype(DType::F32)?
                .to_vec2::<f32>()?,
        };
        EmbeddingMatrix::from_rows(tokens)
    }
}
