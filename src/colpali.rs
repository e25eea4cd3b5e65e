//! ColPali: a PaliGemma vision-language model with a 128-dimensional
//! late-interaction projection, run on candle.
//!
//! A page image becomes one row per 14x14 pixel patch of its 448x448
//! resize, in raster order. A query becomes one row per token.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{colpali, paligemma};
use hf_hub::{Repo, RepoType, api::sync::Api};
use image::{RgbImage, imageops::FilterType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const DEFAULT_MODEL_ID: &str = "vidore/colpali-v1.2-merged";
/// The merged ColPali repos ship no tokenizer; PaliGemma's is shared.
const TOKENIZER_REPO: &str = "google/paligemma-3b-mix-448";

pub const IMAGE_SIZE: u32 = 448;
const PATCH_SIZE: u32 = 14;
/// Image tokens per page: `(448 / 14)^2`.
pub const IMAGE_PATCHES: usize =
    ((IMAGE_SIZE / PATCH_SIZE) * (IMAGE_SIZE / PATCH_SIZE)) as usize;
pub const DIMENSION: usize = 128;

/// Text the image tokens are prefixed to. Its rows are dropped.
const IMAGE_PROMPT: &str = "Describe the image";

const WEIGHT_INDEX: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS: &str = "model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Local paths of everything a model needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// A directory holding `tokenizer.json` and either a sharded
    /// `model.safetensors.index.json` or a single `model.safetensors`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let tokenizer = dir.join(TOKENIZER_FILE);
        if !tokenizer.is_file() {
            return Err(Error::Config(format!(
                "no {TOKENIZER_FILE} in {}",
                dir.display()
            )));
        }
        let index = dir.join(WEIGHT_INDEX);
        let weights = if index.is_file() {
            weight_shards(&std::fs::read_to_string(&index)?)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            vec![dir.join(SINGLE_WEIGHTS)]
        };
        Ok(Self { tokenizer, weights })
    }

    /// Download (or reuse from the HuggingFace cache) a hub model.
    pub fn from_hub(model_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let weights = match repo.get(WEIGHT_INDEX) {
            Ok(index) => weight_shards(&std::fs::read_to_string(index)?)?
                .iter()
                .map(|name| repo.get(name))
                .collect::<std::result::Result<Vec<_>, _>>()?,
            Err(_) => vec![repo.get(SINGLE_WEIGHTS)?],
        };
        let tokenizer = match repo.get(TOKENIZER_FILE) {
            Ok(path) => path,
            Err(_) => {
                api.model(TOKENIZER_REPO.to_string()).get(TOKENIZER_FILE)?
            }
        };
        Ok(Self { tokenizer, weights })
    }

    /// A local directory if `model` names one, else a hub id.
    pub fn resolve(model: &str) -> Result<Self> {
        let dir = Path::new(model);
        if dir.is_dir() {
            Self::from_dir(dir)
        } else {
            Self::from_hub(model)
        }
    }
}

/// Distinct shard file names from a safetensors index, sorted.
fn weight_shards(index_json: &str) -> Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct Index {
        weight_map: std::collections::BTreeMap<String, String>,
    }
    let index: Index = serde_json::from_str(index_json)?;
    let mut shards: Vec<String> = index.weight_map.into_values().collect();
    shards.sort();
    shards.dedup();
    if shards.is_empty() {
        return Err(Error::Config("safetensors index lists no shards".into()));
    }
    Ok(shards)
}

/// Resize to the model's square input and scale pixels to `[-1, 1]`.
///
/// Returns a `(3, 448, 448)` channel-first tensor.
pub fn preprocess(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let resized = image::imageops::resize(
        image,
        IMAGE_SIZE,
        IMAGE_SIZE,
        FilterType::Triangle,
    );
    let side = IMAGE_SIZE as usize;
    let raw = resized.into_raw();
    let tensor = Tensor::from_vec(raw, (side, side, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2.0 / 255.0, -1.0)?;
    Ok(tensor)
}

pub struct ColPali {
    model: colpali::Model,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
}

impl ColPali {
    pub fn load(model: &str, device: Device) -> Result<Self> {
        let files = ModelFiles::resolve(model)?;
        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };
        info!(
            model,
            shards = files.weights.len(),
            ?dtype,
            "loading ColPali weights"
        );

        let tokenizer = Tokenizer::from_file(&files.tokenizer)?;
        // SAFETY: the shards are not modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)?
        };
        let model =
            colpali::Model::new(&paligemma::Config::paligemma_3b_448(), vb)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dtype,
        })
    }

    /// `(batch, tokens)` ids, one row per text. Rows must tokenize to the
    /// same length.
    fn token_ids(&self, texts: Vec<&str>) -> Result<Tensor> {
        let encodings = self.tokenizer.encode_batch(texts, true)?;
        let rows = encodings
            .iter()
            .map(|e| Tensor::new(e.get_ids(), &self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::stack(&rows, 0)?)
    }

    /// One `IMAGE_PATCHES x DIMENSION` row list per image, input order.
    pub fn embed_images(
        &mut self,
        images: &[&RgbImage],
    ) -> Result<Vec<Vec<Vec<f32>>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let pixels = images
            .iter()
            .map(|img| preprocess(img, &self.device))
            .collect::<Result<Vec<_>>>()?;
        let pixels = Tensor::stack(&pixels, 0)?.to_dtype(self.dtype)?;
        let prompt = self.token_ids(vec![IMAGE_PROMPT; images.len()])?;

        self.model.model.clear_kv_cache();
        let out = self.model.forward_images(&pixels, &prompt)?;
        debug!(shape = ?out.dims(), "image forward pass");

        // Image tokens come first; the prompt rows follow.
        Ok(out
            .narrow(1, 0, IMAGE_PATCHES)?
            .to_dtype(DType::F32)?
            .to_vec3::<f32>()?)
    }

    /// One row per query token.
    pub fn embed_query(&mut self, query: &str) -> Result<Vec<Vec<f32>>> {
        let ids = self.token_ids(vec![query])?;
        self.model.model.clear_kv_cache();
        Ok(self
            .model
            .forward_text(&ids)?
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?)
    }
}

impl std::fmt::Debug for ColPali {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColPali")
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}
