use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::{
    binary::{self, BinaryPatches},
    corpus::PageContent,
    embedding::EmbeddingMatrix,
    error::{Error, Result},
    page_id::PageId,
    render::{self, ResizeSpec},
};

/// The atomic retrievable unit: one rendered, embedded and quantized page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub id: PageId,
    pub document_name: String,
    pub path: String,
    /// 0-indexed physical page number.
    pub page_number: u32,
    pub raw_text: String,
    /// PNG bytes of the (optionally downscaled) page raster.
    pub image: Vec<u8>,
    pub embedding: BinaryPatches,
}

impl Page {
    /// Assemble a page record from its rendered content and its float patch
    /// embedding. The embedding is quantized here; `thumbnail` bounds the
    /// stored image.
    pub fn assemble(
        document_name: &str,
        path: &str,
        page_number: u32,
        content: &PageContent,
        embedding: &EmbeddingMatrix,
        thumbnail: Option<ResizeSpec>,
    ) -> Result<Self> {
        let image = match thumbnail {
            Some(spec) => render::encode_png(&spec.apply(&content.image))?,
            None => render::encode_png(&content.image)?,
        };

        Ok(Self {
            id: PageId::new(document_name, page_number),
            document_name: document_name.to_string(),
            path: path.to_string(),
            page_number,
            raw_text: content.text.clone(),
            image,
            embedding: binary::quantize(embedding),
        })
    }
}

/// The feed wire form of a [`Page`]: every field the index stores, with the
/// image base64-encoded and the embedding as `{patch index: packed hex}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedRecord {
    pub id: String,
    pub name: String,
    pub path: String,
    pub page_number: u32,
    pub image: String,
    pub text: String,
    pub embedding: BTreeMap<u32, String>,
}

impl From<&Page> for FeedRecord {
    fn from(page: &Page) -> Self {
        let embedding = page
            .embedding
            .iter_patches()
            .enumerate()
            .map(|(i, bytes)| (i as u32, hex::encode(bytes)))
            .collect();

        Self {
            id: page.id.hex.clone(),
            name: page.document_name.clone(),
            path: page.path.clone(),
            page_number: page.page_number,
            image: BASE64.encode(&page.image),
            text: page.raw_text.clone(),
            embedding,
        }
    }
}

impl FeedRecord {
    /// Decode back into a page. `dimension` is the bit width of each patch,
    /// which the hex form alone cannot recover when it is not a multiple of
    /// eight.
    pub fn into_page(self, dimension: u32) -> Result<Page> {
        let bad = |what: &str| {
            Error::Config(format!("feed record {}: {what}", self.id))
        };

        let id = PageId::from_hex(&self.id).ok_or_else(|| bad("invalid id"))?;
        if id != PageId::new(&self.name, self.page_number) {
            return Err(bad("id does not match name and page number"));
        }
        let image = BASE64
            .decode(self.image.as_bytes())
            .map_err(|e| bad(&format!("image: {e}")))?;

        // Patch keys must be 0..n with no gaps.
        let mut data = Vec::new();
        for (expected, (idx, cell)) in self.embedding.iter().enumerate() {
            if *idx as usize != expected {
                return Err(bad("embedding patch indices are not contiguous"));
            }
            let bytes = hex::decode(cell)
                .map_err(|e| bad(&format!("embedding patch {idx}: {e}")))?;
            data.extend(bytes);
        }
        let embedding = BinaryPatches::from_packed(
            self.embedding.len() as u32,
            dimension,
            data,
        )?;

        Ok(Page {
            id,
            document_name: self.name,
            path: self.path,
            page_number: self.page_number,
            raw_text: self.text,
            image,
            embedding,
        })
    }
}
