//! Turning ranked hits back into page images on disk.

use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    render::{self, PageRenderer, ResizeSpec},
    retrieval::RankedHit,
};

pub const DEFAULT_SAVE_DIR: &str = "retrieved_pages";
pub const DEFAULT_RESIZE: u32 = 640;

/// Where a hit's raster comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSource {
    /// Render the page again from its source document at full resolution.
    #[default]
    Rerender,
    /// Use the image blob returned with the hit, rendering only when the
    /// hit carries none.
    StoredImage,
}

/// A hit that could not be turned into an image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedHit {
    pub rank: usize,
    pub page_id: String,
    pub document_name: String,
    pub page_number: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedPage {
    pub rank: usize,
    pub page_id: String,
    pub file: PathBuf,
}

/// Outcome of [`ResultMaterializer::save`]: partial success is normal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveReport {
    pub saved: Vec<SavedPage>,
    pub dropped: Vec<DroppedHit>,
}

/// `{rank:02}_{document stem}_p{page_number + 1}.png`
pub fn file_name(rank: usize, document_name: &str, page_number: u32) -> String {
    let stem = Path::new(document_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| document_name.replace('/', "_"));
    format!("{rank:02}_{stem}_p{}.png", page_number + 1)
}

pub struct ResultMaterializer<'a, R: ?Sized> {
    renderer: &'a R,
    resize: Option<ResizeSpec>,
    source: ImageSource,
}

impl<'a, R: PageRenderer + ?Sized> ResultMaterializer<'a, R> {
    pub fn new(renderer: &'a R) -> Self {
        Self {
            renderer,
            resize: None,
            source: ImageSource::default(),
        }
    }

    pub fn with_resize(mut self, resize: Option<ResizeSpec>) -> Self {
        self.resize = resize;
        self
    }

    pub fn with_source(mut self, source: ImageSource) -> Self {
        self.source = source;
        self
    }

    /// The raster for one hit, downscaled when a bound is set.
    pub fn resolve(&self, hit: &RankedHit) -> Result<RgbImage> {
        let path = Path::new(&hit.path);
        let fail = |reason: String| Error::PageResolution {
            path: path.to_path_buf(),
            page_number: hit.page_number,
            reason,
        };

        let stored = match (self.source, &hit.image) {
            (ImageSource::StoredImage, Some(bytes)) => Some(
                render::decode_png(bytes)
                    .map_err(|e| fail(format!("stored image: {e}")))?,
            ),
            _ => None,
        };
        let image = match stored {
            Some(image) => image,
            None => {
                if !path.is_file() {
                    return Err(fail("source document not found".into()));
                }
                self.renderer
                    .render_page(path, hit.page_number)
                    .map_err(|e| match e {
                        Error::PageResolution { .. } => e,
                        other => fail(other.to_string()),
                    })?
            }
        };

        Ok(match &self.resize {
            Some(spec) => spec.apply(&image),
            None => image,
        })
    }

    /// Resolve every hit and write it as PNG into `dir`.
    ///
    /// Hits that cannot be resolved are warned about and listed in the
    /// report; the others are still saved. Failing to write a file is an
    /// error.
    pub fn save(&self, hits: &[RankedHit], dir: &Path) -> Result<SaveReport> {
        std::fs::create_dir_all(dir)?;
        let mut report = SaveReport::default();

        for hit in hits {
            let image = match self.resolve(hit) {
                Ok(image) => image,
                Err(e @ Error::PageResolution { .. }) => {
                    warn!(
                        document = %hit.document_name,
                        page = hit.page_number,
                        error = %e,
                        "dropping hit"
                    );
                    report.dropped.push(DroppedHit {
                        rank: hit.rank,
                        page_id: hit.page_id.clone(),
                        document_name: hit.document_name.clone(),
                        page_number: hit.page_number,
                        reason: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            let file = dir.join(file_name(
                hit.rank,
                &hit.document_name,
                hit.page_number,
            ));
            std::fs::write(&file, render::encode_png(&image)?)?;
            debug!(file = %file.display(), "saved page");
            report.saved.push(SavedPage {
                rank: hit.rank,
                page_id: hit.page_id.clone(),
                file,
            });
        }

        Ok(report)
    }
}
