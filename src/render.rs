//! Page rasterization and image helpers.
//!
//! Rendering goes through the [`PageRenderer`] trait so the indexer and the
//! materializer can be driven by something other than pdfium in tests.

use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use image::{
    DynamicImage, ImageFormat, RgbImage, RgbaImage, imageops::FilterType,
};
use pdfium_render::prelude::*;

use crate::error::{Error, Result};

/// Environment variable naming the directory holding the pdfium shared
/// library. Falls back to the system library when unset.
pub const PDFIUM_LIB_ENV_VAR: &str = "PDFIUM_DYNAMIC_LIB_PATH";

pub const DEFAULT_DPI: f32 = 200.0;

/// All pages of one document, in physical order.
#[derive(Debug, Clone, Default)]
pub struct RenderedDocument {
    pub images: Vec<RgbImage>,
    pub texts: Vec<String>,
}

pub trait PageRenderer {
    /// Render every page and extract its text. The two vectors are expected
    /// to have the same length; callers check.
    fn render_document(&self, path: &Path) -> Result<RenderedDocument>;

    /// Render a single 0-indexed page.
    fn render_page(&self, path: &Path, page_number: u32) -> Result<RgbImage>;
}

pub struct PdfiumRenderer {
    pdfium: Pdfium,
    dpi: f32,
}

impl PdfiumRenderer {
    /// Bind pdfium from [`PDFIUM_LIB_ENV_VAR`] if set, else from the system
    /// library search path.
    pub fn new() -> Result<Self> {
        let bindings = match std::env::var_os(PDFIUM_LIB_ENV_VAR) {
            Some(dir) => Pdfium::bind_to_library(
                Pdfium::pdfium_platform_library_name_at_path(&PathBuf::from(
                    dir,
                )),
            ),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| Error::Config(format!("cannot load pdfium: {e}")))?;

        Ok(Self {
            pdfium: Pdfium::new(bindings),
            dpi: DEFAULT_DPI,
        })
    }

    pub fn with_dpi(mut self, dpi: f32) -> Self {
        self.dpi = dpi;
        self
    }

    fn config(&self) -> PdfRenderConfig {
        PdfRenderConfig::new().scale_page_by_factor(self.dpi / 72.0)
    }

    fn open(&self, path: &Path) -> Result<PdfDocument<'_>> {
        self.pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| Error::CorpusRead {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

fn bitmap_to_rgb(bitmap: &PdfBitmap) -> Option<RgbImage> {
    let width = bitmap.width() as u32;
    let height = bitmap.height() as u32;
    RgbaImage::from_raw(width, height, bitmap.as_rgba_bytes())
        .map(|rgba| DynamicImage::ImageRgba8(rgba).into_rgb8())
}

impl PageRenderer for PdfiumRenderer {
    fn render_document(&self, path: &Path) -> Result<RenderedDocument> {
        let read_err = |reason: String| Error::CorpusRead {
            path: path.to_path_buf(),
            reason,
        };

        let document = self.open(path)?;
        let config = self.config();
        let mut out = RenderedDocument::default();

        for (idx, page) in document.pages().iter().enumerate() {
            let bitmap = page
                .render_with_config(&config)
                .map_err(|e| read_err(format!("page {idx}: {e}")))?;
            let image = bitmap_to_rgb(&bitmap).ok_or_else(|| {
                read_err(format!("page {idx}: bitmap size mismatch"))
            })?;
            out.images.push(image);

            // A page without a text layer still counts; its text is empty.
            let text = page.text().map(|t| t.all()).unwrap_or_default();
            out.texts.push(text);
        }

        Ok(out)
    }

    fn render_page(&self, path: &Path, page_number: u32) -> Result<RgbImage> {
        let resolve_err = |reason: String| Error::PageResolution {
            path: path.to_path_buf(),
            page_number,
            reason,
        };

        let document = self
            .pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| resolve_err(e.to_string()))?;
        let index = PdfPageIndex::try_from(page_number)
            .map_err(|_| resolve_err("page number out of range".into()))?;
        let page = document
            .pages()
            .get(index)
            .map_err(|e| resolve_err(e.to_string()))?;
        let bitmap = page
            .render_with_config(&self.config())
            .map_err(|e| resolve_err(e.to_string()))?;

        bitmap_to_rgb(&bitmap)
            .ok_or_else(|| resolve_err("bitmap size mismatch".into()))
    }
}

/// Which side of the image the resize bound applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundSide {
    #[default]
    Height,
    Longer,
    Shorter,
}

/// Aspect-preserving downscale bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeSpec {
    pub pixels: u32,
    pub side: BoundSide,
}

impl ResizeSpec {
    pub fn new(pixels: u32, side: BoundSide) -> Self {
        Self { pixels, side }
    }

    /// Target dimensions for an image of `width` x `height`. Never larger
    /// than the input.
    pub fn target(&self, width: u32, height: u32) -> (u32, u32) {
        let bound = match self.side {
            BoundSide::Height => height,
            BoundSide::Longer => width.max(height),
            BoundSide::Shorter => width.min(height),
        };
        if bound <= self.pixels || bound == 0 {
            return (width, height);
        }
        let ratio = self.pixels as f64 / bound as f64;
        let scale = |v: u32| ((v as f64 * ratio).round() as u32).max(1);
        (scale(width), scale(height))
    }

    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let (w, h) = self.target(image.width(), image.height());
        if (w, h) == image.dimensions() {
            return image.clone();
        }
        image::imageops::resize(image, w, h, FilterType::Lanczos3)
    }
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

pub fn decode_png(bytes: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Png)?
        .into_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_upscales() {
        let spec = ResizeSpec::new(640, BoundSide::Longer);
        assert_eq!(spec.target(300, 200), (300, 200));
        assert_eq!(spec.target(640, 480), (640, 480));
    }

    #[test]
    fn bounds_longer_side() {
        let spec = ResizeSpec::new(640, BoundSide::Longer);
        assert_eq!(spec.target(1700, 2200), (495, 640));
    }

    #[test]
    fn bounds_shorter_side() {
        let spec = ResizeSpec::new(640, BoundSide::Shorter);
        assert_eq!(spec.target(1280, 2560), (640, 1280));
    }

    #[test]
    fn bounds_height_even_when_width_is_larger() {
        let spec = ResizeSpec::new(100, BoundSide::Height);
        assert_eq!(spec.target(400, 200), (200, 100));
        assert_eq!(spec.target(400, 80), (400, 80));
    }

    #[test]
    fn apply_resizes_pixels() {
        let img = RgbImage::new(40, 20);
        let out = ResizeSpec::new(10, BoundSide::Longer).apply(&img);
        assert_eq!(out.dimensions(), (10, 5));
    }

    #[test]
    fn png_roundtrip_keeps_pixels() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(1, 1, image::Rgb([10, 200, 30]));
        let decoded = decode_png(&encode_png(&img).unwrap()).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode_png(b"not a png"), Err(Error::Image(_))));
    }
}
