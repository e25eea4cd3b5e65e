use crate::{
    corpus::PageContent,
    error::{Error, Result},
};

/// A row-major matrix of `f32` vectors.
///
/// Pages carry one row per image patch; queries carry one row per query
/// token. Row order is meaningful in both cases and is never changed.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    pub rows: u32,
    pub dimension: u32,
    /// `data[row * dimension + dim]`.
    pub data: Vec<f32>,
}

impl EmbeddingMatrix {
    pub fn new(rows: u32, dimension: u32, data: Vec<f32>) -> Result<Self> {
        if data.len() != (rows as usize) * (dimension as usize) {
            return Err(Error::Embedding(format!(
                "expected {rows}x{dimension} values, got {}",
                data.len()
            )));
        }
        Ok(Self {
            rows,
            dimension,
            data,
        })
    }

    /// Build a matrix from individual rows, all of which must have the same
    /// length.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let dimension = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * dimension);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dimension {
                return Err(Error::Embedding(format!(
                    "row {i} has {} values, expected {dimension}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Self::new(rows.len() as u32, dimension as u32, data)
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact panics on a zero chunk size.
        self.data.chunks_exact(self.dimension.max(1) as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

/// Page-side encoder: turns rendered pages into fixed-size patch matrices.
///
/// Every returned matrix must have exactly [`patches_per_page`] rows of
/// [`dimension`] values, in the same order as the input pages.
///
/// [`patches_per_page`]: PageEmbedder::patches_per_page
/// [`dimension`]: PageEmbedder::dimension
pub trait PageEmbedder {
    fn patches_per_page(&self) -> usize;

    fn dimension(&self) -> usize;

    fn embed_pages(
        &mut self,
        pages: &[PageContent],
    ) -> Result<Vec<EmbeddingMatrix>>;
}

/// Query-side encoder. Uses the model's query mode, which is not
/// interchangeable with the page-side mode.
pub trait QueryEncoder {
    fn encode_query(&mut self, query: &str) -> Result<EmbeddingMatrix>;
}

/// Embed pages in batches of `batch_size`, returning one matrix per page in
/// input order.
///
/// Fails if the embedder returns the wrong number of matrices for a batch or
/// a matrix whose shape differs from the embedder's configuration.
pub fn embed_in_batches<E: PageEmbedder + ?Sized>(
    embedder: &mut E,
    pages: &[PageContent],
    batch_size: usize,
    mut on_batch: impl FnMut(usize),
) -> Result<Vec<EmbeddingMatrix>> {
    let patches = embedder.patches_per_page();
    let dimension = embedder.dimension();
    let mut out = Vec::with_capacity(pages.len());

    for batch in pages.chunks(batch_size.max(1)) {
        let embedded = embedder.embed_pages(batch)?;
        if embedded.len() != batch.len() {
            return Err(Error::Embedding(format!(
                "embedder returned {} results for a batch of {}",
                embedded.len(),
                batch.len()
            )));
        }
        for matrix in &embedded {
            if matrix.rows as usize != patches
                || matrix.dimension as usize != dimension
            {
                return Err(Error::Embedding(format!(
                    "page embedding is {}x{}, expected {patches}x{dimension}",
                    matrix.rows, matrix.dimension
                )));
            }
        }
        out.extend(embedded);
        on_batch(batch.len());
    }

    Ok(out)
}
