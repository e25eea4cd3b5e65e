use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::{
    error::{Error, Result},
    render::PageRenderer,
    walker::{self, DiscoveredFile},
};

/// One rendered page: its raster and its extracted plain text (possibly
/// empty).
#[derive(Debug, Clone)]
pub struct PageContent {
    pub image: RgbImage,
    pub text: String,
}

/// All pages of one document, in physical page order.
#[derive(Debug, Clone)]
pub struct DocumentPages {
    pub document_name: String,
    pub path: PathBuf,
    pub mtime: u64,
    pub pages: Vec<PageContent>,
}

/// A file and, unless it was filtered out, its extraction result.
pub type CorpusItem<'a> = (&'a DiscoveredFile, Option<Result<DocumentPages>>);

/// A scanned corpus directory.
///
/// Scanning only lists files. Rendering happens lazily, one document at a
/// time, when [`Corpus::documents`] is iterated; calling it again restarts
/// from the first document.
#[derive(Debug, Clone)]
pub struct Corpus {
    root: PathBuf,
    files: Vec<DiscoveredFile>,
}

impl Corpus {
    pub fn scan(root: &Path, patterns: &[String]) -> Result<Self> {
        let include = walker::compile_patterns(patterns)?;
        let files = walker::discover_files(root, &include).map_err(|e| {
            Error::CorpusRead {
                path: root.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[DiscoveredFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Render documents in lexical order of their relative path.
    ///
    /// Each item is either the document's pages or the error that made it
    /// unusable ([`Error::CorpusRead`] or [`Error::PageCountMismatch`]).
    /// Errors never end the iteration.
    pub fn documents<'a, R: PageRenderer + ?Sized>(
        &'a self,
        renderer: &'a R,
    ) -> impl Iterator<Item = Result<DocumentPages>> + 'a {
        self.documents_where(renderer, |_| true)
            .filter_map(|(_, extracted)| extracted)
    }

    /// Like [`Corpus::documents`], but only files accepted by `render_if`
    /// are rendered. Every file is still yielded; the rejected ones come
    /// with `None`.
    pub fn documents_where<'a, R, F>(
        &'a self,
        renderer: &'a R,
        mut render_if: F,
    ) -> impl Iterator<Item = CorpusItem<'a>> + 'a
    where
        R: PageRenderer + ?Sized,
        F: FnMut(&DiscoveredFile) -> bool + 'a,
    {
        self.files.iter().map(move |file| {
            let extracted =
                render_if(file).then(|| extract_document(renderer, file));
            (file, extracted)
        })
    }
}

/// Render one discovered file into its pages.
pub fn extract_document<R: PageRenderer + ?Sized>(
    renderer: &R,
    file: &DiscoveredFile,
) -> Result<DocumentPages> {
    let path = &file.absolute_path;
    let rendered = renderer.render_document(path).map_err(|e| match e {
        Error::CorpusRead { .. } => e,
        other => Error::CorpusRead {
            path: path.clone(),
            reason: other.to_string(),
        },
    })?;

    if rendered.images.len() != rendered.texts.len() {
        return Err(Error::PageCountMismatch {
            path: path.clone(),
            images: rendered.images.len(),
            texts: rendered.texts.len(),
        });
    }

    let pages = rendered
        .images
        .into_iter()
        .zip(rendered.texts)
        .map(|(image, text)| PageContent { image, text })
        .collect();

    Ok(DocumentPages {
        document_name: file.document_name(),
        path: path.clone(),
        mtime: file.mtime,
        pages,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::render::RenderedDocument;

    /// Treats each file's content as `<images>:<texts>` page counts;
    /// anything unparsable fails to open.
    #[derive(Default)]
    struct CountRenderer {
        calls: RefCell<Vec<PathBuf>>,
    }

    impl PageRenderer for CountRenderer {
        fn render_document(&self, path: &Path) -> Result<RenderedDocument> {
            self.calls.borrow_mut().push(path.to_path_buf());
            let content = std::fs::read_to_string(path)?;
            let (imgs, texts) = content
                .trim()
                .split_once(':')
                .and_then(|(a, b)| {
                    Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?))
                })
                .ok_or_else(|| Error::CorpusRead {
                    path: path.to_path_buf(),
                    reason: "not a document".into(),
                })?;
            Ok(RenderedDocument {
                images: vec![RgbImage::new(1, 1); imgs],
                texts: (0..texts).map(|i| format!("page {i}")).collect(),
            })
        }

        fn render_page(&self, _: &Path, _: u32) -> Result<RgbImage> {
            Ok(RgbImage::new(1, 1))
        }
    }

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn yields_documents_in_order_with_page_order() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "b.pdf", "2:2");
        write(tmp.path(), "a.pdf", "3:3");

        let corpus = Corpus::scan(tmp.path(), &[]).unwrap();
        let renderer = CountRenderer::default();
        let docs: Vec<_> = corpus
            .documents(&renderer)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].document_name, "a.pdf");
        assert_eq!(docs[0].pages.len(), 3);
        assert_eq!(docs[0].pages[2].text, "page 2");
        assert_eq!(docs[1].document_name, "b.pdf");
    }

    #[test]
    fn errors_do_not_stop_the_scan() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.pdf", "garbage");
        write(tmp.path(), "b.pdf", "2:1");
        write(tmp.path(), "c.pdf", "1:1");

        let corpus = Corpus::scan(tmp.path(), &[]).unwrap();
        let renderer = CountRenderer::default();
        let results: Vec<_> = corpus.documents(&renderer).collect();

        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Err(Error::CorpusRead { .. })));
        assert!(matches!(
            results[1],
            Err(Error::PageCountMismatch {
                images: 2,
                texts: 1,
                ..
            })
        ));
        assert_eq!(results[2].as_ref().unwrap().pages.len(), 1);
    }

    #[test]
    fn iteration_is_lazy_and_restartable() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.pdf", "1:1");
        write(tmp.path(), "b.pdf", "1:1");

        let corpus = Corpus::scan(tmp.path(), &[]).unwrap();
        let renderer = CountRenderer::default();

        let mut iter = corpus.documents(&renderer);
        assert_eq!(renderer.calls.borrow().len(), 0);
        iter.next();
        assert_eq!(renderer.calls.borrow().len(), 1);
        drop(iter);

        let names: Vec<_> = corpus
            .documents(&renderer)
            .map(|d| d.unwrap().document_name)
            .collect();
        assert_eq!(names, vec!["a.pdf", "b.pdf"]);
    }

    #[test]
    fn zero_page_document_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "empty.pdf", "0:0");

        let corpus = Corpus::scan(tmp.path(), &[]).unwrap();
        let doc = corpus
            .documents(&CountRenderer::default())
            .next()
            .unwrap()
            .unwrap();
        assert!(doc.pages.is_empty());
    }

    #[test]
    fn rejected_files_are_yielded_unrendered() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.pdf", "1:1");
        write(tmp.path(), "b.pdf", "2:2");

        let corpus = Corpus::scan(tmp.path(), &[]).unwrap();
        let renderer = CountRenderer::default();
        let items: Vec<_> = corpus
            .documents_where(&renderer, |f| f.document_name() != "a.pdf")
            .map(|(file, doc)| (file.document_name(), doc.map(|d| d.is_ok())))
            .collect();

        assert_eq!(
            items,
            vec![("a.pdf".to_string(), None), ("b.pdf".to_string(), Some(true))]
        );
        assert_eq!(renderer.calls.borrow().len(), 1);
        assert!(renderer.calls.borrow()[0].ends_with("b.pdf"));
    }
}
