//! Document extraction: page text and a frame-sized image per page.
//!
//! pdfium is bound through `pdfium-auto`, which downloads and caches the
//! shared library on first use. All pdfium calls happen inside
//! `spawn_blocking`; the library keeps thread-local state and rendering is
//! CPU-bound.
//!
//! Pages are rendered at twice the frame size and then resized to exactly
//! `Resolution::dimensions()` with Lanczos3, so every frame of the final
//! video has the same size regardless of the page's aspect ratio.

use crate::config::{PageCount, Resolution};
use crate::error::ExtractionError;
use crate::pipeline::input::resolve_input;
use futures::future::BoxFuture;
use image::imageops::FilterType;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One extracted page.
#[derive(Debug, Clone)]
pub struct Page {
    /// 0-based, contiguous.
    pub index: usize,
    /// Text layer content; empty for image-only pages.
    pub text: String,
    /// Rendered page at exactly the target frame size.
    pub image: DynamicImage,
}

/// Result of [`extract_document`].
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    /// Page count of the whole document, not only the extracted prefix.
    pub total_pages: usize,
    pub pages: Vec<Page>,
}

impl ExtractedDocument {
    pub fn texts(&self) -> Vec<String> {
        self.pages.iter().map(|p| p.text.clone()).collect()
    }
}

/// Turns a document reference (local path or URL) into pages.
///
/// The pipeline holds one as `Arc<dyn DocumentExtractor>`; the default is
/// [`PdfiumExtractor`].
pub trait DocumentExtractor: Send + Sync {
    fn extract<'a>(
        &'a self,
        document: &'a str,
        count: PageCount,
        resolution: Resolution,
    ) -> BoxFuture<'a, Result<ExtractedDocument, ExtractionError>>;
}

/// Resolves the input with [`resolve_input`] and renders it with pdfium.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfiumExtractor;

impl DocumentExtractor for PdfiumExtractor {
    fn extract<'a>(
        &'a self,
        document: &'a str,
        count: PageCount,
        resolution: Resolution,
    ) -> BoxFuture<'a, Result<ExtractedDocument, ExtractionError>> {
        Box::pin(async move {
            // Keeps a downloaded file alive until extraction is done.
            let input = resolve_input(document).await?;
            extract_document(input.path(), count, resolution).await
        })
    }
}

/// Extract the first `count` pages of the PDF at `path`.
pub async fn extract_document(
    path: &Path,
    count: PageCount,
    resolution: Resolution,
) -> Result<ExtractedDocument, ExtractionError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&path, count, resolution))
        .await
        .map_err(|e| ExtractionError::Internal(format!("Extraction task panicked: {e}")))?
}

fn extract_blocking(
    path: &Path,
    count: PageCount,
    resolution: Resolution,
) -> Result<ExtractedDocument, ExtractionError> {
    let pdfium = pdfium_auto::bind_pdfium_silent()
        .map_err(|e| ExtractionError::PdfiumBindingFailed(e.to_string()))?;

    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| classify_load_error(path, &e))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if total_pages == 0 {
        return Err(ExtractionError::EmptyDocument {
            path: path.to_path_buf(),
        });
    }

    let selected = count.resolve(total_pages);
    let (width, height) = resolution.dimensions();
    info!(
        "PDF loaded: {} pages, extracting {} at {}",
        total_pages, selected, resolution
    );

    let render_config = PdfRenderConfig::new()
        .set_target_width((width * 2) as i32)
        .set_maximum_height((height * 2) as i32);

    let mut out = Vec::with_capacity(selected);
    for idx in 0..selected {
        let page = pages
            .get(idx as u16)
            .map_err(|e| ExtractionError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{e:?}"),
            })?;

        let text = page
            .text()
            .map_err(|e| ExtractionError::TextFailed {
                page: idx + 1,
                detail: format!("{e:?}"),
            })?
            .all();

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            ExtractionError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{e:?}"),
            }
        })?;
        let image = fit_to_frame(bitmap.as_image(), resolution);

        debug!(
            "Page {}: {} chars of text, frame {}x{}",
            idx + 1,
            text.len(),
            image.width(),
            image.height()
        );
        out.push(Page {
            index: idx,
            text: text.trim().to_string(),
            image,
        });
    }

    Ok(ExtractedDocument {
        total_pages,
        pages: out,
    })
}

/// Resize a rendered page to the exact frame size for `resolution`.
pub fn fit_to_frame(image: DynamicImage, resolution: Resolution) -> DynamicImage {
    let (w, h) = resolution.dimensions();
    if image.width() == w && image.height() == h {
        return image;
    }
    image.resize_exact(w, h, FilterType::Lanczos3)
}

fn classify_load_error(path: &Path, err: &PdfiumError) -> ExtractionError {
    let detail = format!("{err:?}");
    let path: PathBuf = path.to_path_buf();
    if detail.contains("Password") || detail.contains("password") {
        ExtractionError::PasswordRequired { path }
    } else {
        ExtractionError::CorruptPdf { path, detail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    #[test]
    fn fit_to_frame_resizes_exactly() {
        let portrait = DynamicImage::ImageRgba8(RgbaImage::from_pixel(300, 900, Rgba([255; 4])));
        for res in Resolution::ALL {
            let framed = fit_to_frame(portrait.clone(), res);
            assert_eq!((framed.width(), framed.height()), res.dimensions());
        }
    }

    #[test]
    fn fit_to_frame_keeps_matching_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(854, 480, Rgba([1, 2, 3, 255])));
        let framed = fit_to_frame(img, Resolution::P480);
        assert_eq!(framed.get_pixel(0, 0), Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn texts_in_page_order() {
        let blank = DynamicImage::new_rgba8(2, 2);
        let doc = ExtractedDocument {
            total_pages: 5,
            pages: vec![
                Page {
                    index: 0,
                    text: "one".into(),
                    image: blank.clone(),
                },
                Page {
                    index: 1,
                    text: String::new(),
                    image: blank,
                },
            ],
        };
        assert_eq!(doc.texts(), vec!["one".to_string(), String::new()]);
    }
}
