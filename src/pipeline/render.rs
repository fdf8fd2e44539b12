//! PDF rasterisation behind the [`PageRenderer`] seam.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which is CPU-bound and keeps
//! thread-local state. [`count_pages`] and [`render_document`] move every
//! renderer call onto the blocking pool so Tokio workers keep driving
//! extraction calls for other documents meanwhile.
//!
//! ## Why a trait?
//!
//! Rendering is an external collaborator of the pipeline: the pipeline only
//! needs "page images plus pixel dimensions, or `InvalidDocument`". Tests
//! plug in an in-memory renderer; production uses [`PdfiumRenderer`].

use crate::error::TableError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One rasterised page. Read-only once produced.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// 1-indexed page number.
    pub page_number: usize,
    pub image: DynamicImage,
}

impl RenderedPage {
    pub fn new(page_number: usize, image: DynamicImage) -> Self {
        Self { page_number, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Turns a PDF file into page images. Implementations are blocking.
pub trait PageRenderer: Send + Sync {
    /// Number of pages, validating that the file opens with `password`.
    fn page_count(&self, pdf_path: &Path, password: Option<&str>) -> Result<usize, TableError>;

    /// Render every page at `dpi`, capping either dimension at `max_pixels`.
    fn render_pages(
        &self,
        pdf_path: &Path,
        password: Option<&str>,
        dpi: u32,
        max_pixels: u32,
    ) -> Result<Vec<RenderedPage>, TableError>;
}

/// Count pages on the blocking pool.
pub async fn count_pages(
    renderer: Arc<dyn PageRenderer>,
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<usize, TableError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());
    tokio::task::spawn_blocking(move || renderer.page_count(&path, pwd.as_deref()))
        .await
        .map_err(|e| TableError::Internal(format!("Page-count task panicked: {}", e)))?
}

/// Render all pages on the blocking pool.
pub async fn render_document(
    renderer: Arc<dyn PageRenderer>,
    pdf_path: &Path,
    password: Option<&str>,
    dpi: u32,
    max_pixels: u32,
) -> Result<Vec<RenderedPage>, TableError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());
    tokio::task::spawn_blocking(move || {
        renderer.render_pages(&path, pwd.as_deref(), dpi, max_pixels)
    })
    .await
    .map_err(|e| TableError::Internal(format!("Render task panicked: {}", e)))?
}

/// [`PageRenderer`] backed by a pdfium shared library.
///
/// The library is located through `PDFIUM_LIB_PATH` (a file or the directory
/// holding it) and otherwise through the system library search path.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRenderer {
    library_path: Option<PathBuf>,
}

impl PdfiumRenderer {
    /// Use `PDFIUM_LIB_PATH` when set, else the system library.
    pub fn from_env() -> Self {
        Self {
            library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    /// Use the pdfium library at `path` (file or directory).
    pub fn with_library_path(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, TableError> {
        let bindings = match &self.library_path {
            Some(path) if path.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
            }
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| TableError::PdfiumBindingFailed(format!("{:?}", e)))?;
        Ok(Pdfium::new(bindings))
    }
}

/// Map a pdfium load failure onto `InvalidDocument` with a useful detail.
fn load_error(pdf_path: &Path, password: Option<&str>, err_str: String) -> TableError {
    let detail = if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            format!("wrong password for '{}'", pdf_path.display())
        } else {
            format!("'{}' is encrypted and requires a password", pdf_path.display())
        }
    } else {
        format!("'{}' could not be opened: {}", pdf_path.display(), err_str)
    };
    TableError::invalid_document(detail)
}

impl PageRenderer for PdfiumRenderer {
    fn page_count(&self, pdf_path: &Path, password: Option<&str>) -> Result<usize, TableError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(pdf_path, password)
            .map_err(|e| load_error(pdf_path, password, format!("{:?}", e)))?;
        Ok(document.pages().len() as usize)
    }

    fn render_pages(
        &self,
        pdf_path: &Path,
        password: Option<&str>,
        dpi: u32,
        max_pixels: u32,
    ) -> Result<Vec<RenderedPage>, TableError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(pdf_path, password)
            .map_err(|e| load_error(pdf_path, password, format!("{:?}", e)))?;

        let pages = document.pages();
        info!("PDF loaded: {} pages", pages.len());

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(dpi as f32 / 72.0)
            .set_maximum_width(max_pixels as i32)
            .set_maximum_height(max_pixels as i32);

        let mut results = Vec::with_capacity(pages.len() as usize);
        for (idx, page) in pages.iter().enumerate() {
            let page_number = idx + 1;
            let bitmap =
                page.render_with_config(&render_config)
                    .map_err(|e| TableError::RenderFailed {
                        page: page_number,
                        detail: format!("{:?}", e),
                    })?;

            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                page_number,
                image.width(),
                image.height()
            );
            results.push(RenderedPage::new(page_number, image));
        }

        Ok(results)
    }
}
