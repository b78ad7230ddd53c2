//! PDF rasterisation: render the first page of a receipt PDF via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and does CPU-heavy work. [`render_first_page`] moves the call onto
//! tokio's blocking pool so async workers never stall on it.
//!
//! ## Why cap pixels, not DPI?
//!
//! Receipts arrive as anything from a 58 mm thermal slip to an A4 invoice.
//! Capping the longest edge keeps memory bounded and keeps the frame inside
//! the size range vision models read best (roughly 1,000–2,000 px).

use crate::error::ReceiptError;
use crate::record::FileKind;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns PDF bytes into a raster frame of the first page.
///
/// Implementations are blocking and are always invoked from
/// `spawn_blocking`.
pub trait PageRasterizer: Send + Sync {
    fn first_page(&self, pdf: &[u8]) -> Result<DynamicImage, ReceiptError>;
}

/// [`PageRasterizer`] backed by a dynamically loaded pdfium library.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    lib_path: Option<PathBuf>,
    max_pixels: u32,
}

impl PdfiumRasterizer {
    /// `lib_path` points at a pdfium shared library; when `None`, the
    /// `PDFIUM_LIB_PATH` environment variable and then the system library
    /// search path are tried.
    pub fn new(lib_path: Option<PathBuf>, max_pixels: u32) -> Self {
        Self {
            lib_path,
            max_pixels,
        }
    }

    fn bind(&self) -> Result<Pdfium, ReceiptError> {
        let explicit = self
            .lib_path
            .clone()
            .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));

        let bindings = match explicit {
            Some(path) => Pdfium::bind_to_library(&path).map_err(|e| {
                ReceiptError::PdfiumBindingFailed(format!("{}: {}", path.display(), e))
            })?,
            None => Pdfium::bind_to_system_library()
                .map_err(|e| ReceiptError::PdfiumBindingFailed(e.to_string()))?,
        };
        Ok(Pdfium::new(bindings))
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn first_page(&self, pdf: &[u8]) -> Result<DynamicImage, ReceiptError> {
        let pdfium = self.bind()?;
        let decode_err = |detail: String| ReceiptError::DecodeFailed {
            kind: FileKind::Pdf,
            detail,
        };

        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| decode_err(format!("{:?}", e)))?;

        let pages = document.pages();
        info!("PDF loaded: {} pages, rendering page 1", pages.len());
        if pages.len() == 0 {
            return Err(decode_err("document has no pages".into()));
        }

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32);

        let page = pages
            .get(0)
            .map_err(|e| decode_err(format!("page 1: {:?}", e)))?;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| decode_err(format!("page 1: {:?}", e)))?;

        let image = bitmap.as_image();
        debug!("Rendered page 1 → {}x{} px", image.width(), image.height());
        Ok(image)
    }
}

/// Rasterise page 1 on the blocking pool.
pub async fn render_first_page(
    rasterizer: Arc<dyn PageRasterizer>,
    pdf: Arc<[u8]>,
) -> Result<DynamicImage, ReceiptError> {
    tokio::task::spawn_blocking(move || rasterizer.first_page(&pdf))
        .await
        .map_err(|e| ReceiptError::Internal(format!("Render task panicked: {}", e)))?
}
