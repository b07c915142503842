//! Rendering engine abstraction and its pdfium implementation.
//!
//! The pipeline only needs three capabilities from an engine: begin a
//! document load from bytes, fetch a page, and draw that page into a
//! [`DrawingContext`]. [`PdfiumEngine`] provides them on top of Google's
//! pdfium via `pdfium-render`.

use crate::error::EngineError;
use crate::host::DrawingContext;
use crate::pdf_renderer::Viewport;
use pdfium_render::prelude::*;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Shared handle to a loaded engine. Lives as long as its registry.
pub type EngineHandle = Arc<dyn Engine>;

/// A PDF rendering engine.
pub trait Engine: Send + Sync {
    /// Human readable description, used in logs.
    fn describe(&self) -> String;

    /// Capability probe: can this engine begin a document load?
    fn supports_document_load(&self) -> bool;

    /// Parse a document from its full byte content.
    fn open_document(&self, bytes: Vec<u8>) -> Result<Box<dyn Document + '_>, EngineError>;
}

/// A loaded document.
pub trait Document {
    fn page_count(&self) -> usize;

    /// Page at zero-based `index`.
    fn page(&self, index: usize) -> Result<Box<dyn Page + '_>, EngineError>;
}

/// A single page of a loaded document.
pub trait Page {
    /// Native size in PDF points.
    fn size(&self) -> PageSize;

    /// Draw the page into `ctx`, covering the whole surface.
    fn render(&self, ctx: &mut DrawingContext<'_>, viewport: &Viewport) -> Result<(), EngineError>;
}

/// Page size in PDF points (1/72 inch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// Width in pixels at a given DPI.
    pub fn width_pixels(&self, dpi: u32) -> u32 {
        ((self.width * dpi as f32) / 72.0) as u32
    }

    /// Height in pixels at a given DPI.
    pub fn height_pixels(&self, dpi: u32) -> u32 {
        ((self.height * dpi as f32) / 72.0) as u32
    }
}

/// Engine backed by a bound pdfium library.
pub struct PdfiumEngine {
    pdfium: Pdfium,
    origin: PathBuf,
}

impl PdfiumEngine {
    /// Wrap bindings obtained from `origin` (a library path or "system").
    pub fn new(bindings: Box<dyn PdfiumLibraryBindings>, origin: impl Into<PathBuf>) -> Self {
        Self {
            pdfium: Pdfium::new(bindings),
            origin: origin.into(),
        }
    }
}

impl fmt::Debug for PdfiumEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfiumEngine")
            .field("origin", &self.origin)
            .finish()
    }
}

impl Engine for PdfiumEngine {
    fn describe(&self) -> String {
        format!("pdfium ({})", self.origin.display())
    }

    fn supports_document_load(&self) -> bool {
        self.pdfium.create_new_pdf().is_ok()
    }

    fn open_document(&self, bytes: Vec<u8>) -> Result<Box<dyn Document + '_>, EngineError> {
        let document = self.pdfium.load_pdf_from_byte_vec(bytes, None)?;
        debug!("pdfium loaded document with {} pages", document.pages().len());
        Ok(Box::new(PdfiumDocument { document }))
    }
}

struct PdfiumDocument<'a> {
    document: PdfDocument<'a>,
}

impl<'a> Document for PdfiumDocument<'a> {
    fn page_count(&self) -> usize {
        self.document.pages().len() as usize
    }

    fn page(&self, index: usize) -> Result<Box<dyn Page + '_>, EngineError> {
        let index = u16::try_from(index)
            .map_err(|_| EngineError::new(format!("page index {} out of range", index)))?;
        let page = self.document.pages().get(index)?;
        Ok(Box::new(PdfiumPage { page }))
    }
}

struct PdfiumPage<'a> {
    page: PdfPage<'a>,
}

impl<'a> Page for PdfiumPage<'a> {
    fn size(&self) -> PageSize {
        PageSize::new(self.page.width().value, self.page.height().value)
    }

    fn render(&self, ctx: &mut DrawingContext<'_>, viewport: &Viewport) -> Result<(), EngineError> {
        let (width, height) = viewport.surface_dimensions();
        let render_config = PdfRenderConfig::new()
            .set_target_width(width as i32)
            .set_target_height(height as i32)
            .rotate_if_landscape(PdfPageRenderRotation::None, false);

        let bitmap = self.page.render_with_config(&render_config)?;
        let image = bitmap.as_image().into_rgba8();
        ctx.draw_image(&image);
        Ok(())
    }
}
