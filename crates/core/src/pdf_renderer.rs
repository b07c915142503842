//! First-page rasterization and PNG encoding.
//!
//! This module holds the blocking half of a conversion:
//! - load the document and select page 1
//! - compute a clamped, oversampled viewport
//! - draw into a host surface and encode it (via the `png` crate)
//!
//! Everything here runs on whatever [`Executor`](crate::worker::Executor)
//! the converter configured, so nothing in it awaits.

use crate::config::RenderConfig;
use crate::engine::{Engine, PageSize};
use crate::error::{ConversionError, Result};
use crate::host::{Host, RasterSurface, SmoothingQuality};
use std::io::Cursor;
use std::time::Instant;
use tracing::debug;

/// Index of the only page ever rendered.
pub const FIRST_PAGE: usize = 0;

/// Pixel-space rectangle and scale a page is rendered at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
    pub scale: f32,
}

impl Viewport {
    /// Viewport of `size` at `scale`.
    pub fn for_page(size: PageSize, scale: f32) -> Self {
        Self {
            width: size.width * scale,
            height: size.height * scale,
            scale,
        }
    }

    /// Shrink the viewport proportionally until its floored surface fits
    /// in `max_pixels`.
    pub fn limited_to(self, max_pixels: u64) -> Self {
        if self.pixel_count() <= max_pixels {
            return self;
        }
        let area = self.width as f64 * self.height as f64;
        let mut factor = (max_pixels as f64 / area).sqrt();
        loop {
            let limited = self.scaled(factor);
            if limited.pixel_count() <= max_pixels {
                return limited;
            }
            // Step down by one pixel along the longer edge.
            let (width, height) = limited.surface_dimensions();
            let longest = width.max(height) as f64;
            factor *= (longest - 1.0).max(0.0) / longest;
        }
    }

    fn scaled(&self, factor: f64) -> Self {
        let factor = factor as f32;
        Self {
            width: self.width * factor,
            height: self.height * factor,
            scale: self.scale * factor,
        }
    }

    fn pixel_count(&self) -> u64 {
        let (width, height) = self.surface_dimensions();
        width as u64 * height as u64
    }

    /// Floored surface dimensions.
    pub fn surface_dimensions(&self) -> (u32, u32) {
        (floor_dimension(self.width), floor_dimension(self.height))
    }
}

fn floor_dimension(value: f32) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.floor() as u32
    } else {
        0
    }
}

/// Compute the viewport for a page given the render policy and host.
pub fn compute_viewport(size: PageSize, config: &RenderConfig, device_pixel_ratio: f64) -> Viewport {
    let scale = config.scale.resolve(device_pixel_ratio);
    Viewport::for_page(size, scale).limited_to(config.max_surface_pixels)
}

/// Load `bytes`, select the first page and draw it into a host surface.
pub fn rasterize_first_page(
    engine: &dyn Engine,
    host: &dyn Host,
    bytes: Vec<u8>,
    config: &RenderConfig,
) -> Result<RasterSurface> {
    let start = Instant::now();

    let document = engine
        .open_document(bytes)
        .map_err(|e| ConversionError::DocumentLoadFailed(e.message))?;

    if document.page_count() == 0 {
        return Err(ConversionError::PageUnavailable {
            page: FIRST_PAGE + 1,
            message: "document has no pages".to_string(),
        });
    }

    let page = document
        .page(FIRST_PAGE)
        .map_err(|e| ConversionError::PageUnavailable {
            page: FIRST_PAGE + 1,
            message: e.message,
        })?;

    let viewport = compute_viewport(page.size(), config, host.device_pixel_ratio());
    let (width, height) = viewport.surface_dimensions();
    debug!(
        "Rasterizing page 1 at scale {:.2} into {}x{} px",
        viewport.scale, width, height
    );

    let mut surface = host.create_surface(width, height);
    {
        let mut ctx = host
            .context_2d(&mut surface)
            .ok_or(ConversionError::ContextUnavailable)?;
        ctx.set_image_smoothing(true, SmoothingQuality::High);

        page.render(&mut ctx, &viewport)
            .map_err(|e| ConversionError::RenderFailed {
                page: FIRST_PAGE + 1,
                message: e.message,
            })?;

        if let Some(background) = config.background {
            ctx.flatten(background);
        }
    }

    debug!("Rasterized page 1 in {:?}", start.elapsed());
    Ok(surface)
}

/// Encode a surface to PNG bytes.
///
/// `quality` in [0, 1] selects deflate effort.
pub fn encode_png(surface: &RasterSurface, quality: f32) -> Result<Vec<u8>> {
    if surface.is_empty() {
        return Err(ConversionError::EncodeFailed(format!(
            "surface is empty ({}x{})",
            surface.width(),
            surface.height()
        )));
    }

    let image = surface.image();
    let mut buffer = Cursor::new(Vec::new());

    let mut encoder = png::Encoder::new(&mut buffer, image.width(), image.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_compression(compression_for(quality));

    let mut writer = encoder.write_header().map_err(|e| {
        ConversionError::EncodeFailed(format!("Failed to write PNG header: {}", e))
    })?;

    writer.write_image_data(image.as_raw()).map_err(|e| {
        ConversionError::EncodeFailed(format!("Failed to write PNG data: {}", e))
    })?;

    writer
        .finish()
        .map_err(|e| ConversionError::EncodeFailed(format!("Failed to finish PNG: {}", e)))?;

    let data = buffer.into_inner();
    if data.is_empty() {
        return Err(ConversionError::EncodeFailed("encoder wrote no bytes".to_string()));
    }
    Ok(data)
}

fn compression_for(quality: f32) -> png::Compression {
    if quality >= 0.9 {
        png::Compression::Best
    } else if quality >= 0.5 {
        png::Compression::Default
    } else {
        png::Compression::Fast
    }
}
