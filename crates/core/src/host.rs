//! Runtime environment primitives the pipeline draws on.
//!
//! The converter never touches threads, pixel buffers or object URLs
//! directly; it asks a [`Host`] for them. [`NativeHost`] provides all of
//! them in-process:
//! - worker execution contexts as named OS threads
//! - raster surfaces as RGBA buffers
//! - object URLs as `blob:` references into an [`ObjectUrlStore`]

use crate::error::HostError;
use crate::worker::WorkerPort;
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// Browser-like environment consumed by the conversion pipeline.
pub trait Host: Send + Sync {
    /// Whether document/window-like primitives exist at all.
    fn is_supported(&self) -> bool;

    /// Ratio of physical to logical pixels on the output display.
    fn device_pixel_ratio(&self) -> f64 {
        1.0
    }

    /// Absolute URL of `relative`, resolved against this module's location.
    fn module_url(&self, relative: &str) -> Result<String, HostError>;

    /// The current origin, if the environment has one.
    fn origin(&self) -> Option<String>;

    /// Start a dedicated worker bound to `script_url`.
    fn spawn_worker(&self, script_url: &str, queue_capacity: usize) -> Result<WorkerPort, HostError> {
        Ok(WorkerPort::spawn(script_url, queue_capacity)?)
    }

    /// Allocate a transparent pixel surface.
    fn create_surface(&self, width: u32, height: u32) -> RasterSurface {
        RasterSurface::new(width, height)
    }

    /// Acquire a 2D drawing context for `surface`.
    fn context_2d<'a>(&self, surface: &'a mut RasterSurface) -> Option<DrawingContext<'a>> {
        Some(surface.context_2d())
    }

    /// Register `blob` and return a reference to it.
    fn create_object_url(&self, blob: Blob) -> ObjectUrl;

    /// Look up the blob behind `url`.
    fn resolve_object_url(&self, url: &ObjectUrl) -> Option<Blob>;

    /// Release `url`. Returns false if it was unknown.
    fn revoke_object_url(&self, url: &ObjectUrl) -> bool;
}

/// Immutable bytes with a media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    bytes: Arc<[u8]>,
    media_type: String,
}

impl Blob {
    pub fn new(bytes: Arc<[u8]>, media_type: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Process-local, non-persistent reference to a [`Blob`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ObjectUrl(String);

impl ObjectUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ObjectUrl {
    fn from(url: String) -> Self {
        Self(url)
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of live object URLs.
#[derive(Debug)]
pub struct ObjectUrlStore {
    origin: String,
    blobs: Mutex<HashMap<ObjectUrl, Blob>>,
}

impl ObjectUrlStore {
    /// Store minting `blob:<origin>/<uuid>` references.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, blob: Blob) -> ObjectUrl {
        let url = ObjectUrl(format!(
            "blob:{}/{}",
            self.origin.trim_end_matches('/'),
            Uuid::new_v4()
        ));
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone(), blob);
        url
    }

    pub fn resolve(&self, url: &ObjectUrl) -> Option<Blob> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    pub fn revoke(&self, url: &ObjectUrl) -> bool {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url)
            .is_some()
    }

    /// Number of live references.
    pub fn len(&self) -> usize {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transient RGBA pixel buffer owned by one conversion.
#[derive(Debug, Clone)]
pub struct RasterSurface {
    image: RgbaImage,
}

impl RasterSurface {
    /// A fully transparent surface.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// A drawing context over the whole surface, smoothing disabled.
    pub fn context_2d(&mut self) -> DrawingContext<'_> {
        DrawingContext {
            target: &mut self.image,
            smoothing: Smoothing::default(),
        }
    }
}

/// Resampling quality used when drawn images are scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmoothingQuality {
    #[default]
    Low,
    Medium,
    High,
}

/// Image smoothing state of a [`DrawingContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smoothing {
    pub enabled: bool,
    pub quality: SmoothingQuality,
}

impl Smoothing {
    fn filter(&self) -> FilterType {
        if !self.enabled {
            return FilterType::Nearest;
        }
        match self.quality {
            SmoothingQuality::Low => FilterType::Triangle,
            SmoothingQuality::Medium => FilterType::CatmullRom,
            SmoothingQuality::High => FilterType::Lanczos3,
        }
    }
}

/// 2D drawing context borrowing a [`RasterSurface`].
pub struct DrawingContext<'a> {
    target: &'a mut RgbaImage,
    smoothing: Smoothing,
}

impl<'a> DrawingContext<'a> {
    pub fn width(&self) -> u32 {
        self.target.width()
    }

    pub fn height(&self) -> u32 {
        self.target.height()
    }

    pub fn set_image_smoothing(&mut self, enabled: bool, quality: SmoothingQuality) {
        self.smoothing = Smoothing { enabled, quality };
    }

    pub fn smoothing(&self) -> Smoothing {
        self.smoothing
    }

    /// Fill the whole surface with `color`.
    pub fn fill(&mut self, color: Rgba<u8>) {
        for pixel in self.target.pixels_mut() {
            *pixel = color;
        }
    }

    /// Draw `image` stretched over the whole surface.
    pub fn draw_image(&mut self, image: &RgbaImage) {
        if image.dimensions() == self.target.dimensions() {
            imageops::replace(&mut *self.target, image, 0, 0);
            return;
        }
        if self.target.width() == 0 || self.target.height() == 0 {
            return;
        }
        let resized = imageops::resize(
            image,
            self.target.width(),
            self.target.height(),
            self.smoothing.filter(),
        );
        imageops::replace(&mut *self.target, &resized, 0, 0);
    }

    /// Blend transparent areas onto an opaque background.
    pub fn flatten(&mut self, background: (u8, u8, u8)) {
        let (r, g, b) = background;

        for pixel in self.target.pixels_mut() {
            let alpha = pixel[3] as f32 / 255.0;
            if alpha < 1.0 {
                let inv_alpha = 1.0 - alpha;
                pixel[0] = ((pixel[0] as f32 * alpha) + (r as f32 * inv_alpha)) as u8;
                pixel[1] = ((pixel[1] as f32 * alpha) + (g as f32 * inv_alpha)) as u8;
                pixel[2] = ((pixel[2] as f32 * alpha) + (b as f32 * inv_alpha)) as u8;
                pixel[3] = 255;
            }
        }
    }
}

/// In-process host: threads for workers, RGBA buffers for surfaces.
#[derive(Debug)]
pub struct NativeHost {
    device_pixel_ratio: f64,
    allow_workers: bool,
    module_dir: Option<PathBuf>,
    origin: String,
    urls: ObjectUrlStore,
}

impl NativeHost {
    /// Host rooted at the current executable and working directory.
    pub fn new() -> Self {
        let module_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()));
        let origin = std::env::current_dir()
            .map(|dir| file_url(&dir))
            .unwrap_or_else(|_| "file://".to_string());

        Self {
            device_pixel_ratio: 1.0,
            allow_workers: true,
            module_dir,
            urls: ObjectUrlStore::new(origin.clone()),
            origin,
        }
    }

    /// Report a different device pixel ratio.
    pub fn with_device_pixel_ratio(mut self, ratio: f64) -> Self {
        self.device_pixel_ratio = ratio;
        self
    }

    /// Allow or forbid dedicated worker threads.
    pub fn with_workers(mut self, allowed: bool) -> Self {
        self.allow_workers = allowed;
        self
    }

    /// Number of object URLs not yet revoked.
    pub fn live_object_urls(&self) -> usize {
        self.urls.len()
    }
}

impl Default for NativeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for NativeHost {
    fn is_supported(&self) -> bool {
        true
    }

    fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio
    }

    fn module_url(&self, relative: &str) -> Result<String, HostError> {
        let dir = self
            .module_dir
            .as_ref()
            .ok_or_else(|| HostError::ModuleUrl("executable location unknown".to_string()))?;
        Ok(file_url(&dir.join(relative)))
    }

    fn origin(&self) -> Option<String> {
        Some(self.origin.clone())
    }

    fn spawn_worker(&self, script_url: &str, queue_capacity: usize) -> Result<WorkerPort, HostError> {
        if !self.allow_workers {
            return Err(HostError::Unsupported("dedicated workers disabled".to_string()));
        }
        debug!("Spawning dedicated worker for {}", script_url);
        Ok(WorkerPort::spawn(script_url, queue_capacity)?)
    }

    fn create_object_url(&self, blob: Blob) -> ObjectUrl {
        self.urls.create(blob)
    }

    fn resolve_object_url(&self, url: &ObjectUrl) -> Option<Blob> {
        self.urls.resolve(url)
    }

    fn revoke_object_url(&self, url: &ObjectUrl) -> bool {
        self.urls.revoke(url)
    }
}

fn file_url(path: &std::path::Path) -> String {
    let path = path.to_string_lossy().replace('\\', "/");
    if path.starts_with('/') {
        format!("file://{}", path)
    } else {
        format!("file:///{}", path)
    }
}
