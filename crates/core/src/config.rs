//! Configuration and data types for PDF to PNG conversion.

use crate::error::{ConversionError, Result};
use crate::host::{Blob, ObjectUrl};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Media type of every produced image.
pub const PNG_MEDIA_TYPE: &str = "image/png";

/// Extension appended to derived output names.
pub const PNG_EXTENSION: &str = "png";

/// Environment variable pointing at a pdfium library (file or directory).
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_DYNAMIC_LIB_PATH";

/// Configuration for locating the rendering engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Explicit pdfium library, either the library file or its directory.
    /// When unset, `PDFIUM_DYNAMIC_LIB_PATH` is consulted at load time.
    pub library_path: Option<PathBuf>,

    /// Extra directories searched for a build artifact, after the defaults.
    pub search_dirs: Vec<PathBuf>,

    /// Whether the legacy system library paths may be tried.
    /// Default: true.
    pub use_system_library: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            search_dirs: Vec::new(),
            use_system_library: true,
        }
    }
}

impl EngineConfig {
    /// Engine config built from the process environment.
    pub fn from_env() -> Self {
        Self {
            library_path: std::env::var_os(PDFIUM_LIB_PATH_ENV).map(PathBuf::from),
            ..Default::default()
        }
    }

    /// Set an explicit library path.
    pub fn library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    /// Add a build-artifact search directory.
    pub fn search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dirs.push(dir.into());
        self
    }

    /// Allow or forbid the legacy system library strategy.
    pub fn use_system_library(mut self, enabled: bool) -> Self {
        self.use_system_library = enabled;
        self
    }
}

/// Configuration for off-thread execution of engine work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Try to start a dedicated worker before falling back.
    /// Default: true.
    pub dedicated: bool,

    /// Worker script, resolved relative to the module location.
    /// Default: "pdfium.worker".
    pub script: String,

    /// Origin-relative path used when module-relative resolution fails.
    pub fallback_path: String,

    /// Jobs that may wait for the dedicated worker before callers block.
    /// Default: 16.
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dedicated: true,
            script: "pdfium.worker".to_string(),
            fallback_path: "lib/pdfium.worker".to_string(),
            queue_capacity: 16,
        }
    }
}

impl WorkerConfig {
    /// Enable or disable the dedicated worker strategy.
    pub fn dedicated(mut self, enabled: bool) -> Self {
        self.dedicated = enabled;
        self
    }

    /// Set the worker script name.
    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ConversionError::InvalidConfig(
                "worker queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.script.trim().is_empty() {
            return Err(ConversionError::InvalidConfig(
                "worker script must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the page's native size is oversampled into pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalePolicy {
    /// Flat oversampling factor.
    Fixed { factor: f32 },
    /// `base` times the host's device pixel ratio clamped to
    /// `[min_ratio, max_ratio]`.
    DeviceAware {
        base: f32,
        min_ratio: f32,
        max_ratio: f32,
    },
}

impl Default for ScalePolicy {
    fn default() -> Self {
        ScalePolicy::Fixed { factor: 4.0 }
    }
}

impl ScalePolicy {
    /// The 2x policy clamped to device pixel ratios in [1, 3].
    pub fn device_aware() -> Self {
        ScalePolicy::DeviceAware {
            base: 2.0,
            min_ratio: 1.0,
            max_ratio: 3.0,
        }
    }

    /// Effective scale for a host reporting `device_pixel_ratio`.
    pub fn resolve(&self, device_pixel_ratio: f64) -> f32 {
        match *self {
            ScalePolicy::Fixed { factor } => factor,
            ScalePolicy::DeviceAware {
                base,
                min_ratio,
                max_ratio,
            } => {
                // Clamp before narrowing so ratios past f32::MAX stay finite.
                let ratio = if device_pixel_ratio.is_finite() {
                    device_pixel_ratio
                        .max(f64::from(min_ratio))
                        .min(f64::from(max_ratio)) as f32
                } else {
                    min_ratio
                };
                base * ratio
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let valid = |v: f32| v.is_finite() && v > 0.0;
        match *self {
            ScalePolicy::Fixed { factor } if !valid(factor) => Err(
                ConversionError::InvalidConfig("scale factor must be positive".to_string()),
            ),
            ScalePolicy::DeviceAware {
                base,
                min_ratio,
                max_ratio,
            } => {
                if !valid(base) || !valid(min_ratio) || !valid(max_ratio) {
                    return Err(ConversionError::InvalidConfig(
                        "device-aware scale values must be positive".to_string(),
                    ));
                }
                if min_ratio > max_ratio {
                    return Err(ConversionError::InvalidConfig(
                        "min_ratio must not exceed max_ratio".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Configuration for rasterization and encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Oversampling policy.
    /// Default: flat 4x.
    pub scale: ScalePolicy,

    /// Encoder quality in [0.0, 1.0]. PNG is lossless, so this selects
    /// deflate effort.
    /// Default: 1.0.
    pub quality: f32,

    /// Upper bound on surface pixels; larger viewports are scaled down.
    /// Default: 64 megapixels.
    pub max_surface_pixels: u64,

    /// Background that transparent pixels are flattened onto.
    /// `None` keeps the alpha channel.
    /// Default: white.
    pub background: Option<(u8, u8, u8)>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            scale: ScalePolicy::default(),
            quality: 1.0,
            max_surface_pixels: 64 * 1024 * 1024,
            background: Some((255, 255, 255)),
        }
    }
}

impl RenderConfig {
    /// Create a render config with the given scale policy.
    pub fn with_scale(scale: ScalePolicy) -> Self {
        Self {
            scale,
            ..Default::default()
        }
    }

    /// Set encoder quality (clamped to [0, 1]).
    pub fn quality(mut self, quality: f32) -> Self {
        self.quality = quality.clamp(0.0, 1.0);
        self
    }

    /// Set the surface pixel cap.
    pub fn max_surface_pixels(mut self, max: u64) -> Self {
        self.max_surface_pixels = max;
        self
    }

    /// Set or clear the flatten background.
    pub fn background(mut self, background: Option<(u8, u8, u8)>) -> Self {
        self.background = background;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.scale.validate()?;
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(ConversionError::InvalidConfig(
                "quality must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.max_surface_pixels == 0 {
            return Err(ConversionError::InvalidConfig(
                "max_surface_pixels must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Combined configuration for the converter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Engine location.
    pub engine: EngineConfig,

    /// Execution context resolution.
    pub worker: WorkerConfig,

    /// Rasterization.
    pub render: RenderConfig,
}

impl ConverterConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConversionError::InvalidConfig(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration.
    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.render.validate()?;
        Ok(())
    }
}

/// Where a request's bytes come from.
#[derive(Debug, Clone)]
pub enum InputContent {
    /// Bytes already in memory.
    Bytes(Arc<[u8]>),
    /// A file read when the conversion starts.
    Path(PathBuf),
}

/// A single conversion request: a named PDF document.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Name of the input, used to derive the output name.
    pub name: String,

    /// The document bytes.
    pub content: InputContent,
}

impl ConversionRequest {
    /// Request for an in-memory document.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            content: InputContent::Bytes(bytes.into()),
        }
    }

    /// Request for a document on disk, named after the file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("document.pdf")
            .to_string();
        Self {
            name,
            content: InputContent::Path(path),
        }
    }

    /// Read the full byte content of the request.
    pub async fn read_bytes(&self) -> Result<Vec<u8>> {
        match &self.content {
            InputContent::Bytes(bytes) => Ok(bytes.to_vec()),
            InputContent::Path(path) => {
                let read = match Handle::try_current() {
                    Ok(_) => tokio::fs::read(path).await,
                    Err(_) => std::fs::read(path),
                };
                read.map_err(|source| ConversionError::InputRead {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Name of the image derived from this request.
    pub fn output_name(&self) -> String {
        derive_output_name(&self.name, PNG_EXTENSION)
    }
}

/// Replace the trailing extension of `name` with `extension`.
///
/// A name without an extension (or whose only dot is leading, as in
/// `.pdf`) gets the extension appended.
pub fn derive_output_name(name: &str, extension: &str) -> String {
    let stem = match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    };
    format!("{}.{}", stem, extension)
}

/// The derived image file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    /// Derived file name, e.g. `report.png`.
    pub name: String,

    /// Media type of the content.
    #[serde(rename = "type")]
    pub media_type: String,

    /// Encoded image bytes.
    #[serde(skip)]
    pub bytes: Arc<[u8]>,
}

impl OutputFile {
    /// Create a file handle over encoded bytes.
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, bytes: Arc<[u8]>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            bytes,
        }
    }

    /// Size of the content in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// A blob sharing this file's bytes.
    pub fn to_blob(&self) -> Blob {
        Blob::new(Arc::clone(&self.bytes), self.media_type.clone())
    }

    /// Write the file into `dir`, returning the written path.
    pub async fn save_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&self.name);
        tokio::fs::write(&path, &self.bytes[..]).await?;
        Ok(path)
    }
}

/// Result of one conversion call. Callers branch on `error_message`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ConversionOutcome {
    /// The first page was rasterized.
    Success {
        #[serde(rename = "objectUrl")]
        object_url: ObjectUrl,
        file: OutputFile,
    },
    /// The conversion failed.
    Failure {
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl ConversionOutcome {
    /// Failure outcome for an error, with conversion context.
    pub fn failure(error: &ConversionError) -> Self {
        ConversionOutcome::Failure {
            error_message: format!("Failed to convert PDF: {}", error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConversionOutcome::Success { .. })
    }

    pub fn object_url(&self) -> Option<&ObjectUrl> {
        match self {
            ConversionOutcome::Success { object_url, .. } => Some(object_url),
            ConversionOutcome::Failure { .. } => None,
        }
    }

    pub fn file(&self) -> Option<&OutputFile> {
        match self {
            ConversionOutcome::Success { file, .. } => Some(file),
            ConversionOutcome::Failure { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ConversionOutcome::Success { .. } => None,
            ConversionOutcome::Failure { error_message } => Some(error_message),
        }
    }
}
