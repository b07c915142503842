//! Error types for PDF to PNG conversion.

use std::fmt;
use thiserror::Error;

/// Main error type for the pdf-to-png pipeline.
///
/// Every variant is surfaced to callers as a
/// [`ConversionOutcome::Failure`](crate::config::ConversionOutcome) message;
/// none of them escape [`Converter::convert`](crate::converter::Converter::convert).
#[derive(Error, Debug)]
pub enum ConversionError {
    /// The host does not provide a browser-like environment.
    #[error("PDF to image conversion requires a browser-like environment")]
    EnvironmentUnsupported,

    /// Every rendering engine resolution strategy failed.
    #[error("Rendering engine unavailable: {0}")]
    EngineUnavailable(#[from] EngineUnavailable),

    /// The input document bytes could not be read.
    #[error("Failed to read input '{name}': {source}")]
    InputRead {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine rejected the document (malformed, corrupt, encrypted...).
    #[error("Failed to load PDF document: {0}")]
    DocumentLoadFailed(String),

    /// The requested page could not be obtained from the loaded document.
    #[error("Failed to get page {page}: {message}")]
    PageUnavailable { page: usize, message: String },

    /// The engine failed while drawing the page.
    #[error("Failed to render page {page}: {message}")]
    RenderFailed { page: usize, message: String },

    /// The host could not provide a 2D drawing context for the surface.
    #[error("No 2D drawing context available")]
    ContextUnavailable,

    /// Encoding the surface produced no image data.
    #[error("Failed to produce image data: {0}")]
    EncodeFailed(String),

    /// The executor lost a job (worker gone or job panicked).
    #[error("Render worker error: {0}")]
    Worker(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, ConversionError>;

impl From<async_channel::RecvError> for ConversionError {
    fn from(_: async_channel::RecvError) -> Self {
        ConversionError::Worker("Channel closed".to_string())
    }
}

impl<T> From<async_channel::SendError<T>> for ConversionError {
    fn from(_: async_channel::SendError<T>) -> Self {
        ConversionError::Worker("Channel closed".to_string())
    }
}

/// Low-level failure reported by a rendering engine or engine source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<pdfium_render::prelude::PdfiumError> for EngineError {
    fn from(err: pdfium_render::prelude::PdfiumError) -> Self {
        Self::new(format!("{:?}", err))
    }
}

/// One rejected engine resolution strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    /// Name of the strategy that was tried.
    pub source: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Terminal failure of engine loading: no strategy produced a usable engine.
#[derive(Error, Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineUnavailable {
    /// Every attempt, in priority order.
    pub attempts: Vec<SourceFailure>,
}

impl fmt::Display for EngineUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "no engine sources configured");
        }
        write!(f, "tried {} source(s)", self.attempts.len())?;
        for attempt in &self.attempts {
            write!(f, "; {}: {}", attempt.source, attempt.reason)?;
        }
        Ok(())
    }
}

/// Failure reported by a [`Host`](crate::host::Host) primitive.
#[derive(Error, Debug)]
pub enum HostError {
    /// Module-relative URL derivation is not possible in this environment.
    #[error("Cannot resolve module-relative URL: {0}")]
    ModuleUrl(String),

    /// The host refused or failed to start a worker execution context.
    #[error("Failed to start worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// The primitive is not provided by this host.
    #[error("Not supported by host: {0}")]
    Unsupported(String),
}
