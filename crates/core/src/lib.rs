//! # pdf-to-png-core
//!
//! First-page PDF to PNG conversion.
//!
//! A document goes through three stages:
//!
//! - **Loader**: a lazily bound, shared pdfium engine ([`EngineRegistry`])
//!   resolved from a prioritized list of library locations
//! - **Execution**: engine work runs on a dedicated worker thread when one can
//!   be started, otherwise on tokio's blocking pool or inline
//!   ([`configure_execution`])
//! - **Renderer**: page 1 is drawn onto an oversampled surface and encoded
//!   as PNG ([`rasterize_first_page`], [`encode_png`])
//!
//! Conversion never returns an error: callers branch on the
//! [`ConversionOutcome`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf_to_png_core::{ConversionRequest, Converter, ConverterConfig};
//!
//! #[tokio::main]
//! async fn main() -> pdf_to_png_core::Result<()> {
//!     let converter = Converter::new(ConverterConfig::default())?;
//!
//!     let request = ConversionRequest::from_path("report.pdf");
//!     let outcome = converter.convert(request).await;
//!
//!     match outcome.file() {
//!         Some(file) => println!("Rendered {} ({} bytes)", file.name, file.size()),
//!         None => eprintln!("{}", outcome.error_message().unwrap_or_default()),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Custom Engine Location
//!
//! ```rust,no_run
//! use pdf_to_png_core::{ConversionRequest, ConverterBuilder, ScalePolicy};
//!
//! #[tokio::main]
//! async fn main() -> pdf_to_png_core::Result<()> {
//!     let converter = ConverterBuilder::new()
//!         .library_path("/opt/pdfium/lib")
//!         .scale(ScalePolicy::device_aware())
//!         .build()?;
//!
//!     let bytes = std::fs::read("a.pdf").unwrap_or_default();
//!     let outcomes = converter
//!         .convert_batch(vec![ConversionRequest::from_bytes("a.pdf", bytes)], 4)
//!         .await;
//!
//!     for outcome in &outcomes {
//!         if let Some(url) = outcome.object_url() {
//!             println!("{}", url);
//!             converter.revoke_object_url(url);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod converter;
pub mod engine;
pub mod error;
pub mod host;
pub mod loader;
pub mod pdf_renderer;
pub mod worker;

// Re-export main types for convenience
pub use config::{
    derive_output_name, ConversionOutcome, ConversionRequest, ConverterConfig, EngineConfig,
    InputContent, OutputFile, RenderConfig, ScalePolicy, WorkerConfig,
};
pub use converter::{convert_pdf_to_png, default_converter, Converter, ConverterBuilder, ConverterStats};
pub use engine::{Document, Engine, EngineHandle, Page, PageSize, PdfiumEngine};
pub use error::{ConversionError, EngineError, EngineUnavailable, HostError, Result, SourceFailure};
pub use host::{Blob, DrawingContext, Host, NativeHost, ObjectUrl, RasterSurface, SmoothingQuality};
pub use loader::{default_sources, EngineRegistry, EngineSource, EngineState, PdfiumSource};
pub use pdf_renderer::{compute_viewport, encode_png, rasterize_first_page, Viewport};
pub use worker::{configure_execution, resolve_worker_url, ExecutionMode, ExecutionOutcome, Executor, WorkerPort};

/// Initialize the library's logging.
/// Call this once at application startup if you want to see logs.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}
