//! Main converter that ties together the engine registry, the execution
//! resolver and the first-page renderer.
//!
//! [`Converter::convert`] is the public boundary: every error or panic
//! below it is turned into a [`ConversionOutcome::Failure`].

use crate::config::{ConversionOutcome, ConversionRequest, ConverterConfig, EngineConfig, OutputFile, PNG_MEDIA_TYPE};
use crate::engine::EngineHandle;
use crate::error::{ConversionError, Result};
use crate::host::{Blob, Host, NativeHost, ObjectUrl};
use crate::loader::{default_sources, EngineRegistry, EngineSource};
use crate::pdf_renderer::{encode_png, rasterize_first_page};
use crate::worker::{configure_execution, Execution, ExecutionOutcome};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, error, info};

/// Converts PDF documents into a PNG of their first page.
///
/// All conversions on one converter share a single engine and a single
/// executor, both created on first use.
pub struct Converter {
    config: ConverterConfig,
    host: Arc<dyn Host>,
    registry: Arc<EngineRegistry>,
    execution: OnceLock<Execution>,
    converted: AtomicUsize,
    failed: AtomicUsize,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("execution", &self.execution.get().map(|e| &e.outcome))
            .finish()
    }
}

impl Converter {
    /// Create a converter running on a [`NativeHost`] with the default
    /// pdfium sources.
    pub fn new(config: ConverterConfig) -> Result<Self> {
        config.validate()?;
        let registry = EngineRegistry::new(default_sources(&config.engine));
        Ok(Self::with_parts(config, Arc::new(NativeHost::new()), Arc::new(registry)))
    }

    fn with_parts(config: ConverterConfig, host: Arc<dyn Host>, registry: Arc<EngineRegistry>) -> Self {
        info!(
            "Initializing converter with scale={:?}, dedicated_worker={}",
            config.render.scale, config.worker.dedicated
        );
        Self {
            config,
            host,
            registry,
            execution: OnceLock::new(),
            converted: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    /// Convert the first page of a PDF document to PNG.
    ///
    /// Never fails: errors are reported through the returned outcome.
    pub async fn convert(&self, request: ConversionRequest) -> ConversionOutcome {
        let name = request.name.clone();
        let result = AssertUnwindSafe(self.try_convert(request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ConversionError::Worker(panic_message(panic.as_ref()))));

        match result {
            Ok(outcome) => {
                self.converted.fetch_add(1, Ordering::SeqCst);
                outcome
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                error!("Failed to convert {}: {}", name, e);
                ConversionOutcome::failure(&e)
            }
        }
    }

    async fn try_convert(&self, request: ConversionRequest) -> Result<ConversionOutcome> {
        let start = Instant::now();

        if !self.host.is_supported() {
            return Err(ConversionError::EnvironmentUnsupported);
        }

        let engine = self.registry.acquire().await?;
        let execution = self.execution(&engine);

        let bytes = request.read_bytes().await?;
        debug!("Read {} bytes from {}", bytes.len(), request.name);

        let host = Arc::clone(&self.host);
        let render = self.config.render.clone();
        let png = execution
            .executor
            .run(move || {
                let surface = rasterize_first_page(engine.as_ref(), host.as_ref(), bytes, &render)?;
                encode_png(&surface, render.quality)
            })
            .await??;

        if png.is_empty() {
            return Err(ConversionError::EncodeFailed("encoder returned no data".to_string()));
        }

        let file = OutputFile::new(request.output_name(), PNG_MEDIA_TYPE, png.into());
        let object_url = self.host.create_object_url(file.to_blob());

        info!(
            "Converted {} to {} ({} bytes) in {:?}",
            request.name,
            file.name,
            file.size(),
            start.elapsed()
        );

        Ok(ConversionOutcome::Success { object_url, file })
    }

    fn execution(&self, engine: &EngineHandle) -> &Execution {
        self.execution.get_or_init(|| {
            let execution = configure_execution(engine.as_ref(), self.host.as_ref(), &self.config.worker);
            execution.outcome.log();
            execution
        })
    }

    /// Convert multiple documents, `concurrency` at a time.
    ///
    /// Outcomes are returned in request order.
    pub async fn convert_batch(
        &self,
        requests: Vec<ConversionRequest>,
        concurrency: usize,
    ) -> Vec<ConversionOutcome> {
        let start = Instant::now();
        let total = requests.len();

        let mut results: Vec<(usize, ConversionOutcome)> = stream::iter(requests.into_iter().enumerate())
            .map(|(index, request)| async move { (index, self.convert(request).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let outcomes: Vec<ConversionOutcome> = results.into_iter().map(|(_, outcome)| outcome).collect();
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        info!(
            "Batch converted {}/{} documents in {:?}",
            succeeded,
            total,
            start.elapsed()
        );
        outcomes
    }

    /// Look up the image behind an object URL returned by [`convert`](Self::convert).
    pub fn resolve_object_url(&self, url: &ObjectUrl) -> Option<Blob> {
        self.host.resolve_object_url(url)
    }

    /// Release an object URL. Returns false if it was unknown.
    pub fn revoke_object_url(&self, url: &ObjectUrl) -> bool {
        self.host.revoke_object_url(url)
    }

    /// Get the current configuration.
    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// How engine work is executed, once configured.
    pub fn execution_outcome(&self) -> Option<&ExecutionOutcome> {
        self.execution.get().map(|e| &e.outcome)
    }

    /// Get statistics about processing.
    pub fn stats(&self) -> ConverterStats {
        ConverterStats {
            total_converted: self.converted.load(Ordering::SeqCst),
            total_failed: self.failed.load(Ordering::SeqCst),
            engine_load_attempts: self.registry.load_attempts(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("conversion panicked: {}", detail)
}

/// Statistics about the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConverterStats {
    /// Conversions that produced an image.
    pub total_converted: usize,
    /// Conversions that returned a failure outcome.
    pub total_failed: usize,
    /// Engine load attempts started by the registry.
    pub engine_load_attempts: usize,
}

/// Process-wide converter over the native host, configured from the environment.
pub fn default_converter() -> &'static Converter {
    static DEFAULT: OnceLock<Converter> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        let engine = EngineConfig::from_env();
        let registry = EngineRegistry::new(default_sources(&engine));
        let config = ConverterConfig {
            engine,
            ..ConverterConfig::default()
        };
        Converter::with_parts(config, Arc::new(NativeHost::new()), Arc::new(registry))
    })
}

/// Convert with the [`default_converter`].
pub async fn convert_pdf_to_png(request: ConversionRequest) -> ConversionOutcome {
    default_converter().convert(request).await
}

/// Builder for creating a Converter with custom settings.
pub struct ConverterBuilder {
    config: ConverterConfig,
    host: Option<Arc<dyn Host>>,
    sources: Option<Vec<Arc<dyn EngineSource>>>,
}

impl ConverterBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ConverterConfig::default(),
            host: None,
            sources: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConverterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the host environment.
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    /// Replace the engine sources derived from the engine configuration.
    pub fn sources(mut self, sources: Vec<Arc<dyn EngineSource>>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Append one engine source, after any already set.
    pub fn source(mut self, source: Arc<dyn EngineSource>) -> Self {
        self.sources.get_or_insert_with(Vec::new).push(source);
        self
    }

    /// Set the path to the pdfium library.
    pub fn library_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.config.engine.library_path = Some(path.into());
        self
    }

    /// Set the oversampling policy.
    pub fn scale(mut self, scale: crate::config::ScalePolicy) -> Self {
        self.config.render.scale = scale;
        self
    }

    /// Enable or disable the dedicated worker.
    pub fn dedicated_worker(mut self, enabled: bool) -> Self {
        self.config.worker.dedicated = enabled;
        self
    }

    /// Build the converter.
    pub fn build(self) -> Result<Converter> {
        self.config.validate()?;
        let sources = self
            .sources
            .unwrap_or_else(|| default_sources(&self.config.engine));
        let host = self
            .host
            .unwrap_or_else(|| Arc::new(NativeHost::new()) as Arc<dyn Host>);
        Ok(Converter::with_parts(
            self.config,
            host,
            Arc::new(EngineRegistry::new(sources)),
        ))
    }
}

impl Default for ConverterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
