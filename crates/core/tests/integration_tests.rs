//! Integration tests for pdf-to-png-core.
//!
//! Most tests drive the full pipeline against an in-test engine and host.
//! `test_real_pdfium_conversion` requires the pdfium library
//! (set PDFIUM_DYNAMIC_LIB_PATH) and is skipped otherwise.
//!
//! Run with: cargo test --package pdf-to-png-core --test integration_tests

use image::Rgba;
use pdf_to_png_core::{
    config::PNG_MEDIA_TYPE,
    host::{Blob, DrawingContext, Host, ObjectUrl, ObjectUrlStore, RasterSurface},
    ConversionRequest, Converter, ConverterBuilder, ConverterConfig, Document, Engine,
    EngineError, EngineHandle, EngineSource, EngineState, HostError, Page, PageSize,
    RenderConfig, ScalePolicy, Viewport,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Smallest document pdfium accepts; it rebuilds the missing xref table.
const MINIMAL_PDF: &[u8] = b"%PDF-1.4
1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj
2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj
3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 72 36] >> endobj
trailer << /Root 1 0 R >>
%%EOF
";

// ========== Test doubles ==========

/// Parses "documents" of the form `%PDF <pages> <width>x<height>`.
#[derive(Default)]
struct FakeEngine {
    renders: AtomicUsize,
}

impl Engine for FakeEngine {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    fn supports_document_load(&self) -> bool {
        true
    }

    fn open_document(&self, bytes: Vec<u8>) -> Result<Box<dyn Document + '_>, EngineError> {
        let text = String::from_utf8(bytes).map_err(|_| EngineError::new("not text"))?;
        let mut parts = text.split_whitespace();
        if parts.next() != Some("%PDF") {
            return Err(EngineError::new("missing %PDF header"));
        }
        let pages: usize = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| EngineError::new("bad page count"))?;
        let (width, height) = parts
            .next()
            .and_then(|s| s.split_once('x'))
            .and_then(|(w, h)| Some((w.parse::<f32>().ok()?, h.parse::<f32>().ok()?)))
            .ok_or_else(|| EngineError::new("bad media box"))?;
        Ok(Box::new(FakeDocument {
            engine: self,
            pages,
            size: PageSize::new(width, height),
        }))
    }
}

struct FakeDocument<'a> {
    engine: &'a FakeEngine,
    pages: usize,
    size: PageSize,
}

impl Document for FakeDocument<'_> {
    fn page_count(&self) -> usize {
        self.pages
    }

    fn page(&self, index: usize) -> Result<Box<dyn Page + '_>, EngineError> {
        if index >= self.pages {
            return Err(EngineError::new("no such page"));
        }
        Ok(Box::new(FakePage {
            engine: self.engine,
            size: self.size,
        }))
    }
}

struct FakePage<'a> {
    engine: &'a FakeEngine,
    size: PageSize,
}

impl Page for FakePage<'_> {
    fn size(&self) -> PageSize {
        self.size
    }

    fn render(&self, ctx: &mut DrawingContext<'_>, _viewport: &Viewport) -> Result<(), EngineError> {
        self.engine.renders.fetch_add(1, Ordering::SeqCst);
        // Transparent ink so background flattening is observable.
        ctx.fill(Rgba([0, 0, 0, 0]));
        Ok(())
    }
}

struct FakeSource {
    engine: Arc<FakeEngine>,
    available: AtomicBool,
    resolves: AtomicUsize,
    delay: Duration,
}

impl FakeSource {
    fn new(engine: Arc<FakeEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            available: AtomicBool::new(true),
            resolves: AtomicUsize::new(0),
            delay: Duration::ZERO,
        })
    }

    fn unavailable(engine: Arc<FakeEngine>) -> Arc<Self> {
        let source = Self::new(engine);
        source.available.store(false, Ordering::SeqCst);
        source
    }
}

impl EngineSource for FakeSource {
    fn name(&self) -> String {
        "fake".to_string()
    }

    fn resolve(&self) -> Result<EngineHandle, EngineError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if self.available.load(Ordering::SeqCst) {
            Ok(self.engine.clone() as EngineHandle)
        } else {
            Err(EngineError::new("library not found"))
        }
    }
}

struct FakeHost {
    supported: bool,
    contexts: bool,
    device_pixel_ratio: f64,
    urls: ObjectUrlStore,
}

impl FakeHost {
    fn new() -> Self {
        Self {
            supported: true,
            contexts: true,
            device_pixel_ratio: 1.0,
            urls: ObjectUrlStore::new("https://test.example"),
        }
    }
}

impl Host for FakeHost {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio
    }

    fn module_url(&self, relative: &str) -> Result<String, HostError> {
        Ok(format!("https://test.example/assets/{}", relative))
    }

    fn origin(&self) -> Option<String> {
        Some("https://test.example".to_string())
    }

    fn context_2d<'a>(&self, surface: &'a mut RasterSurface) -> Option<DrawingContext<'a>> {
        if self.contexts {
            Some(surface.context_2d())
        } else {
            None
        }
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

fn converter_with(host: FakeHost, source: Arc<FakeSource>, config: ConverterConfig) -> Converter {
    ConverterBuilder::new()
        .config(config)
        .host(Arc::new(host))
        .source(source)
        .build()
        .unwrap()
}

fn fake_pipeline() -> (Converter, Arc<FakeEngine>, Arc<FakeSource>) {
    let engine = Arc::new(FakeEngine::default());
    let source = FakeSource::new(engine.clone());
    let converter = converter_with(FakeHost::new(), source.clone(), ConverterConfig::default());
    (converter, engine, source)
}

fn pdf(pages: usize, width: u32, height: u32) -> Vec<u8> {
    format!("%PDF {} {}x{}", pages, width, height).into_bytes()
}

fn decode(bytes: &[u8]) -> image::RgbaImage {
    image::load_from_memory(bytes).unwrap().to_rgba8()
}

// ========== Conversion pipeline tests ==========

#[tokio::test]
async fn test_convert_produces_png_named_after_input() {
    let (converter, engine, _) = fake_pipeline();

    let outcome = converter
        .convert(ConversionRequest::from_bytes("report.pdf", pdf(3, 10, 20)))
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.error_message());
    let file = outcome.file().unwrap();
    assert_eq!(file.name, "report.png");
    assert_eq!(file.media_type, PNG_MEDIA_TYPE);
    assert!(file.bytes.starts_with(PNG_SIGNATURE));

    // Default policy oversamples 4x; transparent ink is flattened to white.
    let image = decode(&file.bytes);
    assert_eq!(image.dimensions(), (40, 80));
    assert_eq!(image.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
    assert_eq!(engine.renders.load(Ordering::SeqCst), 1);

    let url = outcome.object_url().unwrap();
    assert!(url.as_str().starts_with("blob:https://test.example/"));
    assert_eq!(converter.resolve_object_url(url).unwrap().media_type(), "image/png");
}

#[tokio::test]
async fn test_unsupported_environment_fails_fast() {
    let engine = Arc::new(FakeEngine::default());
    let source = FakeSource::new(engine.clone());
    let mut host = FakeHost::new();
    host.supported = false;
    let converter = converter_with(host, source.clone(), ConverterConfig::default());

    let outcome = converter
        .convert(ConversionRequest::from_bytes("a.pdf", pdf(1, 10, 10)))
        .await;

    let message = outcome.error_message().unwrap();
    assert!(message.contains("browser-like environment"));
    assert_eq!(converter.registry().load_attempts(), 0);
    assert_eq!(source.resolves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_engine_unavailable_is_retried() {
    let engine = Arc::new(FakeEngine::default());
    let source = FakeSource::unavailable(engine.clone());
    let converter = converter_with(FakeHost::new(), source.clone(), ConverterConfig::default());

    let outcome = converter
        .convert(ConversionRequest::from_bytes("a.pdf", pdf(1, 10, 10)))
        .await;
    let message = outcome.error_message().unwrap();
    assert!(message.starts_with("Failed to convert PDF: Rendering engine unavailable"));
    assert!(message.contains("library not found"));
    assert!(matches!(converter.registry().state(), EngineState::Failed(_)));
    assert!(converter.execution_outcome().is_none());

    source.available.store(true, Ordering::SeqCst);
    let outcome = converter
        .convert(ConversionRequest::from_bytes("a.pdf", pdf(1, 10, 10)))
        .await;
    assert!(outcome.is_success());
    assert_eq!(converter.registry().load_attempts(), 2);
    assert_eq!(converter.registry().state(), EngineState::Ready);
}

#[tokio::test]
async fn test_missing_context_skips_render() {
    let engine = Arc::new(FakeEngine::default());
    let mut host = FakeHost::new();
    host.contexts = false;
    let converter = converter_with(host, FakeSource::new(engine.clone()), ConverterConfig::default());

    let outcome = converter
        .convert(ConversionRequest::from_bytes("a.pdf", pdf(1, 10, 10)))
        .await;

    assert!(outcome.error_message().unwrap().contains("No 2D drawing context"));
    assert_eq!(engine.renders.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_corrupt_document_does_not_poison_engine() {
    let (converter, _, source) = fake_pipeline();

    let outcome = converter
        .convert(ConversionRequest::from_bytes("bad.pdf", b"\x00\x01garbage".to_vec()))
        .await;
    assert!(outcome.error_message().unwrap().contains("Failed to load PDF document"));

    let outcome = converter
        .convert(ConversionRequest::from_bytes("good.pdf", pdf(1, 10, 10)))
        .await;
    assert!(outcome.is_success());
    assert_eq!(source.resolves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_document_without_pages() {
    let (converter, _, _) = fake_pipeline();

    let outcome = converter
        .convert(ConversionRequest::from_bytes("empty.pdf", pdf(0, 10, 10)))
        .await;
    assert!(outcome.error_message().unwrap().contains("Failed to get page 1"));
}

#[tokio::test]
async fn test_zero_sized_page_fails_encoding() {
    let (converter, _, _) = fake_pipeline();

    let outcome = converter
        .convert(ConversionRequest::from_bytes("flat.pdf", pdf(1, 0, 10)))
        .await;
    assert!(outcome.error_message().unwrap().contains("Failed to produce image data"));
}

#[tokio::test]
async fn test_repeated_conversions_produce_distinct_urls() {
    let (converter, _, _) = fake_pipeline();

    let first = converter
        .convert(ConversionRequest::from_bytes("a.pdf", pdf(1, 8, 8)))
        .await;
    let second = converter
        .convert(ConversionRequest::from_bytes("a.pdf", pdf(1, 8, 8)))
        .await;

    assert_eq!(first.file().unwrap().bytes, second.file().unwrap().bytes);
    assert_ne!(first.object_url(), second.object_url());

    assert!(converter.revoke_object_url(first.object_url().unwrap()));
    assert!(!converter.revoke_object_url(first.object_url().unwrap()));
    assert!(converter.resolve_object_url(second.object_url().unwrap()).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_conversions_share_one_engine_load() {
    let engine = Arc::new(FakeEngine::default());
    let source = Arc::new(FakeSource {
        engine: engine.clone(),
        available: AtomicBool::new(true),
        resolves: AtomicUsize::new(0),
        delay: Duration::from_millis(50),
    });
    let converter = Arc::new(converter_with(FakeHost::new(), source.clone(), ConverterConfig::default()));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let converter = Arc::clone(&converter);
            tokio::spawn(async move {
                converter
                    .convert(ConversionRequest::from_bytes(format!("doc{}.pdf", i), pdf(1, 4, 4)))
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    assert_eq!(source.resolves.load(Ordering::SeqCst), 1);
    assert_eq!(converter.registry().load_attempts(), 1);
    assert_eq!(engine.renders.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_batch_outcomes_follow_request_order() {
    let (converter, _, _) = fake_pipeline();

    let requests: Vec<_> = (0..8)
        .map(|i| {
            let bytes = if i % 3 == 0 { b"junk".to_vec() } else { pdf(1, 5, 5) };
            ConversionRequest::from_bytes(format!("page{}.pdf", i), bytes)
        })
        .collect();

    let outcomes = converter.convert_batch(requests, 3).await;

    assert_eq!(outcomes.len(), 8);
    for (i, outcome) in outcomes.iter().enumerate() {
        if i % 3 == 0 {
            assert!(!outcome.is_success());
        } else {
            assert_eq!(outcome.file().unwrap().name, format!("page{}.png", i));
        }
    }
    assert_eq!(converter.stats().total_failed, 3);
    assert_eq!(converter.stats().total_converted, 5);
}

#[tokio::test]
async fn test_convert_from_path() {
    let (converter, _, _) = fake_pipeline();
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("scan.final.pdf");
    std::fs::write(&input, pdf(1, 6, 6)).unwrap();

    let outcome = converter.convert(ConversionRequest::from_path(&input)).await;
    let file = outcome.file().unwrap();
    assert_eq!(file.name, "scan.final.png");

    let saved = file.save_to(&temp.path().join("out")).await.unwrap();
    assert_eq!(std::fs::read(saved).unwrap(), file.bytes.to_vec());
}

#[tokio::test]
async fn test_missing_input_file() {
    let (converter, _, _) = fake_pipeline();
    let temp = TempDir::new().unwrap();

    let outcome = converter
        .convert(ConversionRequest::from_path(temp.path().join("gone.pdf")))
        .await;
    assert!(outcome.error_message().unwrap().contains("Failed to read input 'gone.pdf'"));
}

// ========== Render policy tests ==========

#[tokio::test]
async fn test_device_aware_scale_is_clamped() {
    let engine = Arc::new(FakeEngine::default());
    let mut host = FakeHost::new();
    host.device_pixel_ratio = 5.0;
    let config = ConverterConfig {
        render: RenderConfig::with_scale(ScalePolicy::device_aware()),
        ..ConverterConfig::default()
    };
    let converter = converter_with(host, FakeSource::new(engine), config);

    let outcome = converter
        .convert(ConversionRequest::from_bytes("a.pdf", pdf(1, 10, 10)))
        .await;

    // base 2 x ratio clamped to 3
    assert_eq!(decode(&outcome.file().unwrap().bytes).dimensions(), (60, 60));
}

#[tokio::test]
async fn test_surface_is_capped() {
    let engine = Arc::new(FakeEngine::default());
    let config = ConverterConfig {
        render: RenderConfig::default().max_surface_pixels(10_000),
        ..ConverterConfig::default()
    };
    let converter = converter_with(FakeHost::new(), FakeSource::new(engine), config);

    let outcome = converter
        .convert(ConversionRequest::from_bytes("big.pdf", pdf(1, 100, 100)))
        .await;

    let (width, height) = decode(&outcome.file().unwrap().bytes).dimensions();
    assert!(u64::from(width) * u64::from(height) <= 10_000);
    assert!(width >= 99 && height >= 99);
}

#[tokio::test]
async fn test_transparent_output_without_background() {
    let engine = Arc::new(FakeEngine::default());
    let config = ConverterConfig {
        render: RenderConfig::default().background(None),
        ..ConverterConfig::default()
    };
    let converter = converter_with(FakeHost::new(), FakeSource::new(engine), config);

    let outcome = converter
        .convert(ConversionRequest::from_bytes("a.pdf", pdf(1, 2, 2)))
        .await;
    assert_eq!(decode(&outcome.file().unwrap().bytes).get_pixel(0, 0)[3], 0);
}

#[tokio::test]
async fn test_outcome_serializes_for_callers() {
    let (converter, _, _) = fake_pipeline();

    let success = converter
        .convert(ConversionRequest::from_bytes("a.pdf", pdf(1, 2, 2)))
        .await;
    let json = serde_json::to_value(&success).unwrap();
    assert_eq!(json["file"]["name"], "a.png");
    assert_eq!(json["file"]["type"], "image/png");
    assert!(json["objectUrl"].as_str().unwrap().starts_with("blob:"));

    let failure = converter
        .convert(ConversionRequest::from_bytes("a.pdf", b"nope".to_vec()))
        .await;
    let json = serde_json::to_value(&failure).unwrap();
    assert!(json["errorMessage"].as_str().unwrap().starts_with("Failed to convert PDF:"));
}

// ========== Real engine ==========

#[tokio::test]
async fn test_real_pdfium_conversion() {
    let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") else {
        eprintln!("Skipping test: PDFIUM_DYNAMIC_LIB_PATH not set");
        return;
    };

    let converter = ConverterBuilder::new().library_path(path).build().unwrap();
    let outcome = converter
        .convert(ConversionRequest::from_bytes("minimal.pdf", MINIMAL_PDF.to_vec()))
        .await;

    if converter.registry().state() != EngineState::Ready {
        eprintln!("Skipping test: pdfium could not be bound");
        return;
    }

    let file = outcome.file().unwrap();
    assert_eq!(file.name, "minimal.png");
    assert_eq!(decode(&file.bytes).dimensions(), (288, 144));
    assert!(converter.execution_outcome().is_some());

    let outcome = converter
        .convert(ConversionRequest::from_bytes("corrupt.pdf", b"%PDF-1.4 truncated".to_vec()))
        .await;
    assert!(!outcome.is_success());
}
