//! Lazy, shared loading of the rendering engine.
//!
//! An [`EngineRegistry`] owns a prioritized list of [`EngineSource`]s and
//! hands out a single [`EngineHandle`] for its whole lifetime. Concurrent
//! callers that arrive while a load is in flight await the same shared
//! future, so the sources are walked at most once per attempt.

use crate::config::{EngineConfig, PDFIUM_LIB_PATH_ENV};
use crate::engine::{EngineHandle, PdfiumEngine};
use crate::error::{EngineError, EngineUnavailable, SourceFailure};
use futures::future::{BoxFuture, FutureExt, Shared};
use pdfium_render::prelude::Pdfium;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// One way of obtaining an engine.
pub trait EngineSource: Send + Sync {
    /// Short name used in logs and in [`SourceFailure`].
    fn name(&self) -> String;

    /// Try to produce an engine. Blocking.
    fn resolve(&self) -> Result<EngineHandle, EngineError>;
}

/// Strategies for binding the pdfium shared library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdfiumSource {
    /// An explicitly configured library file or directory.
    Configured(Option<PathBuf>),
    /// The platform library inside one of the given build output directories.
    BuildArtifact(Vec<PathBuf>),
    /// Well-known system directories, then the system loader.
    Legacy { dirs: Vec<PathBuf>, system: bool },
}

impl PdfiumSource {
    /// The `Configured` source for `config`, falling back to the environment.
    pub fn configured(config: &EngineConfig) -> Self {
        let path = config
            .library_path
            .clone()
            .or_else(|| std::env::var_os(PDFIUM_LIB_PATH_ENV).map(PathBuf::from));
        PdfiumSource::Configured(path)
    }

    /// The `BuildArtifact` source: exe dir, `./lib`, `./`, then `extra`.
    pub fn build_artifact(extra: &[PathBuf]) -> Self {
        let mut dirs = Vec::new();
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            dirs.push(exe_dir);
        }
        dirs.push(PathBuf::from("./lib"));
        dirs.push(PathBuf::from("./"));
        dirs.extend(extra.iter().cloned());
        PdfiumSource::BuildArtifact(dirs)
    }

    pub fn legacy(system: bool) -> Self {
        PdfiumSource::Legacy {
            dirs: vec![PathBuf::from("/usr/lib"), PathBuf::from("/usr/local/lib")],
            system,
        }
    }
}

fn library_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        Pdfium::pdfium_platform_library_name_at_path(path)
    } else {
        path.to_path_buf()
    }
}

fn bind_at(path: &Path) -> Result<EngineHandle, EngineError> {
    let library = library_file(path);
    debug!("Binding pdfium at {:?}", library);
    let bindings = Pdfium::bind_to_library(&library)?;
    Ok(Arc::new(PdfiumEngine::new(bindings, library)))
}

fn bind_first(dirs: &[PathBuf]) -> Result<EngineHandle, EngineError> {
    let mut last = EngineError::new("no directories to search");
    for dir in dirs {
        match bind_at(dir) {
            Ok(engine) => return Ok(engine),
            Err(e) => last = EngineError::new(format!("{}: {}", dir.display(), e)),
        }
    }
    Err(last)
}

impl EngineSource for PdfiumSource {
    fn name(&self) -> String {
        match self {
            PdfiumSource::Configured(_) => "configured".to_string(),
            PdfiumSource::BuildArtifact(_) => "build-artifact".to_string(),
            PdfiumSource::Legacy { .. } => "legacy".to_string(),
        }
    }

    fn resolve(&self) -> Result<EngineHandle, EngineError> {
        match self {
            PdfiumSource::Configured(None) => Err(EngineError::new(format!(
                "not configured (set library_path or {})",
                PDFIUM_LIB_PATH_ENV
            ))),
            PdfiumSource::Configured(Some(path)) => bind_at(path),
            PdfiumSource::BuildArtifact(dirs) => bind_first(dirs),
            PdfiumSource::Legacy { dirs, system } => bind_first(dirs).or_else(|e| {
                if !system {
                    return Err(e);
                }
                let bindings = Pdfium::bind_to_system_library()
                    .map_err(|se| EngineError::new(format!("{}; system library: {:?}", e, se)))?;
                let engine: EngineHandle = Arc::new(PdfiumEngine::new(bindings, "system"));
                Ok(engine)
            }),
        }
    }
}

/// The pdfium sources for `config`, in priority order.
pub fn default_sources(config: &EngineConfig) -> Vec<Arc<dyn EngineSource>> {
    vec![
        Arc::new(PdfiumSource::configured(config)),
        Arc::new(PdfiumSource::build_artifact(&config.search_dirs)),
        Arc::new(PdfiumSource::legacy(config.use_system_library)),
    ]
}

type LoadFuture = Shared<BoxFuture<'static, Result<EngineHandle, EngineUnavailable>>>;

enum LoadState {
    Uninitialized,
    Loading { attempt: usize, future: LoadFuture },
    Ready(EngineHandle),
    Failed(EngineUnavailable),
}

/// Observable summary of the registry lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Loading,
    Ready,
    Failed(EngineUnavailable),
}

/// Memoizes the engine for all conversions that share it.
pub struct EngineRegistry {
    sources: Arc<[Arc<dyn EngineSource>]>,
    state: Mutex<LoadState>,
    attempts: AtomicUsize,
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("EngineRegistry")
            .field("sources", &names)
            .field("state", &self.state())
            .field("attempts", &self.load_attempts())
            .finish()
    }
}

impl EngineRegistry {
    pub fn new(sources: Vec<Arc<dyn EngineSource>>) -> Self {
        Self {
            sources: sources.into(),
            state: Mutex::new(LoadState::Uninitialized),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Registry over the default pdfium sources.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(default_sources(config))
    }

    fn lock(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the engine, loading it on first use.
    ///
    /// A failed load is not cached: the next call walks the sources again.
    pub async fn acquire(&self) -> Result<EngineHandle, EngineUnavailable> {
        let (attempt, future) = {
            let mut state = self.lock();
            match &*state {
                LoadState::Ready(engine) => return Ok(Arc::clone(engine)),
                LoadState::Loading { attempt, future } => (*attempt, future.clone()),
                LoadState::Uninitialized | LoadState::Failed(_) => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let future = load_engine(Arc::clone(&self.sources), attempt)
                        .boxed()
                        .shared();
                    *state = LoadState::Loading {
                        attempt,
                        future: future.clone(),
                    };
                    (attempt, future)
                }
            }
        };

        let result = future.await;

        let mut state = self.lock();
        if matches!(&*state, LoadState::Loading { attempt: current, .. } if *current == attempt) {
            *state = match &result {
                Ok(engine) => LoadState::Ready(Arc::clone(engine)),
                Err(e) => LoadState::Failed(e.clone()),
            };
        }
        result
    }

    /// Number of load attempts started so far.
    pub fn load_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> EngineState {
        match &*self.lock() {
            LoadState::Uninitialized => EngineState::Uninitialized,
            LoadState::Loading { .. } => EngineState::Loading,
            LoadState::Ready(_) => EngineState::Ready,
            LoadState::Failed(e) => EngineState::Failed(e.clone()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.lock(), LoadState::Ready(_))
    }
}

async fn load_engine(
    sources: Arc<[Arc<dyn EngineSource>]>,
    attempt: usize,
) -> Result<EngineHandle, EngineUnavailable> {
    let start = Instant::now();
    let walk = move || resolve_sources(&sources);

    let result = match Handle::try_current() {
        Ok(handle) => handle.spawn_blocking(walk).await.unwrap_or_else(|e| {
            Err(EngineUnavailable {
                attempts: vec![SourceFailure {
                    source: "loader".to_string(),
                    reason: format!("load task failed: {}", e),
                }],
            })
        }),
        Err(_) => walk(),
    };

    match &result {
        Ok(engine) => info!(
            "Engine {} ready after load attempt {} in {:?}",
            engine.describe(),
            attempt,
            start.elapsed()
        ),
        Err(e) => warn!("Engine load attempt {} failed: {}", attempt, e),
    }
    result
}

fn resolve_sources(sources: &[Arc<dyn EngineSource>]) -> Result<EngineHandle, EngineUnavailable> {
    let mut attempts = Vec::new();
    for source in sources {
        let name = source.name();
        match source.resolve() {
            Ok(engine) if engine.supports_document_load() => {
                debug!("Engine source {} accepted", name);
                return Ok(engine);
            }
            Ok(engine) => {
                debug!("Engine source {} rejected: no document loading", name);
                attempts.push(SourceFailure {
                    source: name,
                    reason: format!("{} cannot load documents", engine.describe()),
                });
            }
            Err(e) => {
                debug!("Engine source {} failed: {}", name, e);
                attempts.push(SourceFailure {
                    source: name,
                    reason: e.message,
                });
            }
        }
    }
    Err(EngineUnavailable { attempts })
}
