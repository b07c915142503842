//! Off-thread execution of engine work.
//!
//! pdfium decode/render calls block, so the converter hands them to an
//! [`Executor`]. [`configure_execution`] picks one in priority order:
//!
//! 1. a dedicated worker thread fed through a bounded channel ([`WorkerPort`])
//! 2. tokio's blocking pool, one task per job (created lazily)
//! 3. inline on the calling thread, when no runtime is current at run time
//!
//! Failure to set up a stage is never fatal; it is reported as
//! [`ExecutionOutcome::Degraded`] and the next stage is used.

use crate::config::WorkerConfig;
use crate::engine::Engine;
use crate::error::{ConversionError, Result};
use crate::host::Host;
use async_channel::{bounded, Receiver, Sender};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// A unit of work executed by a worker.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Name given to dedicated worker threads.
pub const WORKER_THREAD_NAME: &str = "pdf-render-worker";

/// Sending half of a dedicated worker thread.
///
/// The thread exits once every port clone is dropped.
#[derive(Clone)]
pub struct WorkerPort {
    script_url: Arc<str>,
    sender: Sender<Job>,
    completed: Arc<AtomicUsize>,
}

impl fmt::Debug for WorkerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPort")
            .field("script_url", &self.script_url)
            .field("queued", &self.sender.len())
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .finish()
    }
}

impl WorkerPort {
    /// Start a worker thread bound to `script_url`.
    pub fn spawn(script_url: &str, queue_capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_capacity.max(1));
        let completed = Arc::new(AtomicUsize::new(0));
        let script_url: Arc<str> = Arc::from(script_url);

        let thread_completed = Arc::clone(&completed);
        let thread_url = Arc::clone(&script_url);
        std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(receiver, thread_completed, thread_url))?;

        Ok(Self {
            script_url,
            sender,
            completed,
        })
    }

    pub fn script_url(&self) -> &str {
        &self.script_url
    }

    /// Jobs finished by the worker so far.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Queue `job` and await its result.
    pub async fn submit<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(Box::new(move || {
                let _ = response_tx.send(job());
            }))
            .await?;

        response_rx
            .await
            .map_err(|_| ConversionError::Worker("render job was dropped by the worker".to_string()))
    }
}

fn run_worker(receiver: Receiver<Job>, completed: Arc<AtomicUsize>, script_url: Arc<str>) {
    debug!("Worker {} started", script_url);
    while let Ok(job) = receiver.recv_blocking() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Render job panicked on worker {}", script_url);
        }
        completed.fetch_add(1, Ordering::SeqCst);
    }
    debug!("Worker {} stopped", script_url);
}

/// How engine work is being executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// On a dedicated worker bound to `script_url`.
    DedicatedWorker { script_url: String },
    /// On execution contexts the runtime creates lazily, one per job.
    LazyWorker { script_url: String },
    /// Synchronously on the calling thread.
    Inline,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::DedicatedWorker { script_url } => {
                write!(f, "dedicated worker ({})", script_url)
            }
            ExecutionMode::LazyWorker { script_url } => write!(f, "lazy worker ({})", script_url),
            ExecutionMode::Inline => write!(f, "inline"),
        }
    }
}

/// Result of execution configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The preferred strategy worked.
    Configured(ExecutionMode),
    /// A fallback is in use; `reason` says what failed first.
    Degraded { mode: ExecutionMode, reason: String },
}

impl ExecutionOutcome {
    pub fn mode(&self) -> &ExecutionMode {
        match self {
            ExecutionOutcome::Configured(mode) => mode,
            ExecutionOutcome::Degraded { mode, .. } => mode,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ExecutionOutcome::Degraded { .. })
    }

    /// Report the outcome through tracing.
    pub fn log(&self) {
        match self {
            ExecutionOutcome::Configured(mode) => info!("Engine work runs on {}", mode),
            ExecutionOutcome::Degraded { mode, reason } => {
                warn!("Engine work degraded to {}: {}", mode, reason)
            }
        }
    }
}

/// Runs engine jobs according to the configured [`ExecutionMode`].
#[derive(Debug)]
pub enum Executor {
    Dedicated(WorkerPort),
    /// Blocking pool of whichever tokio runtime is current when a job is
    /// run; inline on the calling thread when there is none.
    Lazy,
}

impl Executor {
    /// Run `job` and await its completion.
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Executor::Dedicated(port) => port.submit(job).await,
            Executor::Lazy => match Handle::try_current() {
                Ok(handle) => handle
                    .spawn_blocking(job)
                    .await
                    .map_err(|e| ConversionError::Worker(format!("Render task panicked: {}", e))),
                Err(_) => {
                    debug!("No tokio runtime current; running job inline");
                    run_inline(job)
                }
            },
        }
    }
}

fn run_inline<T, F: FnOnce() -> T>(job: F) -> Result<T> {
    catch_unwind(AssertUnwindSafe(job))
        .map_err(|_| ConversionError::Worker("Render job panicked".to_string()))
}

/// An executor together with how it was arrived at.
#[derive(Debug)]
pub struct Execution {
    pub executor: Executor,
    pub outcome: ExecutionOutcome,
}

/// Resolve the worker script URL.
///
/// Module-relative first; if the host cannot derive that, fall back to a
/// path under the current origin, and finally to the bare script name.
pub fn resolve_worker_url(host: &dyn Host, config: &WorkerConfig) -> String {
    match host.module_url(&config.script) {
        Ok(url) => url,
        Err(e) => {
            debug!("Module-relative worker URL unavailable: {}", e);
            match host.origin() {
                Some(origin) => format!(
                    "{}/{}",
                    origin.trim_end_matches('/'),
                    config.fallback_path.trim_start_matches('/')
                ),
                None => config.script.clone(),
            }
        }
    }
}

/// Decide where `engine` work runs. Never fails; see [`ExecutionOutcome`].
pub fn configure_execution(engine: &dyn Engine, host: &dyn Host, config: &WorkerConfig) -> Execution {
    let script_url = resolve_worker_url(host, config);
    debug!("Configuring execution for {} with {}", engine.describe(), script_url);

    let dedicated_failure = if config.dedicated {
        match host.spawn_worker(&script_url, config.queue_capacity) {
            Ok(port) => {
                return Execution {
                    executor: Executor::Dedicated(port),
                    outcome: ExecutionOutcome::Configured(ExecutionMode::DedicatedWorker {
                        script_url,
                    }),
                };
            }
            Err(e) => e.to_string(),
        }
    } else {
        "dedicated worker disabled by configuration".to_string()
    };

    // Only the decision is kept; the runtime is looked up again per job.
    let mode = match Handle::try_current() {
        Ok(_) => ExecutionMode::LazyWorker { script_url },
        Err(_) => ExecutionMode::Inline,
    };
    Execution {
        executor: Executor::Lazy,
        outcome: ExecutionOutcome::Degraded {
            mode,
            reason: dedicated_failure,
        },
    }
}
