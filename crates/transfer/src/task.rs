use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ferry_checkpoint::{CheckpointError, CheckpointStore};
use ferry_protocol::TransferKind;

use crate::TransferError;
use crate::config::TransferConfig;
use crate::download::Downloader;
use crate::http::HttpClient;
use crate::listener::ProgressListener;
use crate::upload::Uploader;

/// Lifecycle state of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not running: never started, or stopped by an error.
    Init,
    /// A worker is moving data.
    Active,
    /// Stopped on request; resumes from its checkpoint.
    Paused,
}

// ---------------------------------------------------------------------------
// TransferContext
// ---------------------------------------------------------------------------

/// Collaborators shared by all tasks of a registry.
#[derive(Clone)]
pub struct TransferContext {
    pub(crate) http: Arc<dyn HttpClient>,
    pub(crate) config: TransferConfig,
    limiter: Option<Arc<Semaphore>>,
}

/// Returned when a task is paused while waiting for a run slot.
pub(crate) struct PausedWhileQueued;

impl TransferContext {
    pub fn new(http: Arc<dyn HttpClient>, config: TransferConfig) -> Self {
        let limiter = config
            .max_concurrent_tasks
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            http,
            config,
            limiter,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Waits for a run slot when concurrency is bounded.
    pub(crate) async fn admit(
        &self,
        pause: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, PausedWhileQueued> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = pause.cancelled() => Err(PausedWhileQueued),
            permit = Arc::clone(limiter).acquire_owned() => {
                // The semaphore is never closed.
                permit.map(Some).map_err(|_| PausedWhileQueued)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking I/O
// ---------------------------------------------------------------------------

/// Runs blocking filesystem work on the blocking pool.
pub(crate) async fn blocking<T, E, F>(work: F) -> Result<T, TransferError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<TransferError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TransferError::Io(io::Error::other(format!("task join error: {e}"))))?
        .map_err(Into::into)
}

/// Runs `op` against `store` on the blocking pool. Every checkpoint write
/// rewrites the whole file, so none of them happen on a runtime thread.
pub(crate) async fn with_store<T, F>(store: &Arc<CheckpointStore>, op: F) -> Result<T, TransferError>
where
    F: FnOnce(&CheckpointStore) -> Result<T, CheckpointError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    blocking(move || op(&store)).await
}

// ---------------------------------------------------------------------------
// TaskControl
// ---------------------------------------------------------------------------

/// Run bookkeeping shared by downloads and uploads.
///
/// Each call to [`start`](Self::start) begins a new run with a fresh pause
/// token. A run only spawns its work after the previous run's worker has
/// exited, so two workers never touch the same files at once.
#[derive(Debug, Default)]
pub(crate) struct TaskControl {
    inner: Mutex<ControlInner>,
}

#[derive(Debug)]
struct ControlInner {
    state: TaskState,
    run: u64,
    pause: Option<CancellationToken>,
    worker: Option<JoinHandle<()>>,
}

impl Default for ControlInner {
    fn default() -> Self {
        Self {
            state: TaskState::Init,
            run: 0,
            pause: None,
            worker: None,
        }
    }
}

impl TaskControl {
    fn lock(&self) -> MutexGuard<'_, ControlInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> TaskState {
        self.lock().state
    }

    /// Spawns `make(pause, run)` unless a run is already active.
    ///
    /// Returns `false` when the task was already active.
    pub(crate) fn start<F, Fut>(&self, make: F) -> bool
    where
        F: FnOnce(CancellationToken, u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.state == TaskState::Active {
            return false;
        }

        inner.run += 1;
        inner.state = TaskState::Active;
        let pause = CancellationToken::new();
        inner.pause = Some(pause.clone());

        let previous = inner.worker.take();
        let work = make(pause, inner.run);
        inner.worker = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            work.await;
        }));
        true
    }

    /// Requests a cooperative pause of the current run.
    pub(crate) fn pause(&self) {
        let mut inner = self.lock();
        if let Some(token) = inner.pause.take() {
            token.cancel();
        }
        if inner.state == TaskState::Active {
            inner.state = TaskState::Paused;
        }
    }

    /// Records that run `run` stopped, leaving the task in `state`.
    ///
    /// Ignored when a newer run has started or the run was paused.
    pub(crate) fn finish(&self, run: u64, state: TaskState) {
        let mut inner = self.lock();
        if inner.run == run && inner.state == TaskState::Active {
            inner.state = state;
            inner.pause = None;
        }
    }

    /// Waits until the latest worker has exited.
    pub(crate) async fn join(&self) {
        let worker = self.lock().worker.take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

// ---------------------------------------------------------------------------
// TransferTask
// ---------------------------------------------------------------------------

/// A registered transfer.
#[derive(Clone)]
pub enum TransferTask {
    Download(Arc<Downloader>),
    Upload(Arc<Uploader>),
}

impl TransferTask {
    pub fn kind(&self) -> TransferKind {
        match self {
            TransferTask::Download(_) => TransferKind::Download,
            TransferTask::Upload(_) => TransferKind::Upload,
        }
    }

    /// Url for downloads, caller-supplied file path for uploads.
    pub fn source(&self) -> &str {
        match self {
            TransferTask::Download(d) => d.url(),
            TransferTask::Upload(u) => u.source(),
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            TransferTask::Download(d) => d.state(),
            TransferTask::Upload(u) => u.state(),
        }
    }

    /// Starts or resumes the transfer. No-op while active.
    pub fn transfer(&self, listener: Arc<dyn ProgressListener>) -> bool {
        match self {
            TransferTask::Download(d) => d.transfer(listener),
            TransferTask::Upload(u) => u.transfer(listener),
        }
    }

    pub fn pause(&self) {
        match self {
            TransferTask::Download(d) => d.pause(),
            TransferTask::Upload(u) => u.pause(),
        }
    }

    /// Whether both handles refer to the same transfer.
    pub fn same_as(&self, other: &TransferTask) -> bool {
        match (self, other) {
            (TransferTask::Download(a), TransferTask::Download(b)) => Arc::ptr_eq(a, b),
            (TransferTask::Upload(a), TransferTask::Upload(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Waits for the worker to exit.
    pub async fn join(&self) {
        match self {
            TransferTask::Download(d) => d.join().await,
            TransferTask::Upload(u) => u.join().await,
        }
    }
}
