//! Registry of transfer tasks keyed by application and source.
//!
//! Owns every [`TransferTask`] and one [`CheckpointStore`] per application.
//! The map lock is never held across an `.await`, and checkpoint files are
//! only opened or written on the blocking pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use ferry_checkpoint::{CheckpointStore, TransferRecord, UploadRecord};
use ferry_protocol::{LocalArtifact, TransferFailure, TransferKind};

use crate::TransferError;
use crate::app::AppContext;
use crate::chunked::PartialFile;
use crate::config::TransferConfig;
use crate::download::Downloader;
use crate::http::HttpClient;
use crate::listener::ProgressListener;
use crate::task::{TaskState, TransferContext, TransferTask, blocking, with_store};
use crate::upload::Uploader;
use crate::validation::{SafePathResolver, SandboxResolver};

/// Creates, finds, pauses and cancels transfers.
///
/// Cheap to clone; clones share the same tasks.
#[derive(Clone)]
pub struct TransferRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    ctx: TransferContext,
    resolver: Arc<dyn SafePathResolver>,
    apps: Mutex<HashMap<String, AppEntry>>,
}

struct AppEntry {
    store: Arc<CheckpointStore>,
    tasks: HashMap<String, TransferTask>,
    /// Sources with a cancel in progress, and how many.
    cancelling: HashMap<String, usize>,
}

impl AppEntry {
    fn new(store: Arc<CheckpointStore>) -> Self {
        Self {
            store,
            tasks: HashMap::new(),
            cancelling: HashMap::new(),
        }
    }
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, AppEntry>> {
        self.apps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransferRegistry {
    /// Creates a registry using [`SandboxResolver`] for paths.
    pub fn new(http: Arc<dyn HttpClient>, config: TransferConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx: TransferContext::new(http, config),
                resolver: Arc::new(SandboxResolver),
                apps: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replaces the path resolver. Call before adding tasks.
    pub fn with_resolver(self, resolver: Arc<dyn SafePathResolver>) -> Self {
        let ctx = self.inner.ctx.clone();
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                resolver,
                apps: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        self.inner.ctx.config()
    }

    /// Starts a transfer, or resumes the one already registered for
    /// `(app.id, source)`.
    ///
    /// For downloads `source` is the url and `target` a workspace-relative
    /// path; for uploads `source` is the workspace-relative file and
    /// `target` the url. Input errors are returned here and never reach
    /// `listener`. While the existing task is active this does nothing and
    /// `listener` is dropped. Fails with [`TransferError::Cancelling`]
    /// while a [`cancel`](Self::cancel) of the same source is running.
    pub async fn add_task(
        &self,
        app: &AppContext,
        source: &str,
        target: &str,
        kind: TransferKind,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<(), TransferError> {
        if let Some(task) = self.active_task(&app.id, source)? {
            let started = task.transfer(self.wrap(app, source, &task, listener));
            debug!(app = %app.id, source, started, "existing transfer requested");
            return Ok(());
        }

        let task = self.build_task(app, source, target, kind).await?;
        let task = {
            let mut apps = self.inner.lock();
            let entry = apps.get_mut(&app.id).ok_or_else(|| {
                TransferError::InvalidPath(format!("application {} was removed", app.id))
            })?;
            if entry.cancelling.contains_key(source) {
                return Err(TransferError::Cancelling(source.to_string()));
            }
            entry
                .tasks
                .entry(source.to_string())
                .or_insert(task)
                .clone()
        };

        info!(app = %app.id, source, target, ?kind, "transfer added");
        task.transfer(self.wrap(app, source, &task, listener));
        Ok(())
    }

    /// Validates inputs and constructs a task without registering it.
    async fn build_task(
        &self,
        app: &AppContext,
        source: &str,
        target: &str,
        kind: TransferKind,
    ) -> Result<TransferTask, TransferError> {
        let ctx = self.inner.ctx.clone();
        match kind {
            TransferKind::Download => {
                check_url(source)?;
                let path = self.inner.resolver.resolve(target, &app.workspace)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let store = self.store(app).await?;
                Ok(TransferTask::Download(Arc::new(Downloader::new(
                    app, source, path, store, ctx,
                ))))
            }
            TransferKind::Upload => {
                check_url(target)?;
                let path = self.inner.resolver.resolve(source, &app.workspace)?;
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() => {}
                    _ => return Err(TransferError::FileNotFound(path)),
                }
                let store = self.store(app).await?;
                Ok(TransferTask::Upload(Arc::new(Uploader::new(
                    source, path, target, store, ctx,
                ))))
            }
        }
    }

    /// Wraps `listener` so a successful task leaves the registry before the
    /// caller hears about it.
    fn wrap(
        &self,
        app: &AppContext,
        source: &str,
        task: &TransferTask,
        listener: Arc<dyn ProgressListener>,
    ) -> Arc<dyn ProgressListener> {
        Arc::new(RegistryListener {
            registry: Arc::downgrade(&self.inner),
            app_id: app.id.clone(),
            source: source.to_string(),
            task: task.clone(),
            inner: listener,
        })
    }

    fn task(&self, app_id: &str, source: &str) -> Option<TransferTask> {
        self.inner
            .lock()
            .get(app_id)
            .and_then(|entry| entry.tasks.get(source).cloned())
    }

    /// Like [`task`](Self::task), but refuses sources being cancelled.
    fn active_task(&self, app_id: &str, source: &str) -> Result<Option<TransferTask>, TransferError> {
        let apps = self.inner.lock();
        let Some(entry) = apps.get(app_id) else {
            return Ok(None);
        };
        if entry.cancelling.contains_key(source) {
            return Err(TransferError::Cancelling(source.to_string()));
        }
        Ok(entry.tasks.get(source).cloned())
    }

    /// Returns the application's checkpoint store, opening it on first use.
    async fn store(&self, app: &AppContext) -> Result<Arc<CheckpointStore>, TransferError> {
        let existing = self
            .inner
            .lock()
            .get(&app.id)
            .map(|entry| Arc::clone(&entry.store));
        if let Some(store) = existing {
            return Ok(store);
        }

        let path = app.data_dir.join(&self.config().checkpoint_file);
        let opened = Arc::new(blocking(move || CheckpointStore::open(path)).await?);
        // Another caller may have opened it meanwhile; the first one wins.
        let mut apps = self.inner.lock();
        let entry = apps
            .entry(app.id.clone())
            .or_insert_with(|| AppEntry::new(opened));
        Ok(Arc::clone(&entry.store))
    }

    /// Pauses the task for `(app_id, source)` if there is one.
    pub fn pause(&self, app_id: &str, source: &str) {
        if let Some(task) = self.task(app_id, source) {
            debug!(app = app_id, source, "pausing transfer");
            task.pause();
        }
    }

    /// Stops a transfer for good and removes its traces.
    ///
    /// The task (if registered) stays in the registry, marked as
    /// cancelling, until its worker has exited; [`add_task`](Self::add_task)
    /// for the same source fails meanwhile. Then the task is removed and
    /// its checkpoint and, for downloads, its partial file are deleted.
    /// Also cleans up after transfers from an earlier process that were
    /// never registered here.
    pub async fn cancel(
        &self,
        app: &AppContext,
        source: &str,
        target: &str,
        kind: TransferKind,
    ) -> Result<(), TransferError> {
        let store = self.store(app).await?;
        let task = {
            let mut apps = self.inner.lock();
            let entry = apps
                .entry(app.id.clone())
                .or_insert_with(|| AppEntry::new(Arc::clone(&store)));
            *entry.cancelling.entry(source.to_string()).or_default() += 1;
            entry.tasks.get(source).cloned()
        };
        let _marker = CancelMarker {
            registry: Arc::clone(&self.inner),
            app_id: app.id.clone(),
            source: source.to_string(),
        };

        if let Some(task) = task {
            task.pause();
            task.join().await;
            let mut apps = self.inner.lock();
            if let Some(entry) = apps.get_mut(&app.id) {
                if entry.tasks.get(source).is_some_and(|t| t.same_as(&task)) {
                    entry.tasks.remove(source);
                }
            }
        }

        let key = source.to_string();
        match kind {
            TransferKind::Download => {
                with_store(&store, move |s| s.delete_download(&key)).await?;
                let path = self.inner.resolver.resolve(target, &app.workspace)?;
                PartialFile::remove(&PartialFile::temp_path(&path)).await?;
            }
            TransferKind::Upload => with_store(&store, move |s| s.delete_upload(&key)).await?,
        }
        info!(app = %app.id, source, "transfer cancelled");
        Ok(())
    }

    /// Pauses every task of one application. Checkpoints are kept.
    pub fn stop_all_by_app(&self, app_id: &str) {
        let tasks: Vec<TransferTask> = self
            .inner
            .lock()
            .get(app_id)
            .map(|entry| entry.tasks.values().cloned().collect())
            .unwrap_or_default();
        debug!(app = app_id, count = tasks.len(), "pausing application transfers");
        for task in tasks {
            task.pause();
        }
    }

    /// Pauses every task of every application.
    pub fn stop_all(&self) {
        let tasks: Vec<TransferTask> = self
            .inner
            .lock()
            .values()
            .flat_map(|entry| entry.tasks.values().cloned())
            .collect();
        debug!(count = tasks.len(), "pausing all transfers");
        for task in tasks {
            task.pause();
        }
    }

    /// Forgets an application: pauses its tasks, drops them and deletes its
    /// checkpoint file.
    pub async fn uninstall_app(&self, app: &AppContext) -> Result<(), TransferError> {
        let entry = self.inner.lock().remove(&app.id);
        let store = match entry {
            Some(entry) => {
                for task in entry.tasks.values() {
                    task.pause();
                }
                for task in entry.tasks.values() {
                    task.join().await;
                }
                entry.store
            }
            None => {
                let path = app.data_dir.join(&self.config().checkpoint_file);
                Arc::new(blocking(move || CheckpointStore::open(path)).await?)
            }
        };
        with_store(&store, |s| s.destroy()).await?;
        info!(app = %app.id, "application transfers removed");
        Ok(())
    }

    /// Waits until every worker of every application has exited.
    pub async fn join_all(&self) {
        let tasks: Vec<TransferTask> = self
            .inner
            .lock()
            .values()
            .flat_map(|entry| entry.tasks.values().cloned())
            .collect();
        for task in tasks {
            task.join().await;
        }
    }

    pub fn task_state(&self, app_id: &str, source: &str) -> Option<TaskState> {
        self.task(app_id, source).map(|task| task.state())
    }

    pub fn task_count(&self, app_id: &str) -> usize {
        self.inner
            .lock()
            .get(app_id)
            .map_or(0, |entry| entry.tasks.len())
    }

    /// Downloads with a persisted checkpoint, registered or not.
    pub async fn pending_downloads(&self, app: &AppContext) -> Result<Vec<TransferRecord>, TransferError> {
        Ok(self.store(app).await?.downloads())
    }

    /// Uploads with a cached resource id, registered or not.
    pub async fn pending_uploads(&self, app: &AppContext) -> Result<Vec<UploadRecord>, TransferError> {
        Ok(self.store(app).await?.uploads())
    }
}

/// Only plain http(s) urls are accepted.
fn check_url(url: &str) -> Result<(), TransferError> {
    let lower = url.trim().to_ascii_lowercase();
    let rest = lower
        .strip_prefix("http://")
        .or_else(|| lower.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(TransferError::InvalidUrl(url.to_string())),
    }
}

/// Clears one cancel mark when the cancel finishes or is dropped.
struct CancelMarker {
    registry: Arc<RegistryInner>,
    app_id: String,
    source: String,
}

impl Drop for CancelMarker {
    fn drop(&mut self) {
        let mut apps = self.registry.lock();
        let Some(entry) = apps.get_mut(&self.app_id) else {
            return;
        };
        if let Some(count) = entry.cancelling.get_mut(&self.source) {
            *count -= 1;
            if *count == 0 {
                entry.cancelling.remove(&self.source);
            }
        }
    }
}

/// Forwards events to the caller, dropping the task from the registry on
/// success first.
struct RegistryListener {
    registry: Weak<RegistryInner>,
    app_id: String,
    source: String,
    task: TransferTask,
    inner: Arc<dyn ProgressListener>,
}

impl ProgressListener for RegistryListener {
    fn on_success(&self, artifact: Option<LocalArtifact>) {
        if let Some(registry) = self.registry.upgrade() {
            let mut apps = registry.lock();
            if let Some(entry) = apps.get_mut(&self.app_id) {
                let same = entry
                    .tasks
                    .get(&self.source)
                    .is_some_and(|task| task.same_as(&self.task));
                if same {
                    entry.tasks.remove(&self.source);
                }
            }
        }
        self.inner.on_success(artifact);
    }

    fn on_error(&self, failure: TransferFailure) {
        self.inner.on_error(failure);
    }

    fn on_progress(&self, complete: u64, total: u64) {
        self.inner.on_progress(complete, total);
    }
}
