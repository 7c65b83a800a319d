//! Chunked, resumable HTTP download.
//!
//! The partial artifact lives at `<target>.temp` and the number of bytes
//! written to it is recorded in the checkpoint store after every chunk.
//! On restart the file length is authoritative; the record only has to
//! exist for the download to resume instead of starting over.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ferry_checkpoint::{CheckpointStore, TransferRecord};
use ferry_protocol::{LocalArtifact, TransferFailure, chunk_size};

use crate::TransferError;
use crate::app::AppContext;
use crate::chunked::PartialFile;
use crate::http::HttpError;
use crate::listener::ProgressListener;
use crate::task::{PausedWhileQueued, TaskControl, TaskState, TransferContext, with_store};

/// Result of one GET attempt.
enum Fetch {
    Done,
    Paused,
}

/// Downloads one url into one file of an application workspace.
pub struct Downloader {
    url: String,
    target: PathBuf,
    display_target: String,
    store: Arc<CheckpointStore>,
    ctx: TransferContext,
    control: TaskControl,
}

impl Downloader {
    /// Creates a downloader writing `url` to `target` (already resolved
    /// inside `app`'s workspace).
    pub fn new(
        app: &AppContext,
        url: impl Into<String>,
        target: impl Into<PathBuf>,
        store: Arc<CheckpointStore>,
        ctx: TransferContext,
    ) -> Self {
        let target = target.into();
        Self {
            url: url.into(),
            display_target: app.display_path(&target),
            target,
            store,
            ctx,
            control: TaskControl::default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    /// Starts or resumes the download on a new tokio task.
    ///
    /// Returns `false` without doing anything while a run is active.
    pub fn transfer(self: &Arc<Self>, listener: Arc<dyn ProgressListener>) -> bool {
        let this = Arc::clone(self);
        self.control
            .start(move |pause, run| async move { this.run(pause, run, listener).await })
    }

    /// Stops at the next chunk boundary. The checkpoint is kept.
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Waits for the worker to exit.
    pub async fn join(&self) {
        self.control.join().await;
    }

    async fn run(self: Arc<Self>, pause: CancellationToken, run: u64, listener: Arc<dyn ProgressListener>) {
        let _permit = match self.ctx.admit(&pause).await {
            Ok(permit) => permit,
            Err(PausedWhileQueued) => {
                debug!(url = %self.url, "download paused before it started");
                self.control.finish(run, TaskState::Paused);
                return;
            }
        };

        info!(url = %self.url, target = %self.display_target, "download started");
        match self.download(&pause, listener.as_ref()).await {
            Ok(Some(artifact)) => {
                self.control.finish(run, TaskState::Init);
                info!(url = %self.url, size = artifact.size, "download complete");
                listener.on_success(Some(artifact));
            }
            Ok(None) => {
                self.control.finish(run, TaskState::Paused);
                info!(url = %self.url, "download paused");
            }
            Err(e) => {
                self.control.finish(run, TaskState::Init);
                warn!(url = %self.url, error = %e, "download failed");
                listener.on_error(TransferFailure::new(e.code(), &self.url, &self.display_target));
            }
        }
    }

    /// Drives the download to completion. `Ok(None)` means paused.
    async fn download(
        &self,
        pause: &CancellationToken,
        listener: &dyn ProgressListener,
    ) -> Result<Option<LocalArtifact>, TransferError> {
        let temp = PartialFile::temp_path(&self.target);
        let (total, mut complete) = self.prepare(&temp).await?;
        let chunk = chunk_size(total);
        let attempts = self.ctx.config.attempts();
        let mut attempt = 0;

        while complete < total {
            attempt += 1;
            match self
                .fetch(&temp, &mut complete, total, chunk, pause, listener)
                .await
            {
                Ok(Fetch::Done) => {}
                Ok(Fetch::Paused) => return Ok(None),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(url = %self.url, attempt, complete, error = %e, "download attempt failed, retrying");
                    tokio::select! {
                        biased;
                        _ = pause.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.ctx.config.retry_delay()) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.finalize(&temp, total).await.map(Some)
    }

    /// Returns `(total, complete)`, probing the server for a new download.
    async fn prepare(&self, temp: &Path) -> Result<(u64, u64), TransferError> {
        if let Some(parent) = self.target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Some(record) = self.store.download(&self.url) {
            let on_disk = PartialFile::existing_len(temp).await?;
            let complete = if on_disk > record.total_size {
                warn!(url = %self.url, on_disk, total = record.total_size, "partial file larger than expected, restarting");
                PartialFile::remove(temp).await?;
                0
            } else {
                on_disk
            };
            if complete != record.complete_size {
                self.record_progress(complete).await?;
            }
            debug!(url = %self.url, complete, total = record.total_size, "resuming download");
            return Ok((record.total_size, complete));
        }

        let total = self
            .ctx
            .http
            .probe_length(&self.url)
            .await?
            .ok_or(TransferError::UnknownLength)?;
        let record = TransferRecord::new(&self.url, total);
        with_store(&self.store, move |store| store.save_download(&record)).await?;
        PartialFile::remove(temp).await?;
        debug!(url = %self.url, total, "new download");
        Ok((total, 0))
    }

    /// One ranged GET from `complete` onwards, written in `chunk`-sized
    /// pieces.
    ///
    /// Bytes already buffered when the stream pauses, ends or fails are
    /// written out first, so the next attempt starts after them.
    async fn fetch(
        &self,
        temp: &Path,
        complete: &mut u64,
        total: u64,
        chunk: u64,
        pause: &CancellationToken,
        listener: &dyn ProgressListener,
    ) -> Result<Fetch, TransferError> {
        let body = tokio::select! {
            biased;
            _ = pause.cancelled() => return Ok(Fetch::Paused),
            body = self.ctx.http.get_range(&self.url, *complete) => body?,
        };

        // A plain 200 repeats bytes we already hold.
        let mut skip = if body.partial { 0 } else { *complete };
        if skip > 0 {
            debug!(url = %self.url, skip, "server ignored range request");
        }

        let mut stream = body.stream;
        let mut file = PartialFile::open(temp, *complete).await?;
        let mut buf: Vec<u8> = Vec::with_capacity(chunk as usize);

        loop {
            let piece = tokio::select! {
                biased;
                _ = pause.cancelled() => None,
                piece = stream.next() => Some(piece),
            };
            let mut data = match piece {
                Some(Some(Ok(data))) => data,
                stopped => {
                    self.commit(&mut file, &mut buf, complete, total, listener)
                        .await?;
                    return match stopped {
                        None => Ok(Fetch::Paused),
                        Some(Some(Err(e))) => Err(e.into()),
                        _ => Err(HttpError::UnexpectedEof.into()),
                    };
                }
            };

            if skip > 0 {
                let n = skip.min(data.len() as u64);
                data = data.slice(n as usize..);
                skip -= n;
            }

            while !data.is_empty() {
                let buffered = buf.len() as u64;
                let room = (chunk - buffered).min(total - *complete - buffered) as usize;
                let take = room.min(data.len());
                buf.extend_from_slice(&data[..take]);
                data = data.slice(take..);

                let buffered = buf.len() as u64;
                if buffered == chunk || *complete + buffered == total {
                    self.commit(&mut file, &mut buf, complete, total, listener)
                        .await?;

                    if *complete == total {
                        return Ok(Fetch::Done);
                    }
                    if pause.is_cancelled() {
                        return Ok(Fetch::Paused);
                    }
                }
            }
        }
    }

    /// Appends `buf` to the partial file and checkpoints the new length.
    async fn commit(
        &self,
        file: &mut PartialFile,
        buf: &mut Vec<u8>,
        complete: &mut u64,
        total: u64,
        listener: &dyn ProgressListener,
    ) -> Result<(), TransferError> {
        if buf.is_empty() {
            return Ok(());
        }
        file.write_chunk(buf).await?;
        *complete += buf.len() as u64;
        buf.clear();
        self.record_progress(*complete).await?;
        listener.on_progress(*complete, total);
        Ok(())
    }

    /// Moves the finished partial file into place and drops the checkpoint.
    async fn finalize(&self, temp: &Path, total: u64) -> Result<LocalArtifact, TransferError> {
        PartialFile::open(temp, total).await?.finish(&self.target).await?;
        let url = self.url.clone();
        // The artifact is already in place.
        if let Err(e) = with_store(&self.store, move |store| store.delete_download(&url)).await {
            warn!(url = %self.url, error = %e, "failed to delete download checkpoint");
        }

        let name = self
            .target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(LocalArtifact {
            name,
            full_path: self.display_target.clone(),
            size: total,
        })
    }

    async fn record_progress(&self, complete: u64) -> Result<(), TransferError> {
        let url = self.url.clone();
        with_store(&self.store, move |store| store.update_download(&url, complete)).await
    }
}
