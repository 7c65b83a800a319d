//! Two-phase resumable upload.
//!
//! Every chunk is preceded by a handshake in which the server reports how
//! many bytes of the resource it already holds, so the server offset is
//! always authoritative. The resource id it assigns is cached in the
//! checkpoint store, keyed by file path and size.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ferry_checkpoint::CheckpointStore;
use ferry_protocol::wire::{self, HandshakeReply, ReturnCode};
use ferry_protocol::{TransferFailure, chunk_size};

use crate::TransferError;
use crate::chunked::ChunkReader;
use crate::listener::ProgressListener;
use crate::task::{PausedWhileQueued, TaskControl, TaskState, TransferContext, with_store};

/// Uploads one local file to one url.
pub struct Uploader {
    source: String,
    file: PathBuf,
    url: String,
    store: Arc<CheckpointStore>,
    ctx: TransferContext,
    control: TaskControl,
}

impl Uploader {
    /// Creates an uploader for `file` (the resolved form of `source`).
    pub fn new(
        source: impl Into<String>,
        file: impl Into<PathBuf>,
        url: impl Into<String>,
        store: Arc<CheckpointStore>,
        ctx: TransferContext,
    ) -> Self {
        Self {
            source: source.into(),
            file: file.into(),
            url: url.into(),
            store,
            ctx,
            control: TaskControl::default(),
        }
    }

    /// File path as given by the caller.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    /// Starts or resumes the upload on a new tokio task.
    ///
    /// Returns `false` without doing anything while a run is active.
    pub fn transfer(self: &Arc<Self>, listener: Arc<dyn ProgressListener>) -> bool {
        let this = Arc::clone(self);
        self.control
            .start(move |pause, run| async move { this.run(pause, run, listener).await })
    }

    /// Stops after the chunk in flight. The resource id is kept.
    pub fn pause(&self) {
        self.control.pause();
    }

    pub async fn join(&self) {
        self.control.join().await;
    }

    async fn run(self: Arc<Self>, pause: CancellationToken, run: u64, listener: Arc<dyn ProgressListener>) {
        let _permit = match self.ctx.admit(&pause).await {
            Ok(permit) => permit,
            Err(PausedWhileQueued) => {
                self.control.finish(run, TaskState::Paused);
                return;
            }
        };

        info!(file = %self.source, url = %self.url, "upload started");
        match self.upload(&pause, listener.as_ref()).await {
            Ok(true) => {
                self.control.finish(run, TaskState::Init);
                info!(file = %self.source, "upload complete");
                listener.on_success(None);
            }
            Ok(false) => {
                self.control.finish(run, TaskState::Paused);
                info!(file = %self.source, "upload paused");
            }
            Err(e) => {
                self.control.finish(run, TaskState::Init);
                warn!(file = %self.source, url = %self.url, error = %e, "upload failed");
                listener.on_error(TransferFailure::new(e.code(), &self.source, &self.url));
            }
        }
    }

    /// Sends chunks until the server reports the file complete.
    /// `Ok(false)` means paused.
    async fn upload(
        &self,
        pause: &CancellationToken,
        listener: &dyn ProgressListener,
    ) -> Result<bool, TransferError> {
        let total = match tokio::fs::metadata(&self.file).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(TransferError::FileNotFound(self.file.clone())),
        };
        let mut reader = ChunkReader::open(&self.file, chunk_size(total)).await?;
        let file_name = self
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut resource_id = self.store.resource_id(&self.source, total);
        if let Some(id) = &resource_id {
            debug!(file = %self.source, resource_id = %id, "reusing resource id");
        }

        loop {
            let reply = self.handshake(resource_id.as_deref(), &file_name, total).await?;
            if resource_id.is_none() {
                let (source, id) = (self.source.clone(), reply.resource_id.clone());
                with_store(&self.store, move |store| store.save_resource_id(&source, &id, total))
                    .await?;
                resource_id = Some(reply.resource_id.clone());
            }

            let data = reader.read_at(reply.offset).await?;
            let sent = data.len() as u64;
            match self.send_chunk(&reply, data).await? {
                ReturnCode::FileReceived => {
                    let source = self.source.clone();
                    if let Err(e) = with_store(&self.store, move |store| store.delete_upload(&source)).await {
                        warn!(file = %self.source, error = %e, "failed to delete upload checkpoint");
                    }
                    listener.on_progress(total, total);
                    return Ok(true);
                }
                ReturnCode::ChunkReceived => {
                    if reply.offset >= total {
                        return Err(TransferError::Handshake(format!(
                            "server expects data past the end of a {total}-byte file"
                        )));
                    }
                    listener.on_progress(reply.offset + sent, total);
                }
            }

            if pause.is_cancelled() {
                return Ok(false);
            }
        }
    }

    async fn handshake(
        &self,
        resource_id: Option<&str>,
        file_name: &str,
        total: u64,
    ) -> Result<HandshakeReply, TransferError> {
        let headers = wire::handshake_headers(resource_id, file_name, total);
        let resp = self
            .ctx
            .http
            .post(&self.url, headers, Bytes::new())
            .await
            .map_err(|e| TransferError::Handshake(e.to_string()))?;
        if !resp.is_ok() {
            return Err(TransferError::Handshake(format!("status {}", resp.status)));
        }
        let reply = HandshakeReply::parse_for(&resp.body, total)
            .map_err(|e| TransferError::Handshake(e.to_string()))?;
        debug!(file = %self.source, resource_id = %reply.resource_id, offset = reply.offset, "handshake");
        Ok(reply)
    }

    async fn send_chunk(&self, reply: &HandshakeReply, data: Bytes) -> Result<ReturnCode, TransferError> {
        let headers = wire::upload_headers(&reply.resource_id, reply.offset);
        let resp = self.ctx.http.post(&self.url, headers, data).await?;
        if !resp.is_ok() {
            return Err(TransferError::Rejected(format!("status {}", resp.status)));
        }
        ReturnCode::parse(&resp.body).map_err(|e| TransferError::Rejected(e.to_string()))
    }
}
