//! Resumable chunked downloads and uploads.
//!
//! A [`TransferRegistry`] owns one [`Downloader`] or [`Uploader`] per
//! (application, source) pair. Each runs on its own tokio task, persists its
//! progress to the application's [`CheckpointStore`] after every chunk and
//! reports through a [`ProgressListener`]. Pausing is cooperative; a paused
//! or interrupted transfer picks up from its checkpoint, even after the
//! process restarts.
//!
//! [`CheckpointStore`]: ferry_checkpoint::CheckpointStore

mod app;
mod chunked;
mod config;
mod download;
mod http;
mod listener;
mod registry;
mod task;
mod upload;
mod validation;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

use ferry_checkpoint::CheckpointError;
use ferry_protocol::ErrorCode;

pub use app::AppContext;
pub use chunked::{ChunkReader, PartialFile};
pub use config::TransferConfig;
pub use download::Downloader;
pub use http::{
    ByteStream, CookieProvider, HttpClient, HttpError, HttpFuture, PostResponse, RangeBody,
    ReqwestClient,
};
pub use listener::{ChannelListener, ProgressListener};
pub use registry::TransferRegistry;
pub use task::{TaskState, TransferContext, TransferTask};
pub use upload::Uploader;
pub use validation::{SafePathResolver, SandboxResolver};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unsupported url: {0}")]
    InvalidUrl(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("server did not report a content length")]
    UnknownLength,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("transfer is being cancelled: {0}")]
    Cancelling(String),
}

impl TransferError {
    /// Error code reported to the caller for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransferError::InvalidUrl(_) | TransferError::Handshake(_) => ErrorCode::InvalidUrl,
            TransferError::InvalidPath(_)
            | TransferError::FileNotFound(_)
            | TransferError::Io(_)
            | TransferError::Checkpoint(_) => ErrorCode::FileNotFound,
            TransferError::Http(_)
            | TransferError::UnknownLength
            | TransferError::Rejected(_)
            | TransferError::Cancelling(_) => ErrorCode::ConnectionError,
        }
    }

    /// Whether a download attempt failing with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Http(_))
    }
}
