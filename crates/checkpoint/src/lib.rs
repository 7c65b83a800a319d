//! Durable per-application record of in-progress transfers.
//!
//! A [`CheckpointStore`] remembers, for each download url, how many bytes are
//! expected and how many are already on disk, and for each uploaded file the
//! resource id the server assigned to it. Every mutation is written through
//! to a JSON document so a transfer can resume after the process restarts.

mod records;
mod store;

pub use records::{TransferRecord, UploadRecord};
pub use store::CheckpointStore;

/// Errors produced by the checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
