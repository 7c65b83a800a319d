use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Progress of one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub source_url: String,
    /// Size reported by the server when the download was first seen.
    pub total_size: u64,
    /// Bytes already written to the partial artifact.
    pub complete_size: u64,
}

impl TransferRecord {
    /// A record for a download that has not written anything yet.
    pub fn new(source_url: impl Into<String>, total_size: u64) -> Self {
        Self {
            source_url: source_url.into(),
            total_size,
            complete_size: 0,
        }
    }
}

/// Server identity of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub file_path: String,
    pub resource_id: String,
    /// File size at the time the resource id was issued.
    pub total_size: u64,
}

// ---------------------------------------------------------------------------
// On-disk layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DownloadEntry {
    pub total_size: u64,
    pub complete_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UploadEntry {
    pub resource_id: String,
    pub total_size: u64,
}

/// Full contents of a checkpoint file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Document {
    #[serde(default)]
    pub downloads: BTreeMap<String, DownloadEntry>,
    #[serde(default)]
    pub uploads: BTreeMap<String, UploadEntry>,
}

impl Document {
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty() && self.uploads.is_empty()
    }

    pub fn download_record(&self, url: &str) -> Option<TransferRecord> {
        self.downloads.get(url).map(|entry| TransferRecord {
            source_url: url.to_string(),
            total_size: entry.total_size,
            complete_size: entry.complete_size,
        })
    }
}
