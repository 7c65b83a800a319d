use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed to establish a connection for any transfer request.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Total attempts a download makes before reporting a connection error.
pub const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Fixed delay between two download attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Suffix of the partial artifact written while a download is in flight.
pub const TEMP_FILE_SUFFIX: &str = ".temp";

/// Default name of the per-application checkpoint document.
pub const CHECKPOINT_FILE_NAME: &str = "filetransfer_info.json";

// ---------------------------------------------------------------------------
// Upload protocol headers
// ---------------------------------------------------------------------------

pub const HEADER_CHARSET: &str = "Charset";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_ACTION_NAME: &str = "ACTIONNAME";
pub const HEADER_RESOURCE_ID: &str = "RESOURCEID";
pub const HEADER_FILE_NAME: &str = "FILENAME";
pub const HEADER_FILE_SIZE: &str = "FILESIZE";
pub const HEADER_BEFORE: &str = "BEFORE";

pub const CHARSET_UTF8: &str = "UTF-8";
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Upload phase named in the `ACTIONNAME` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Metadata exchange that yields the resource id and resume offset.
    #[serde(rename = "HAND")]
    Hand,
    /// Payload exchange carrying one chunk of file bytes.
    #[serde(rename = "UPLOAD")]
    Upload,
}

impl Action {
    /// Header value sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Hand => "HAND",
            Action::Upload => "UPLOAD",
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk sizing
// ---------------------------------------------------------------------------

const SIZE_KB: u64 = 1000;
const SIZE_MB: u64 = SIZE_KB * SIZE_KB;

/// Smallest chunk ever used; files below it move in one piece.
pub const MIN_CHUNK_SIZE: u64 = SIZE_KB / 10;

/// Chunk size used once a file reaches 10 MB.
pub const MAX_CHUNK_SIZE: u64 = 2 * SIZE_MB;

/// Returns the per-request chunk size for a transfer of `total_size` bytes.
///
/// Splitting by size class keeps progress updates smooth:
/// - below 100 B: one 100 B chunk
/// - below 1 KB: halves
/// - below 1 MB: tenths
/// - below 10 MB: twentieths
/// - otherwise: fixed 2 MB
pub fn chunk_size(total_size: u64) -> u64 {
    if total_size < MIN_CHUNK_SIZE {
        MIN_CHUNK_SIZE
    } else if total_size < SIZE_KB {
        total_size / 2
    } else if total_size < SIZE_MB {
        total_size / 10
    } else if total_size < 10 * SIZE_MB {
        total_size / 20
    } else {
        MAX_CHUNK_SIZE
    }
}
