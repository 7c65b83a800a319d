use std::ffi::OsString;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use ferry_protocol::constants::TEMP_FILE_SUFFIX;

use crate::TransferError;

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a local file in fixed-size chunks at arbitrary offsets.
pub struct ChunkReader {
    file: fs::File,
    chunk_size: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading. A `chunk_size` of 0 is treated as 1.
    pub async fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        Ok(Self {
            file,
            chunk_size: chunk_size.max(1),
            file_size,
        })
    }

    /// Reads the chunk starting at `offset`: `chunk_size` bytes, or the
    /// remainder of the file. Empty at or past the end.
    pub async fn read_at(&mut self, offset: u64) -> Result<Bytes, TransferError> {
        if offset >= self.file_size {
            return Ok(Bytes::new());
        }
        let len = self.chunk_size.min(self.file_size - offset) as usize;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

// ---------------------------------------------------------------------------
// PartialFile
// ---------------------------------------------------------------------------

/// Partial artifact of a download, written next to its final location.
pub struct PartialFile {
    path: PathBuf,
    file: fs::File,
}

impl PartialFile {
    /// Path of the partial artifact for `target` (`<target>.temp`).
    pub fn temp_path(target: &Path) -> PathBuf {
        let mut name: OsString = target.as_os_str().to_os_string();
        name.push(TEMP_FILE_SUFFIX);
        PathBuf::from(name)
    }

    /// Length of the file at `path`, or 0 when it does not exist.
    pub async fn existing_len(path: &Path) -> Result<u64, TransferError> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the file at `path` if present.
    pub async fn remove(path: &Path) -> Result<(), TransferError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Opens (or creates) the partial file positioned at `offset`.
    ///
    /// Bytes past `offset` were never recorded and are dropped.
    pub async fn open(path: &Path, offset: u64) -> Result<Self, TransferError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        if file.metadata().await?.len() != offset {
            file.set_len(offset).await?;
        }
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Appends `data` and flushes it to the file.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Syncs the partial file and moves it to `target`.
    pub async fn finish(mut self, target: &Path) -> Result<(), TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.path, target).await?;
        Ok(())
    }
}
