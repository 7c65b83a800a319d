use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::CheckpointError;
use crate::records::{Document, DownloadEntry, TransferRecord, UploadEntry, UploadRecord};

/// Checkpoint records of one application, persisted to a JSON file.
///
/// Records are cached in memory and every mutation rewrites the whole file
/// before returning. All access to one store goes through a single mutex,
/// which is also held while the file is written.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl CheckpointStore {
    /// Opens the store backed by `path`, loading existing records.
    ///
    /// A missing file yields an empty store. A file that cannot be parsed is
    /// logged and ignored; it is replaced by the next mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let doc = load_document(&path)?;
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Document> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Downloads
    // -----------------------------------------------------------------------

    pub fn has_download(&self, url: &str) -> bool {
        self.lock().downloads.contains_key(url)
    }

    pub fn download(&self, url: &str) -> Option<TransferRecord> {
        self.lock().download_record(url)
    }

    /// Inserts or replaces the record for `record.source_url`.
    pub fn save_download(&self, record: &TransferRecord) -> Result<(), CheckpointError> {
        self.commit(|doc| {
            doc.downloads.insert(
                record.source_url.clone(),
                DownloadEntry {
                    total_size: record.total_size,
                    complete_size: record.complete_size.min(record.total_size),
                },
            );
            true
        })
    }

    /// Records `complete_size` bytes done for `url`. Does nothing when the
    /// url has no record.
    pub fn update_download(&self, url: &str, complete_size: u64) -> Result<(), CheckpointError> {
        self.commit(|doc| {
            let Some(entry) = doc.downloads.get_mut(url) else {
                return false;
            };
            let complete_size = complete_size.min(entry.total_size);
            if entry.complete_size == complete_size {
                return false;
            }
            entry.complete_size = complete_size;
            true
        })
    }

    pub fn delete_download(&self, url: &str) -> Result<(), CheckpointError> {
        self.commit(|doc| doc.downloads.remove(url).is_some())
    }

    /// All download records, ordered by url.
    pub fn downloads(&self) -> Vec<TransferRecord> {
        let doc = self.lock();
        doc.downloads
            .keys()
            .filter_map(|url| doc.download_record(url))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Uploads
    // -----------------------------------------------------------------------

    /// Resource id issued for `file_path`, provided the file still has the
    /// size it had when the id was issued.
    pub fn resource_id(&self, file_path: &str, total_size: u64) -> Option<String> {
        self.lock()
            .uploads
            .get(file_path)
            .filter(|entry| entry.total_size == total_size)
            .map(|entry| entry.resource_id.clone())
    }

    pub fn save_resource_id(
        &self,
        file_path: &str,
        resource_id: &str,
        total_size: u64,
    ) -> Result<(), CheckpointError> {
        self.commit(|doc| {
            doc.uploads.insert(
                file_path.to_string(),
                UploadEntry {
                    resource_id: resource_id.to_string(),
                    total_size,
                },
            );
            true
        })
    }

    pub fn delete_upload(&self, file_path: &str) -> Result<(), CheckpointError> {
        self.commit(|doc| doc.uploads.remove(file_path).is_some())
    }

    /// All upload records, ordered by file path.
    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.lock()
            .uploads
            .iter()
            .map(|(path, entry)| UploadRecord {
                file_path: path.clone(),
                resource_id: entry.resource_id.clone(),
                total_size: entry.total_size,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Forgets every record and removes the backing file.
    pub fn destroy(&self) -> Result<(), CheckpointError> {
        let mut doc = self.lock();
        *doc = Document::default();
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed checkpoint file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies `change` to a copy of the records and persists it. The cached
    /// records are only replaced once the file has been written, so a failed
    /// write leaves memory and disk in agreement. `change` returns `false`
    /// when it changed nothing.
    fn commit(&self, change: impl FnOnce(&mut Document) -> bool) -> Result<(), CheckpointError> {
        let mut doc = self.lock();
        let mut next = doc.clone();
        if !change(&mut next) {
            return Ok(());
        }
        self.persist(&next)?;
        *doc = next;
        Ok(())
    }

    /// Writes `doc` to a sibling temp file and renames it over the document.
    fn persist(&self, doc: &Document) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(doc)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = temp_path(&self.path);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(
            path = %self.path.display(),
            downloads = doc.downloads.len(),
            uploads = doc.uploads.len(),
            "persisted checkpoints"
        );
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn load_document(path: &Path) -> Result<Document, CheckpointError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Document::default()),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str::<Document>(&data) {
        Ok(doc) => {
            debug!(
                path = %path.display(),
                downloads = doc.downloads.len(),
                uploads = doc.uploads.len(),
                "loaded checkpoints"
            );
            Ok(doc)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable checkpoint file");
            Ok(Document::default())
        }
    }
}
