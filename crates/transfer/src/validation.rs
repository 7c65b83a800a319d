use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Maps caller-supplied paths to locations inside an application workspace.
pub trait SafePathResolver: Send + Sync {
    /// Resolves `candidate` against `root`, rejecting paths that would leave it.
    fn resolve(&self, candidate: &str, root: &Path) -> Result<PathBuf, TransferError>;
}

/// Default resolver: relative paths that stay under the root.
///
/// Rejects:
/// - Empty paths
/// - Names containing `:` (drive letters, alternate streams, url-like input)
/// - Absolute paths
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxResolver;

impl SafePathResolver for SandboxResolver {
    fn resolve(&self, candidate: &str, root: &Path) -> Result<PathBuf, TransferError> {
        validate_relative_path(candidate)?;

        let mut resolved = root.to_path_buf();
        for component in Path::new(candidate).components() {
            if let Component::Normal(part) = component {
                resolved.push(part);
            }
        }
        Ok(resolved)
    }
}

fn validate_relative_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    if file_path.contains(':') {
        return Err(TransferError::InvalidPath(format!(
            "':' not allowed in path: {file_path}"
        )));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
