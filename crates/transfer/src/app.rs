use std::path::{Path, PathBuf};

/// An application whose transfers are tracked together.
///
/// Relative transfer paths resolve against `workspace`; the checkpoint file
/// lives in `data_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppContext {
    pub id: String,
    pub workspace: PathBuf,
    pub data_dir: PathBuf,
}

impl AppContext {
    pub fn new(id: impl Into<String>, workspace: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            workspace: workspace.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Renders `path` relative to the workspace with a leading `/`.
    ///
    /// The workspace itself renders as `/`. Paths outside the workspace are
    /// returned unchanged.
    pub fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.workspace) {
            Ok(rel) => {
                let parts: Vec<_> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                format!("/{}", parts.join("/"))
            }
            Err(_) => path.display().to_string(),
        }
    }
}
