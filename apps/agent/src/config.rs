//! Agent configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/ferry/agent.toml`
//! - Windows: `%APPDATA%/ferry/agent.toml`

use std::path::{Path, PathBuf};

use ferry_transfer::TransferConfig;
use serde::{Deserialize, Serialize};

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application id whose transfers this agent runs.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Root that relative transfer paths resolve against.
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Directory holding the checkpoint file.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_app_id() -> String {
    "ferry".into()
}

fn default_workspace() -> String {
    "~/Ferry".into()
}

fn default_data_dir() -> String {
    "~/.local/share/ferry".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            workspace: default_workspace(),
            data_dir: default_data_dir(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn workspace_path(&self) -> PathBuf {
        expand_path(&self.workspace)
    }

    pub fn data_dir_path(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }
}

/// Expands a leading `~/` to the `$HOME` directory.
fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("ferry")
            .join("agent.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("ferry").join("agent.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/ferry/agent.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.app_id, "ferry");
        assert_eq!(config.workspace, "~/Ferry");
        assert_eq!(config.transfer, TransferConfig::default());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
app_id = "photos"

[transfer]
retry_attempts = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.app_id, "photos");
        assert_eq!(config.data_dir, "~/.local/share/ferry");
        assert_eq!(config.transfer.retry_attempts, 5);
        assert_eq!(config.transfer.checkpoint_file, "filetransfer_info.json");
    }

    #[test]
    fn load_writes_defaults_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ferry").join("agent.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.app_id, "ferry");

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.transfer, config.transfer);
    }

    #[test]
    fn save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.toml");

        let mut config = Config {
            app_id: "SaveTest".into(),
            workspace: "/srv/ferry".into(),
            ..Config::default()
        };
        config.transfer.max_concurrent_tasks = Some(2);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.app_id, "SaveTest");
        assert_eq!(loaded.workspace_path(), PathBuf::from("/srv/ferry"));
        assert_eq!(loaded.transfer.max_concurrent_tasks, Some(2));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.toml");
        std::fs::write(&path, "app_id = [").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn absolute_paths_are_kept() {
        assert_eq!(expand_path("/var/lib/ferry"), PathBuf::from("/var/lib/ferry"));
        assert_eq!(expand_path("relative/dir"), PathBuf::from("relative/dir"));
    }

    #[test]
    fn config_path_not_empty() {
        let path = config_path().unwrap();
        assert!(path.to_string_lossy().contains("ferry"));
    }
}
