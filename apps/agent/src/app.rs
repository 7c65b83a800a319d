//! Session orchestration: one registry, the transfers named on the command
//! line, and shutdown handling.

use std::sync::Arc;

use anyhow::{Context, bail};
use ferry_protocol::{TransferEvent, TransferKind};
use ferry_transfer::{AppContext, ChannelListener, ReqwestClient, TransferRegistry};
use tokio::sync::mpsc;

use crate::config::Config;

/// What the agent was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Download { url: String, target: String },
    Upload { file: String, url: String },
    /// Lists transfers that left a checkpoint behind.
    Pending,
}

impl Command {
    pub fn parse(args: &[String]) -> anyhow::Result<Self> {
        match args {
            [cmd, url, target] if cmd == "download" => Ok(Command::Download {
                url: url.clone(),
                target: target.clone(),
            }),
            [cmd, file, url] if cmd == "upload" => Ok(Command::Upload {
                file: file.clone(),
                url: url.clone(),
            }),
            [cmd] if cmd == "pending" => Ok(Command::Pending),
            _ => bail!(
                "usage: ferry-agent download <url> <target> | upload <file> <url> | pending"
            ),
        }
    }
}

/// How a session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Paused,
}

/// Owns the registry for one application and drives a single transfer.
pub struct Session {
    registry: TransferRegistry,
    app: AppContext,
}

impl Session {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = ReqwestClient::new(config.transfer.connect_timeout())
            .context("failed to build HTTP client")?;
        let registry = TransferRegistry::new(Arc::new(http), config.transfer.clone());
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: &Config, registry: TransferRegistry) -> Self {
        let app = AppContext::new(
            config.app_id.clone(),
            config.workspace_path(),
            config.data_dir_path(),
        );
        Self { registry, app }
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    /// Runs `command` until it finishes or `shutdown` resolves.
    ///
    /// On shutdown every task is paused and its worker joined, so the
    /// checkpoint is current when the process exits.
    pub async fn run<S>(&self, command: Command, shutdown: S) -> anyhow::Result<Outcome>
    where
        S: Future<Output = ()>,
    {
        let (source, target, kind) = match command {
            Command::Download { url, target } => (url, target, TransferKind::Download),
            Command::Upload { file, url } => (file, url, TransferKind::Upload),
            Command::Pending => {
                self.log_pending().await?;
                return Ok(Outcome::Completed);
            }
        };

        tokio::fs::create_dir_all(&self.app.workspace)
            .await
            .with_context(|| {
                format!("failed to create workspace {}", self.app.workspace.display())
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Arc::new(ChannelListener::new(source.clone(), tx));
        self.registry
            .add_task(&self.app, &source, &target, kind, listener)
            .await
            .with_context(|| format!("cannot start {source}"))?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(TransferEvent::Progress { complete, total, .. }) => {
                        tracing::debug!(%source, complete, total, "progress");
                    }
                    Some(TransferEvent::Completed { artifact, .. }) => {
                        match artifact {
                            Some(artifact) => tracing::info!(
                                %source,
                                path = %artifact.full_path,
                                size = artifact.size,
                                "download complete"
                            ),
                            None => tracing::info!(%source, %target, "upload complete"),
                        }
                        return Ok(Outcome::Completed);
                    }
                    Some(TransferEvent::Failed(failure)) => {
                        bail!("{} -> {} failed: {}", failure.source, failure.target, failure.code);
                    }
                    None => bail!("transfer listener closed unexpectedly"),
                },
                () = &mut shutdown => {
                    tracing::info!("shutdown requested, pausing transfers");
                    self.registry.stop_all();
                    self.registry.join_all().await;
                    return Ok(Outcome::Paused);
                }
            }
        }
    }

    async fn log_pending(&self) -> anyhow::Result<()> {
        let downloads = self.registry.pending_downloads(&self.app).await?;
        let uploads = self.registry.pending_uploads(&self.app).await?;
        if downloads.is_empty() && uploads.is_empty() {
            tracing::info!(app = %self.app.id, "no pending transfers");
        }
        for record in downloads {
            tracing::info!(
                url = %record.source_url,
                complete = record.complete_size,
                total = record.total_size,
                "pending download"
            );
        }
        for record in uploads {
            tracing::info!(
                file = %record.file_path,
                resource_id = %record.resource_id,
                total = record.total_size,
                "pending upload"
            );
        }
        Ok(())
    }
}

/// Runs the agent until the command finishes or Ctrl-C is pressed.
pub async fn run(config: Config, command: Command) -> anyhow::Result<()> {
    let session = Session::new(&config)?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    match session.run(command, shutdown).await? {
        Outcome::Completed => {}
        Outcome::Paused => tracing::info!("transfers paused; run again to resume"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_commands() {
        assert_eq!(
            Command::parse(&args(&["download", "http://h/a", "dl/a"])).unwrap(),
            Command::Download {
                url: "http://h/a".into(),
                target: "dl/a".into(),
            }
        );
        assert_eq!(
            Command::parse(&args(&["upload", "a.bin", "http://h/up"])).unwrap(),
            Command::Upload {
                file: "a.bin".into(),
                url: "http://h/up".into(),
            }
        );
        assert_eq!(Command::parse(&args(&["pending"])).unwrap(), Command::Pending);
    }

    #[test]
    fn parse_rejects_bad_usage() {
        assert!(Command::parse(&args(&[])).is_err());
        assert!(Command::parse(&args(&["download", "http://h/a"])).is_err());
        assert!(Command::parse(&args(&["move", "a", "b"])).is_err());
    }

    fn test_config(tmp: &tempfile::TempDir) -> Config {
        Config {
            app_id: "test".into(),
            workspace: tmp.path().join("ws").to_string_lossy().into_owned(),
            data_dir: tmp.path().join("data").to_string_lossy().into_owned(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn invalid_url_fails_before_starting() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::new(&test_config(&tmp)).unwrap();
        let command = Command::Download {
            url: "ftp://h/a".into(),
            target: "a".into(),
        };
        let err = session
            .run(command, std::future::pending())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot start"));
        assert_eq!(session.registry().task_count("test"), 0);
    }

    #[tokio::test]
    async fn missing_upload_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::new(&test_config(&tmp)).unwrap();
        let command = Command::Upload {
            file: "nope.bin".into(),
            url: "http://127.0.0.1:9/up".into(),
        };
        assert!(session.run(command, std::future::pending()).await.is_err());
        assert!(tmp.path().join("ws").is_dir());
    }

    #[tokio::test]
    async fn pending_with_no_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::new(&test_config(&tmp)).unwrap();
        let outcome = session
            .run(Command::Pending, std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Completed);
    }
}
