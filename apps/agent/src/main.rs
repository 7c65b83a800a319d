//! Ferry agent entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ferry=debug")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = app::Command::parse(&args)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting ferry agent");

    let config = config::Config::load()?;
    tracing::info!(app = %config.app_id, workspace = %config.workspace, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, command))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}
