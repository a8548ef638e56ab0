use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use kraken_agent::auth::{AuthManager, FileTokenStore};
use kraken_agent::client::ControlPlaneClient;
use kraken_agent::handlers::deploy::DeployConfig;
use kraken_agent::handlers::{CleanupHandler, DeployHandler, UpdateHandler};
use kraken_agent::paths;
use kraken_agent::runtime::AgentRuntime;
use kraken_agent::Settings;

#[derive(Parser)]
#[command(name = "kraken-agent")]
#[command(about = "Kraken deployment agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings overlay: layers agentsettings.<name>.json over the base file
    overlay: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let work_dir = std::env::current_dir()?;
    let settings = Settings::load(&work_dir, cli.overlay.as_deref())?;
    log::info!(
        "kraken-agent {} starting as agent {} (workspace {})",
        env!("CARGO_PKG_VERSION"),
        settings.agent.id,
        settings.agent.workspace_id
    );

    let store = Arc::new(FileTokenStore::new(platform_tag(), &work_dir));
    let auth = Arc::new(AuthManager::new(
        store,
        settings.auth.url.clone(),
        settings.agent.id,
    )?);
    let client = Arc::new(ControlPlaneClient::new(
        auth.clone(),
        settings.agent_api.url.clone(),
        settings.agent.organization_id.clone(),
        settings.agent.workspace_id.clone(),
        settings.agent.id,
    ));

    let deploy = DeployHandler::new(client.clone(), DeployConfig::default())?;
    let cleanup = CleanupHandler::new(
        paths::default_artifacts_root(),
        paths::default_installations_root(),
        settings.agent.id,
    );
    let update = UpdateHandler::new(settings.agent.workspace_id.clone(), settings.agent.id)?;

    let mut runtime = AgentRuntime::new(
        client,
        auth,
        deploy,
        cleanup,
        update,
        env!("CARGO_PKG_VERSION"),
        work_dir,
    );
    runtime.run().await?;

    log::info!("kraken-agent exited cleanly");
    Ok(())
}

fn platform_tag() -> &'static str {
    if cfg!(windows) {
        "win-x64"
    } else {
        "linux-x64"
    }
}
