use std::sync::Arc;

use local_tool_server::api_server;
use local_tool_server::backend::{BackendLauncher, NativeLauncher};
use local_tool_server::config::EngineConfig;
use local_tool_server::Engine;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(EngineConfig::from_env());
    let launcher = Arc::new(NativeLauncher::new(config.clone()));
    let capabilities = launcher.capabilities();
    info!(
        browser = capabilities.browser,
        desktop = capabilities.desktop,
        viewport = %format!("{}x{}", config.default_viewport.width, config.default_viewport.height),
        "local tool server starting"
    );

    let engine = Arc::new(Engine::new(config.clone(), launcher));
    if config.desktop_session_at_boot {
        engine.start_default_desktop().await;
    }

    api_server::start_api_server(engine).await
}
