pub mod admin;
pub mod app;
pub mod config;
pub mod connect;
pub mod dial;
pub mod logging;
pub mod net;
pub mod proxy;
pub mod relay;
pub mod telemetry;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    listen_override: Option<String>,
) -> anyhow::Result<()> {
    app::run(config_path, listen_override).await
}
