pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod telemetry;
pub mod tunnel;
pub mod version;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
