use anyhow::Result;
use tracing_subscriber::EnvFilter;

use finpull::app::App;
use finpull::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let cfg = Config::load_with_env(&config_path)?;
    tracing::info!(
        "starting finpull environment={} backend={}",
        cfg.environment,
        cfg.backend.kind
    );

    let app = App::build(cfg).await?;
    app.run().await
}
