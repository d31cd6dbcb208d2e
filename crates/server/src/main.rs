//! Tesserae server binary
//!
//! Reads `TESSERAE_*` settings from the environment and serves the canvas.

use tesserae::ServerError;
use tesserae_config::Settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let settings = Settings::from_env()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.server.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "Starting Tesserae on {} (storage at {})",
        settings.server.bind_address(),
        settings.server.storage_path
    );

    tesserae::run(settings).await?;

    info!("Tesserae stopped");
    Ok(())
}
