//! Stowage upload server
//!
//! Main entry point: loads configuration, builds every configured storage
//! transport and serves the files API.

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stowage_api::{AppState, create_router};
use stowage_core::UploadService;
use stowage_core::transport;
use stowage_core::upload::UploadPolicy;
use stowage_shared::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stowage=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load()?;
    config.validate()?;
    config.prepare_directories()?;

    let transports = transport::from_config(&config.storages, &config.upload)?;
    for (index, provider) in config.storages.iter().enumerate() {
        info!(
            transport = provider.name(),
            reporting = index == 0,
            "Storage transport configured"
        );
    }

    let policy = UploadPolicy::from_config(&config.upload)?;
    let uploads = UploadService::new(transports, policy)?;
    let state = AppState::new(
        uploads,
        config.upload.tmp_dir.clone(),
        &config.upload.upload_url,
        config.upload.use_ssl,
    );

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(upload_url = %config.upload.upload_url, "Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
