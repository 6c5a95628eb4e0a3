mod config;
mod dither;
mod http;
mod jobs;
mod palette;
mod pipeline;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config first so we can honor logging.filter directive.
    let cfg_path = std::env::var_os("PIXELART_CONFIG").map(PathBuf::from);
    let shared = config::ConfigManager::load(cfg_path).await?;
    let cfg_snapshot = config::ConfigManager::to_struct(&shared).await?;
    let filter_directive = cfg_snapshot
        .logging
        .as_ref()
        .and_then(|l| l.filter.clone())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info,pixelart_server=debug".to_string());
    fmt()
        .with_env_filter(EnvFilter::new(filter_directive))
        .init();
    let limits = cfg_snapshot.upload_limits();
    tracing::info!(
        max_bytes = limits.max_bytes,
        default_pixel_size = limits.default_pixel_size,
        min_pixel_size = limits.min_pixel_size,
        max_pixel_size = limits.max_pixel_size,
        "upload limits"
    );
    let state = http::AppState {
        cfg: shared,
        store: Arc::new(jobs::ImageStore::new()),
    };
    let app = http::router(state);
    http::serve(app, cfg_snapshot.bind_address()).await?;
    Ok(())
}
