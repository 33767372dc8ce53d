//! Captions an uploaded image with BLIP, then rewrites the caption in a
//! requested style through Gemini.

pub mod caption;
pub mod config;
pub mod error;
pub mod server;
pub mod stylizer;
pub mod telemetry;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

pub use caption::{BlipCaptioner, Captioner};
pub use config::Config;
pub use server::{router, AppState, CaptionResponse};
pub use stylizer::{StylizeError, Stylizer};

/// Loads the model, binds the listener and serves until `shutdown` resolves.
pub async fn serve<F>(config: Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("failed to create {}", config.upload_dir.display()))?;

    let blip_config = config.blip.clone();
    let captioner = tokio::task::spawn_blocking(move || BlipCaptioner::load(&blip_config))
        .await
        .context("model loader panicked")??;
    let stylizer = Stylizer::new(&config.gemini).context("failed to build HTTP client")?;

    let state = AppState {
        captioner: Arc::new(captioner),
        stylizer,
        upload_dir: config.upload_dir.clone(),
        default_style: config.default_style.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(
        addr = %config.bind_addr,
        model = %config.gemini.model,
        upload_dir = %config.upload_dir.display(),
        "server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
