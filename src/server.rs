use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, State},
    response::{Html, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::caption::Captioner;
use crate::error::AppError;
use crate::stylizer::{flatten, Stylizer};

#[derive(Clone)]
pub struct AppState {
    pub captioner: Arc<dyn Captioner>,
    pub stylizer: Stylizer,
    pub upload_dir: PathBuf,
    pub default_style: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CaptionResponse {
    pub base_caption: String,
    pub styled_captions: Vec<String>,
    /// Set when stylization failed; `styled_captions` then holds the same message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stylize_error: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/caption", post(caption_image))
        .layer(DefaultBodyLimit::disable())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(Arc::new(state))
}

/// An uploaded image on disk, removed when dropped.
pub struct TempUpload {
    path: PathBuf,
    removed: bool,
}

impl TempUpload {
    pub fn new(dir: &Path, extension: &str) -> Self {
        Self {
            path: dir.join(format!("temp_{}.{extension}", Uuid::new_v4().simple())),
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_field(&self, mut field: Field<'_>) -> Result<u64, AppError> {
        let mut file = tokio::fs::File::create(&self.path).await?;
        let mut written = 0u64;
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Deletes the file without blocking the runtime. Dropping the guard
    /// instead falls back to a synchronous delete.
    pub async fn remove(mut self) {
        self.removed = true;
        log_removal(&self.path, tokio::fs::remove_file(&self.path).await);
    }
}

fn log_removal(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => debug!(path = %path.display(), "removed temp upload"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove temp upload: {err}"),
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if !self.removed {
            log_removal(&self.path, std::fs::remove_file(&self.path));
        }
    }
}

fn upload_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .filter(|ext| !ext.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "jpg".to_string())
}

async fn caption_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<CaptionResponse>, AppError> {
    let mut upload = None;
    let mut style = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => {
                let temp = TempUpload::new(&state.upload_dir, &upload_extension(field.file_name()));
                let bytes = temp.write_field(field).await?;
                debug!(path = %temp.path().display(), bytes, "stored upload");
                upload = Some(temp);
            }
            Some("style") => style = Some(field.text().await?),
            other => debug!(field = ?other, "ignoring multipart field"),
        }
    }

    let upload = upload.ok_or_else(|| AppError::BadRequest("missing `image` field".to_string()))?;
    let style = style
        .map(|style| style.trim().to_string())
        .filter(|style| !style.is_empty())
        .unwrap_or_else(|| state.default_style.clone());

    // Spawned so the downstream calls finish even if the client goes away.
    let response = tokio::spawn(run_pipeline(state, upload, style)).await??;
    Ok(Json(response))
}

async fn run_pipeline(
    state: Arc<AppState>,
    upload: TempUpload,
    style: String,
) -> Result<CaptionResponse, AppError> {
    let start = Instant::now();

    let captioner = state.captioner.clone();
    let path = upload.path().to_path_buf();
    let base_caption =
        tokio::task::spawn_blocking(move || captioner.generate_caption(&path)).await??;
    upload.remove().await;
    debug!(caption = %base_caption, elapsed = ?start.elapsed(), "base caption ready");

    let result = state.stylizer.stylize(&base_caption, &style).await;
    let stylize_error = result.as_ref().err().map(ToString::to_string);
    if let Some(err) = &stylize_error {
        warn!(style = %style, "stylization failed: {err}");
    }

    info!(
        style = %style,
        stylized = stylize_error.is_none(),
        elapsed = ?start.elapsed(),
        "caption request complete"
    );

    Ok(CaptionResponse {
        base_caption,
        styled_captions: flatten(result),
        stylize_error,
    })
}

async fn index() -> Html<&'static str> {
    Html(include_str!("index.html"))
}
