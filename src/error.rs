use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Malformed multipart body or missing required field
    #[error("{0}")]
    BadRequest(String),

    /// The upload could not be written to its temp file
    #[error("failed to store upload: {0}")]
    Upload(#[from] std::io::Error),

    /// Image decoding or model inference failed
    #[error("{0}")]
    Caption(String),

    /// A pipeline task panicked or was aborted
    #[error("request worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::BadRequest(format!("invalid multipart body: {err}"))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Caption(format!("{err:#}"))
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Upload(_) | AppError::Caption(_) | AppError::Worker(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::BadRequest(_) => tracing::debug!("Client error: {}", self),
            _ => tracing::error!("Caption request failed: {}", self),
        }

        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            AppError::BadRequest("nope".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(anyhow::anyhow!("bad pixels")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn caption_errors_keep_their_context_chain() {
        let err = AppError::from(anyhow::anyhow!("truncated file").context("failed to decode image"));
        assert_eq!(err.to_string(), "failed to decode image: truncated file");
    }
}
