use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Startup-fatal failures while bringing the model and label encoder up.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("artifact not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to load {}: {reason}", .path.display())]
    LoadFailure { path: PathBuf, reason: String },

    #[error("label output policy requires a label encoder path")]
    MissingLabelEncoder,

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PreprocessingError {
    #[error("empty image data")]
    Empty,

    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("could not shape tensor: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Per-request failure of `ModelService::predict`. The variants separate
/// client faults from server faults.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("preprocessing error: {0}")]
    Preprocessing(#[from] PreprocessingError),

    #[error("prediction error: {0}")]
    Prediction(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed catalog record: {0}")]
    Record(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Predict(#[from] PredictError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Predict(PredictError::Preprocessing(_)) => StatusCode::BAD_REQUEST,
            ApiError::Predict(PredictError::Prediction(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Storage(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
