use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ApiError, StorageError};
use crate::model::{ModelService, Prediction};
use crate::storage::{
    allowed_file, secure_filename, unique_filename, ImageCatalog, ImageRecord, LocalBucket,
};

pub struct AppState {
    pub model: ModelService,
    pub bucket: LocalBucket,
    pub catalog: ImageCatalog,
}

pub fn router(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/predict", post(predict_handler))
        .route("/upload", post(upload_handler))
        .route("/images", get(list_images))
        .route("/files/:name", get(serve_file))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
}

struct Upload {
    filename: Option<String>,
    bytes: Vec<u8>,
}

/// Pulls the `file` part out of a multipart body, if there is one.
async fn read_file_field(multipart: &mut Multipart) -> Result<Option<Upload>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            return Ok(Some(Upload {
                filename,
                bytes: bytes.to_vec(),
            }));
        }
    }
    Ok(None)
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    prediction: Prediction,
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let image_data = match read_file_field(&mut multipart).await? {
        Some(upload) if !upload.bytes.is_empty() => upload.bytes,
        _ => return Err(ApiError::BadRequest("No file uploaded".into())),
    };

    let size = image_data.len();
    let prediction = tokio::task::spawn_blocking(move || state.model.predict(&image_data))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    tracing::info!(bytes = size, ?prediction, "prediction served");
    Ok(Json(PredictResponse { prediction }))
}

/// Upload failures keep the `{success, message}` shape of the upload contract.
pub struct UploadFailure(ApiError);

impl From<ApiError> for UploadFailure {
    fn from(err: ApiError) -> Self {
        UploadFailure(err)
    }
}

impl From<StorageError> for UploadFailure {
    fn from(err: StorageError) -> Self {
        UploadFailure(err.into())
    }
}

impl IntoResponse for UploadFailure {
    fn into_response(self) -> Response {
        let status = self.0.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "upload failed");
        }
        let body = json!({ "success": false, "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, UploadFailure> {
    let upload = read_file_field(&mut multipart)
        .await?
        .ok_or_else(|| ApiError::BadRequest("No file part".into()))?;

    let original = upload.filename.unwrap_or_default();
    if original.is_empty() {
        return Err(ApiError::BadRequest("No selected file".into()).into());
    }

    let filename = secure_filename(&original);
    if !allowed_file(&original) || !allowed_file(&filename) {
        return Err(ApiError::BadRequest(format!(
            "File type not allowed: {original}"
        ))
        .into());
    }

    let uploaded_at = Utc::now();
    let key = unique_filename(&filename, uploaded_at);
    let url = state.bucket.put(&key, &upload.bytes).await?;

    let record = ImageRecord {
        id: uuid::Uuid::new_v4().to_string(),
        filename: key,
        original_filename: filename,
        url: url.clone(),
        uploaded_at,
    };
    state.catalog.insert(&record).await?;
    tracing::info!(filename = %record.filename, bytes = upload.bytes.len(), "image uploaded");

    Ok(Json(json!({
        "success": true,
        "message": "File uploaded successfully",
        "url": url,
    })))
}

async fn list_images(State(state): State<Arc<AppState>>) -> Json<Vec<ImageRecord>> {
    match state.catalog.list().await {
        Ok(images) => Json(images),
        Err(err) => {
            tracing::error!(error = %err, "error fetching images");
            Json(Vec::new())
        }
    }
}

async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    if !allowed_file(&name) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let content_type = match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        _ => "image/jpeg",
    };

    match state.bucket.get(&name).await {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::debug!(error = %err, name = %name, "rejected object key");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}
