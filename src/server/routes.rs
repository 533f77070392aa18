//! HTTPエンドポイント

use std::collections::BTreeMap;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::error::{ClassifierError, ErrorKind};
use crate::ml::PredictionResult;

use super::state::SharedState;

/// JSON `{detail}` で返すエラー
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }

    pub fn model_not_loaded() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "Model not loaded")
    }
}

impl From<ClassifierError> for ApiError {
    fn from(e: ClassifierError) -> Self {
        let status = match e.kind() {
            ErrorKind::Request => StatusCode::BAD_REQUEST,
            ErrorKind::Service => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{} {}", self.status, self.detail);
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub supported_classes: Vec<String>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ClassesResponse {
    pub classes: BTreeMap<String, String>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    pub filename: String,
    pub prediction: PredictionResult,
}

/// GET /
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "Cat vs Dog Classifier API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "classes": "GET /classes",
            "predict": "POST /predict (multipart field 'file')"
        }
    }))
}

/// GET /health
pub async fn health(State(state): State<SharedState>) -> Result<Json<HealthResponse>, ApiError> {
    let mapping = state.class_mapping().ok_or_else(ApiError::model_not_loaded)?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        model_loaded: state.model_loaded(),
        supported_classes: mapping.names().to_vec(),
        uptime_seconds: state.uptime_seconds(),
    }))
}

/// GET /classes
pub async fn classes(State(state): State<SharedState>) -> Result<Json<ClassesResponse>, ApiError> {
    let mapping = state.class_mapping().ok_or_else(ApiError::model_not_loaded)?;
    Ok(Json(ClassesResponse {
        classes: mapping.to_index_map(),
        count: mapping.len(),
    }))
}

/// POST /predict
///
/// 確認の順序: モデル (503) -> Content-Type (400) -> デコード (400)
pub async fn predict(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let engine = state.engine()?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), format!("Invalid multipart body: {}", e.body_text())))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::new(e.status(), format!("Failed to read upload: {}", e.body_text())))?;
        upload = Some((filename, content_type, bytes));
        break;
    }
    let (filename, content_type, bytes) =
        upload.ok_or_else(|| ApiError::bad_request("Missing multipart field 'file'"))?;

    if !content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("image/"))
    {
        return Err(ClassifierError::UnsupportedContent(format!(
            "File must be an image, got {}",
            content_type.as_deref().unwrap_or("no content type")
        ))
        .into());
    }

    let size = bytes.len();
    let prediction = tokio::task::spawn_blocking(move || engine.predict_bytes(&bytes))
        .await
        .map_err(|e| ApiError::internal(format!("Prediction task failed: {}", e)))??;

    tracing::info!(
        "予測: {} ({} bytes) -> {} ({:.3})",
        filename,
        size,
        prediction.predicted_class,
        prediction.confidence
    );

    Ok(Json(PredictResponse {
        success: true,
        filename,
        prediction,
    }))
}
