//! 推論HTTP API

pub mod routes;
pub mod state;

use std::net::SocketAddr;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{ClassifierError, Result};

pub use routes::ApiError;
pub use state::{AppState, SharedState};

pub fn router(state: SharedState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_upload_bytes());
    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .route("/classes", get(routes::classes))
        .route("/predict", post(routes::predict))
        .with_state(state)
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// サーバーを起動し、終了するまで待つ
pub async fn serve(state: SharedState, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| ClassifierError::Config(format!("invalid listen address {}:{}: {}", host, port, e)))?;

    tracing::info!("サーバーを起動します: http://{}", addr);
    if !state.model_loaded() {
        tracing::warn!("モデルが読み込まれていません");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{cpu_device, ServingBackend};
    use crate::ml::augmentation::AugmentationConfig;
    use crate::ml::backbone::BackboneConfig;
    use crate::ml::ml_model::ModelConfig;
    use crate::ml::InferenceEngine;
    use crate::model::{ClassMapping, ModelMetadata};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "test-boundary-7MA4YWxkTrZu0gW";

    fn loaded_state() -> SharedState {
        loaded_app_state().into_shared()
    }

    fn loaded_app_state() -> AppState {
        let device = cpu_device();
        let config = ModelConfig::new(
            BackboneConfig::new().with_width_multiplier(0.25),
            AugmentationConfig::new(),
        )
        .with_image_size(32);
        let mapping = ClassMapping::new(vec!["cat".into(), "dog".into()]).unwrap();
        let engine = InferenceEngine::from_parts(
            config.init::<ServingBackend>(&device),
            ModelMetadata::new(mapping, config, 12),
            &device,
        )
        .unwrap();
        AppState::new(Some(engine))
    }

    fn empty_state() -> SharedState {
        AppState::new(None).into_shared()
    }

    fn png_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(24, 16, Rgb([90, 160, 30]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn multipart_request(filename: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                filename, content_type
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn bmp_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(width, height, Rgb([200, 120, 60]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Bmp)
            .unwrap();
        bytes
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_root_lists_endpoints() {
        let response = router(empty_state()).oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["endpoints"]["predict"].is_string());
    }

    #[tokio::test]
    async fn test_health_reports_model_state() {
        let response = router(loaded_state()).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model_loaded"], true);
        assert_eq!(body["supported_classes"], serde_json::json!(["cat", "dog"]));

        let response = router(empty_state()).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["detail"], "Model not loaded");
    }

    #[tokio::test]
    async fn test_classes_come_from_persisted_mapping() {
        let response = router(loaded_state()).oneshot(get("/classes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["classes"]["0"], "cat");
        assert_eq!(body["classes"]["1"], "dog");
        assert_eq!(body["count"], 2);
    }

    #[tokio::test]
    async fn test_predict_success() {
        let response = router(loaded_state())
            .oneshot(multipart_request("pet.png", "image/png", &png_bytes()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["filename"], "pet.png");

        let prediction = &body["prediction"];
        let label = prediction["predicted_class"].as_str().unwrap();
        assert!(label == "cat" || label == "dog");
        let total = prediction["all_scores"]["cat"].as_f64().unwrap()
            + prediction["all_scores"]["dog"].as_f64().unwrap();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_predict_without_model_is_503_before_content_checks() {
        let response = router(empty_state())
            .oneshot(multipart_request("notes.txt", "text/plain", b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_predict_rejects_non_image_content() {
        let response = router(loaded_state())
            .oneshot(multipart_request("notes.txt", "text/plain", b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let detail = json_body(response).await["detail"].as_str().unwrap().to_string();
        assert!(detail.contains("image"));
    }

    #[tokio::test]
    async fn test_predict_rejects_undecodable_image() {
        let response = router(loaded_state())
            .oneshot(multipart_request("broken.jpg", "image/jpeg", b"\xff\xd8 truncated"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let detail = json_body(response).await["detail"].as_str().unwrap().to_string();
        assert!(detail.contains("decode"));
    }

    #[tokio::test]
    async fn test_predict_accepts_photo_larger_than_axum_default_limit() {
        let photo = bmp_bytes(1200, 1000);
        assert!(photo.len() > 2 * 1024 * 1024);

        let response = router(loaded_state())
            .oneshot(multipart_request("large.bmp", "image/bmp", &photo))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["filename"], "large.bmp");
    }

    #[tokio::test]
    async fn test_predict_over_configured_limit_is_413() {
        let state = loaded_app_state().with_upload_limit(1024).into_shared();
        let response = router(state)
            .oneshot(multipart_request("large.bmp", "image/bmp", &bmp_bytes(64, 64)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(json_body(response).await["detail"].is_string());
    }
}
