//! HTTPサーバーの状態
//!
//! 読み込み済みの推論エンジンを保持するコンテキストです。グローバル変数は使わず、
//! ルーターに明示的に渡します。

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::backend::{cpu_device, ServingBackend};
use crate::ml::InferenceEngine;
use crate::model::{config::DEFAULT_MAX_UPLOAD_BYTES, ClassMapping};

use super::routes::ApiError;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    engine: Option<Mutex<InferenceEngine<ServingBackend>>>,
    class_mapping: Option<ClassMapping>,
    max_upload_bytes: usize,
    started_at: Instant,
}

impl AppState {
    pub fn new(engine: Option<InferenceEngine<ServingBackend>>) -> Self {
        let class_mapping = engine.as_ref().map(|e| e.class_mapping().clone());
        Self {
            engine: engine.map(Mutex::new),
            class_mapping,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            started_at: Instant::now(),
        }
    }

    /// アップロード上限を設定する
    pub fn with_upload_limit(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// モデルファイルを読み込む
    ///
    /// 失敗してもサーバーは起動し、モデル未ロードの状態で応答します。
    pub fn load(model_path: &Path) -> Self {
        match InferenceEngine::<ServingBackend>::load(model_path, &cpu_device()) {
            Ok(engine) => Self::new(Some(engine)),
            Err(e) => {
                tracing::error!("モデルの読み込みに失敗しました: {}", e);
                tracing::warn!("モデル未ロードのまま起動します (/health は 503 を返します)");
                Self::new(None)
            }
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(self)
    }

    pub fn model_loaded(&self) -> bool {
        self.engine.is_some()
    }

    pub fn class_mapping(&self) -> Option<&ClassMapping> {
        self.class_mapping.as_ref()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// リクエスト用にエンジンを複製する
    pub(crate) fn engine(&self) -> Result<InferenceEngine<ServingBackend>, ApiError> {
        let engine = self.engine.as_ref().ok_or_else(ApiError::model_not_loaded)?;
        let guard = engine
            .lock()
            .map_err(|_| ApiError::internal("inference engine lock poisoned"))?;
        Ok(guard.clone())
    }
}
