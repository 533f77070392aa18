//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データセット、学習、サーバー設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ClassifierError, Result};

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// クラスごとのサブディレクトリを含むルート
    pub data_dir: String,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 分割・シャッフル用シード
    pub seed: u64,
    /// 学習に使わない割合（検証 + テスト）
    pub holdout_fraction: f64,
    /// 学習データのシャッフルバッファサイズ
    pub shuffle_buffer: usize,
    /// 先読みするバッチ数
    pub prefetch_batches: usize,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            data_dir: "data/train".to_string(),
            image_size: 224,
            batch_size: 64,
            seed: 123,
            holdout_fraction: 0.2,
            shuffle_buffer: 2000,
            prefetch_batches: 2,
        }
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationSettings {
    pub horizontal_flip: bool,
    /// 最大回転量（1回転に対する割合）
    pub max_rotation: f64,
    /// 最大ズーム量（割合）
    pub max_zoom: f64,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            horizontal_flip: true,
            max_rotation: 0.08,
            max_zoom: 0.15,
        }
    }
}

/// 最終保存時の方針
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinalSavePolicy {
    /// 検証損失が最良だった重みを最終成果物とする
    #[default]
    KeepBest,
    /// 学習終了時点の重みでチェックポイントを上書きする
    KeepFinal,
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// ヘッド学習のエポック数
    pub head_epochs: usize,
    /// ファインチューニングのエポック数
    pub fine_tune_epochs: usize,
    /// ヘッド学習の学習率
    pub head_learning_rate: f64,
    /// ファインチューニングの学習率
    pub fine_tune_learning_rate: f64,
    /// 早期終了の猶予エポック数
    pub patience: usize,
    /// このインデックス未満のバックボーン層はファインチューニング中も凍結
    pub fine_tune_at: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// バックボーンの幅係数
    pub width_multiplier: f64,
    /// 最終保存の方針
    #[serde(default)]
    pub final_save: FinalSavePolicy,
    /// 事前学習済みバックボーン重み（burnレコードファイル）
    #[serde(default)]
    pub pretrained_backbone: Option<String>,
    /// エポック履歴をCSVに書き出すか
    pub write_history: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            head_epochs: 5,
            fine_tune_epochs: 8,
            head_learning_rate: 1e-3,
            fine_tune_learning_rate: 1e-5,
            patience: 3,
            fine_tune_at: 12,
            dropout: 0.25,
            width_multiplier: 1.0,
            final_save: FinalSavePolicy::KeepBest,
            pretrained_backbone: None,
            write_history: true,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 使用するモデルファイルのパス
    pub model_path: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "cat_dog_model.tar.gz".to_string(),
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロードされるリクエスト本体の上限（バイト）
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// 32 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

fn default_max_upload_bytes() -> usize {
    DEFAULT_MAX_UPLOAD_BYTES
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// データセット設定
    #[serde(default)]
    pub dataset: DatasetSettings,
    /// データ拡張設定
    #[serde(default)]
    pub augmentation: AugmentationSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// サーバー設定
    #[serde(default)]
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・読めない場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// デフォルトパスに設定を保存する
    pub fn save_default(&self) -> Result<()> {
        let path = Self::default_path();
        self.save(&path)?;
        tracing::info!("設定ファイルを保存しました: {}", path.display());
        Ok(())
    }

    /// 設定値の整合性を検証する
    pub fn validate(&self) -> Result<()> {
        let d = &self.dataset;
        if d.batch_size == 0 {
            return Err(ClassifierError::Config("batch_size must be > 0".into()));
        }
        if d.image_size < 32 {
            return Err(ClassifierError::Config(format!(
                "image_size must be at least 32, got {}",
                d.image_size
            )));
        }
        if !(d.holdout_fraction > 0.0 && d.holdout_fraction < 1.0) {
            return Err(ClassifierError::Config(format!(
                "holdout_fraction must be in (0, 1), got {}",
                d.holdout_fraction
            )));
        }
        let t = &self.training;
        if t.fine_tune_learning_rate >= t.head_learning_rate {
            return Err(ClassifierError::Config(format!(
                "fine_tune_learning_rate ({}) must be smaller than head_learning_rate ({})",
                t.fine_tune_learning_rate, t.head_learning_rate
            )));
        }
        if !(0.0..1.0).contains(&t.dropout) {
            return Err(ClassifierError::Config(format!(
                "dropout must be in [0, 1), got {}",
                t.dropout
            )));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(ClassifierError::Config("max_upload_bytes must be > 0".into()));
        }
        if t.width_multiplier <= 0.0 {
            return Err(ClassifierError::Config("width_multiplier must be > 0".into()));
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("データセット: {}", self.dataset.data_dir);
        println!(
            "画像サイズ: {}x{}, バッチサイズ: {}, シード: {}",
            self.dataset.image_size,
            self.dataset.image_size,
            self.dataset.batch_size,
            self.dataset.seed
        );
        println!("\n--- トレーニング設定 ---");
        println!(
            "ヘッド: {} エポック (lr={})",
            self.training.head_epochs, self.training.head_learning_rate
        );
        println!(
            "ファインチューニング: {} エポック (lr={}, fine_tune_at={})",
            self.training.fine_tune_epochs,
            self.training.fine_tune_learning_rate,
            self.training.fine_tune_at
        );
        println!("早期終了の猶予: {}", self.training.patience);
        println!("ドロップアウト率: {}", self.training.dropout);
        println!("モデルパス: {}", self.model.model_path);
        println!(
            "\nサーバー: {}:{}",
            self.server.host, self.server.port
        );
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.dataset.image_size, 224);
        assert_eq!(config.dataset.batch_size, 64);
        assert_eq!(config.dataset.seed, 123);
        assert_eq!(config.training.head_epochs, 5);
        assert_eq!(config.training.fine_tune_epochs, 8);
        assert_eq!(config.training.final_save, FinalSavePolicy::KeepBest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.dataset.batch_size, deserialized.dataset.batch_size);
        assert_eq!(config.training.fine_tune_at, deserialized.training.fine_tune_at);
    }

    #[test]
    fn test_partial_json_uses_section_defaults() {
        let json = r#"{ "device_type": "Cpu", "training": {
            "head_epochs": 1, "fine_tune_epochs": 1,
            "head_learning_rate": 0.001, "fine_tune_learning_rate": 0.00001,
            "patience": 2, "fine_tune_at": 5, "dropout": 0.2,
            "width_multiplier": 0.5, "write_history": false } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.fine_tune_at, 5);
        assert_eq!(config.training.final_save, FinalSavePolicy::KeepBest);
        assert_eq!(config.dataset.image_size, 224);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_validate_rejects_non_decreasing_learning_rate() {
        let mut config = AppConfig::default();
        config.training.fine_tune_learning_rate = config.training.head_learning_rate;
        assert!(matches!(config.validate(), Err(ClassifierError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = AppConfig::default();
        config.dataset.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.server.port = 9001;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9001);

        let missing = AppConfig::load_or_default_from(dir.path().join("missing.json"));
        assert_eq!(missing.server.port, 8000);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }

    #[test]
    fn test_unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = AppConfig::load_or_default_from(&path);
        assert_eq!(config.dataset.batch_size, 64);
        assert_eq!(AppConfig::default_path(), PathBuf::from("config.json"));
    }

    #[test]
    fn test_server_upload_limit_default_and_override() {
        let json = r#"{ "device_type": "Cpu", "server": { "host": "127.0.0.1", "port": 8080 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);

        let json = r#"{ "device_type": "Cpu", "server": { "host": "127.0.0.1", "port": 8080, "max_upload_bytes": 1024 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.max_upload_bytes, 1024);
    }
}
