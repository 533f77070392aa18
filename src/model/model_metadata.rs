//! モデルメタデータの定義
//!
//! tar.gz形式のモデルファイル内に metadata.json として保存されます。
//! 推論側はここに記録されたクラス対応表とモデル設定だけでモデルを復元します。

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::ml::ml_model::{ModelConfig, INPUT_PIXEL_RANGE};
use crate::ml::stages::StageOutcome;
use crate::model::class_mapping::ClassMapping;
use crate::model::config::FinalSavePolicy;

/// metadata.json のフォーマットバージョン
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// 学習の要約
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// 実行した段階ごとの結果
    pub stages: Vec<StageOutcome>,
    /// 両段階を通じた最良の検証損失
    pub best_val_loss: Option<f64>,
    pub final_save: FinalSavePolicy,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub test_samples: usize,
    pub seed: u64,
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
/// - optimizer.bin: オプティマイザの状態（バイナリ、任意）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub format_version: u32,

    /// インデックス -> クラス名
    pub class_mapping: ClassMapping,

    /// モデル構造の復元に必要な設定
    pub model_config: ModelConfig,

    /// モデルが受け取る画素値の範囲（正規化はモデル内部で行う）
    pub input_pixel_range: [f32; 2],

    /// ファインチューニング時に凍結したバックボーン層数
    pub fine_tune_at: usize,

    #[serde(default)]
    pub training: Option<TrainingSummary>,

    /// モデルの学習時刻（RFC3339形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(class_mapping: ClassMapping, model_config: ModelConfig, fine_tune_at: usize) -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            class_mapping,
            model_config,
            input_pixel_range: INPUT_PIXEL_RANGE,
            fine_tune_at,
            training: None,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn with_training(mut self, summary: TrainingSummary) -> Self {
        self.training = Some(summary);
        self
    }

    /// 内容の整合性を検証する
    pub fn validate(&self) -> Result<()> {
        if self.format_version != METADATA_FORMAT_VERSION {
            return Err(ClassifierError::ModelUnavailable(format!(
                "unsupported metadata format version {} (expected {})",
                self.format_version, METADATA_FORMAT_VERSION
            )));
        }
        self.class_mapping.validate()?;
        self.class_mapping
            .validate_output_units(self.model_config.num_outputs)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成（検証込み）
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: ModelMetadata = serde_json::from_str(json)?;
        metadata.validate()?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::augmentation::AugmentationConfig;
    use crate::ml::backbone::BackboneConfig;

    fn metadata() -> ModelMetadata {
        let mapping = ClassMapping::new(vec!["cat".into(), "dog".into()]).unwrap();
        let config = ModelConfig::new(BackboneConfig::new(), AugmentationConfig::new());
        ModelMetadata::new(mapping, config, 12)
    }

    #[test]
    fn test_json_roundtrip() {
        let json = metadata().to_json_string().unwrap();
        assert!(json.contains("\"class_mapping\""));
        let back = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(back.class_mapping.names(), &["cat".to_string(), "dog".to_string()]);
        assert_eq!(back.model_config.image_size, 224);
        assert_eq!(back.input_pixel_range, [0.0, 255.0]);
        assert_eq!(back.fine_tune_at, 12);
        assert!(back.training.is_none());
    }

    #[test]
    fn test_rejects_mapping_output_mismatch() {
        let mut meta = metadata();
        meta.model_config.num_outputs = 3;
        let json = serde_json::to_string(&meta).unwrap();
        assert!(matches!(
            ModelMetadata::from_json_string(&json),
            Err(ClassifierError::ClassMapping(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_format_version() {
        let mut meta = metadata();
        meta.format_version = 42;
        let json = serde_json::to_string(&meta).unwrap();
        assert!(matches!(
            ModelMetadata::from_json_string(&json),
            Err(ClassifierError::ModelUnavailable(_))
        ));
    }
}
