//! 2系統の前処理による予測
//!
//! モデルファイルが正規化を内部に持つかどうか分からない場合に備え、
//! 生の画素 (0..255) と正規化済みの画素 ([-1, 1]) の両方で推論し、
//! 指定されたモードに従ってどちらかの結果を採用します。

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::tensor::backend::Backend;
use serde::Serialize;

use crate::dataset::{decode_image_bytes, load_image_pixels};
use crate::error::{ClassifierError, Result};
use crate::ml::inference::{InferenceEngine, DECISION_THRESHOLD};
use crate::ml::ml_model::normalize_pixels;
use crate::model::ClassMapping;

/// 前処理モードの指定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessMode {
    Raw,
    Normalized,
    /// 境界 (0.5) から遠い方を採用
    #[default]
    Auto,
}

impl fmt::Display for PreprocessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreprocessMode::Raw => write!(f, "raw"),
            PreprocessMode::Normalized => write!(f, "normalized"),
            PreprocessMode::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for PreprocessMode {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(PreprocessMode::Raw),
            "normalized" | "norm" => Ok(PreprocessMode::Normalized),
            "auto" => Ok(PreprocessMode::Auto),
            other => Err(ClassifierError::Config(format!(
                "unknown preprocessing mode '{}' (expected raw, normalized or auto)",
                other
            ))),
        }
    }
}

/// 実際に採用した前処理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessPath {
    Raw,
    Normalized,
}

impl fmt::Display for PreprocessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreprocessPath::Raw => write!(f, "raw"),
            PreprocessPath::Normalized => write!(f, "normalized"),
        }
    }
}

/// 境界からの距離
pub fn confidence_distance(probability: f32) -> f32 {
    (probability - 0.5).abs()
}

/// モードと2つの確率から採用する系統を決める
///
/// auto で距離が等しい場合は先に計算した raw を採用します。
pub fn select_path(p_raw: f32, p_normalized: f32, mode: PreprocessMode) -> PreprocessPath {
    match mode {
        PreprocessMode::Raw => PreprocessPath::Raw,
        PreprocessMode::Normalized => PreprocessPath::Normalized,
        PreprocessMode::Auto => {
            if confidence_distance(p_normalized) > confidence_distance(p_raw) {
                PreprocessPath::Normalized
            } else {
                PreprocessPath::Raw
            }
        }
    }
}

/// 2系統予測の結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DualPathResult {
    pub mode: PreprocessMode,
    pub chosen: PreprocessPath,
    /// 採用した系統のクラス1の確率
    pub probability: f32,
    pub predicted_index: usize,
    pub label: String,
    pub p_raw: f32,
    pub p_normalized: f32,
}

impl DualPathResult {
    /// 2系統の確率から採用する結果を組み立てる
    ///
    /// ラベルは p >= 0.5 でクラス1です。APIの `interpret_output` (p > 0.5) とは
    /// ちょうど 0.5 のときだけ結果が異なります。
    pub fn from_probabilities(
        p_raw: f32,
        p_normalized: f32,
        mode: PreprocessMode,
        labels: &ClassMapping,
    ) -> Result<Self> {
        let chosen = select_path(p_raw, p_normalized, mode);
        let probability = match chosen {
            PreprocessPath::Raw => p_raw,
            PreprocessPath::Normalized => p_normalized,
        };
        let predicted_index = usize::from(probability >= DECISION_THRESHOLD);
        let label = labels
            .name(predicted_index)
            .map(str::to_string)
            .ok_or_else(|| {
                ClassifierError::ClassMapping(format!("class index {} is out of range", predicted_index))
            })?;
        Ok(Self {
            mode,
            chosen,
            probability,
            predicted_index,
            label,
            p_raw,
            p_normalized,
        })
    }
}

/// 生の出力からクラス1の確率を取り出す
fn class1_probability(output: &[f32]) -> Result<f32> {
    match output {
        [p1] => Ok(*p1),
        [_, p1] => Ok(*p1),
        _ => Err(ClassifierError::ClassMapping(format!(
            "dual-path prediction needs a binary model, got {} outputs",
            output.len()
        ))),
    }
}

/// 推論エンジンを2系統の前処理で呼び出す予測器
#[derive(Debug, Clone)]
pub struct DualPathPredictor<B: Backend> {
    engine: InferenceEngine<B>,
    labels: ClassMapping,
}

impl<B: Backend> DualPathPredictor<B> {
    /// モデルファイルに保存された対応表をラベルとして使う
    pub fn new(engine: InferenceEngine<B>) -> Self {
        let labels = engine.class_mapping().clone();
        Self { engine, labels }
    }

    /// クラス名を上書きする（未指定の側は保存済みの名前を使う）
    ///
    /// 保存済みの対応表と異なる場合は警告を出します。
    pub fn with_class_names(mut self, class0: Option<String>, class1: Option<String>) -> Result<Self> {
        if class0.is_none() && class1.is_none() {
            return Ok(self);
        }
        let stored = self.engine.class_mapping();
        let name0 = class0.unwrap_or_else(|| stored.name(0).unwrap_or_default().to_string());
        let name1 = class1.unwrap_or_else(|| stored.name(1).unwrap_or_default().to_string());
        let labels = ClassMapping::new(vec![name0, name1])?;
        self.warn_if_mismatched(&labels);
        self.labels = labels;
        Ok(self)
    }

    /// クラス0と1のラベルを入れ替える
    pub fn with_swapped_classes(mut self) -> Self {
        self.labels = self.labels.swapped();
        let labels = self.labels.clone();
        self.warn_if_mismatched(&labels);
        self
    }

    fn warn_if_mismatched(&self, labels: &ClassMapping) {
        if let Err(e) = self.engine.class_mapping().verify_against(labels) {
            tracing::warn!("指定されたラベルが学習時の対応表と異なります: {}", e);
        }
    }

    pub fn labels(&self) -> &ClassMapping {
        &self.labels
    }

    pub fn image_size(&self) -> usize {
        self.engine.image_size()
    }

    /// 0..255 の画素配列で両系統を推論
    pub fn predict_pixels(&self, raw_pixels: &[f32], mode: PreprocessMode) -> Result<DualPathResult> {
        let p_raw = class1_probability(&self.engine.predict_pixels(raw_pixels)?)?;
        let p_normalized =
            class1_probability(&self.engine.predict_pixels(&normalize_pixels(raw_pixels))?)?;

        let result = DualPathResult::from_probabilities(p_raw, p_normalized, mode, &self.labels)?;
        tracing::debug!(
            "2系統予測: raw={:.4} normalized={:.4} -> {} ({})",
            p_raw,
            p_normalized,
            result.chosen,
            result.label
        );
        Ok(result)
    }

    pub fn predict_path(&self, image_path: &Path, mode: PreprocessMode) -> Result<DualPathResult> {
        let pixels = load_image_pixels(image_path, self.image_size())?;
        self.predict_pixels(&pixels, mode)
    }

    pub fn predict_bytes(&self, bytes: &[u8], mode: PreprocessMode) -> Result<DualPathResult> {
        let pixels = decode_image_bytes(bytes, self.image_size())?;
        self.predict_pixels(&pixels, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::augmentation::AugmentationConfig;
    use crate::ml::backbone::BackboneConfig;
    use crate::ml::ml_model::ModelConfig;
    use crate::model::ModelMetadata;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn cat_dog() -> ClassMapping {
        ClassMapping::new(vec!["cat".into(), "dog".into()]).unwrap()
    }

    fn predictor() -> DualPathPredictor<TestBackend> {
        let device = Default::default();
        let config = ModelConfig::new(
            BackboneConfig::new().with_width_multiplier(0.25),
            AugmentationConfig::new(),
        )
        .with_image_size(32);
        let engine = InferenceEngine::from_parts(
            config.init::<TestBackend>(&device),
            ModelMetadata::new(cat_dog(), config, 12),
            &device,
        )
        .unwrap();
        DualPathPredictor::new(engine)
    }

    #[test]
    fn test_auto_prefers_more_confident_path() {
        let result =
            DualPathResult::from_probabilities(0.52, 0.91, PreprocessMode::Auto, &cat_dog()).unwrap();
        assert_eq!(result.chosen, PreprocessPath::Normalized);
        assert_eq!(result.label, "dog");
        assert!((result.probability - 0.91).abs() < 1e-6);
        assert!((result.p_raw - 0.52).abs() < 1e-6);
    }

    #[test]
    fn test_auto_tie_goes_to_raw() {
        assert_eq!(select_path(0.8, 0.2, PreprocessMode::Auto), PreprocessPath::Raw);
        assert_eq!(select_path(0.1, 0.95, PreprocessMode::Auto), PreprocessPath::Normalized);
    }

    #[test]
    fn test_explicit_modes_ignore_confidence() {
        assert_eq!(select_path(0.51, 0.99, PreprocessMode::Raw), PreprocessPath::Raw);
        assert_eq!(select_path(0.99, 0.51, PreprocessMode::Normalized), PreprocessPath::Normalized);

        let result =
            DualPathResult::from_probabilities(0.3, 0.99, PreprocessMode::Raw, &cat_dog()).unwrap();
        assert_eq!(result.label, "cat");
        assert_eq!(result.predicted_index, 0);
    }

    #[test]
    fn test_boundary_probability_is_class_one() {
        let result =
            DualPathResult::from_probabilities(0.5, 0.2, PreprocessMode::Raw, &cat_dog()).unwrap();
        assert_eq!(result.predicted_index, 1);
        assert_eq!(result.label, "dog");

        let result =
            DualPathResult::from_probabilities(0.3, 0.499, PreprocessMode::Normalized, &cat_dog())
                .unwrap();
        assert_eq!(result.label, "cat");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("AUTO".parse::<PreprocessMode>().unwrap(), PreprocessMode::Auto);
        assert_eq!("normalized".parse::<PreprocessMode>().unwrap(), PreprocessMode::Normalized);
        assert!("sideways".parse::<PreprocessMode>().is_err());
    }

    #[test]
    fn test_label_overrides_and_swap() {
        let swapped = predictor().with_swapped_classes();
        assert_eq!(swapped.labels().names(), &["dog".to_string(), "cat".to_string()]);

        let renamed = predictor()
            .with_class_names(None, Some("puppy".into()))
            .unwrap();
        assert_eq!(renamed.labels().name(0), Some("cat"));
        assert_eq!(renamed.labels().name(1), Some("puppy"));

        assert!(predictor()
            .with_class_names(Some("same".into()), Some("same".into()))
            .is_err());
    }

    #[test]
    fn test_predict_pixels_reports_both_paths() {
        let predictor = predictor();
        let pixels = vec![128.0; 3 * 32 * 32];
        let result = predictor.predict_pixels(&pixels, PreprocessMode::Auto).unwrap();
        assert!((0.0..=1.0).contains(&result.p_raw));
        assert!((0.0..=1.0).contains(&result.p_normalized));
        let expected = select_path(result.p_raw, result.p_normalized, PreprocessMode::Auto);
        assert_eq!(result.chosen, expected);
    }
}
