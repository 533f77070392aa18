//! モデル推論機能

use std::collections::BTreeMap;
use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use serde::Serialize;

use crate::dataset::{decode_image_bytes, load_image_pixels};
use crate::error::{ClassifierError, Result};
use crate::ml::evaluation::tensor_values;
use crate::ml::ml_model::CatDogClassifier;
use crate::model::{load_artifact, ClassMapping, ModelMetadata};

/// 1ユニット出力の判定しきい値（p > 0.5 でクラス1）
pub const DECISION_THRESHOLD: f32 = 0.5;

/// 1枚の画像に対する推論結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub predicted_class: String,
    pub predicted_index: usize,
    pub confidence: f32,
    pub all_scores: BTreeMap<String, f32>,
}

/// 1ユニットの確率からクラス番号を決める
pub fn class_index(probability: f32) -> usize {
    usize::from(probability > DECISION_THRESHOLD)
}

/// モデルの生出力を推論結果に変換
///
/// - 1要素: クラス1の確率として扱い、クラス0は 1 - p
/// - 複数要素: クラス分布として扱い、最大値のクラスを選ぶ
pub fn interpret_output(output: &[f32], mapping: &ClassMapping) -> Result<PredictionResult> {
    mapping.validate_output_units(output.len())?;

    let scores: Vec<f32> = if output.len() == 1 {
        let p1 = output[0];
        vec![1.0 - p1, p1]
    } else {
        output.to_vec()
    };

    let predicted_index = if output.len() == 1 {
        class_index(output[0])
    } else {
        scores
            .iter()
            .enumerate()
            .fold(0, |best, (i, s)| if *s > scores[best] { i } else { best })
    };

    let name = |i: usize| {
        mapping
            .name(i)
            .map(str::to_string)
            .ok_or_else(|| ClassifierError::ClassMapping(format!("class index {} is out of range", i)))
    };

    let mut all_scores = BTreeMap::new();
    for (i, score) in scores.iter().enumerate() {
        all_scores.insert(name(i)?, *score);
    }

    Ok(PredictionResult {
        predicted_class: name(predicted_index)?,
        predicted_index,
        confidence: scores[predicted_index],
        all_scores,
    })
}

/// 推論エンジン
///
/// 読み込み後のモデルは変更されないため、複製して複数のリクエストから並行に利用できます。
#[derive(Debug, Clone)]
pub struct InferenceEngine<B: Backend> {
    model: CatDogClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルファイルを読み込んで推論エンジンを初期化
    pub fn load(model_path: &Path, device: &B::Device) -> Result<Self> {
        let artifact = load_artifact(model_path)?;
        let metadata = artifact.metadata;
        metadata.validate()?;

        let model = CatDogClassifier::from_bytes(&metadata.model_config, artifact.model, device)?;
        if model.num_outputs() != metadata.model_config.num_outputs {
            return Err(ClassifierError::ClassMapping(format!(
                "model has {} outputs but metadata declares {}",
                model.num_outputs(),
                metadata.model_config.num_outputs
            )));
        }

        tracing::info!(
            "モデルを読み込みました: {} (クラス: {})",
            model_path.display(),
            metadata.class_mapping.names().join(", ")
        );
        Ok(Self {
            model,
            metadata,
            device: device.clone(),
        })
    }

    /// 学習直後のモデルから推論エンジンを作成
    pub fn from_parts(model: CatDogClassifier<B>, metadata: ModelMetadata, device: &B::Device) -> Result<Self> {
        metadata.validate()?;
        metadata.class_mapping.validate_output_units(model.num_outputs())?;
        Ok(Self {
            model,
            metadata,
            device: device.clone(),
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn class_mapping(&self) -> &ClassMapping {
        &self.metadata.class_mapping
    }

    /// モデルの入力サイズ
    pub fn image_size(&self) -> usize {
        self.metadata.model_config.image_size
    }

    /// CHW 形式の画素配列1枚分を推論し、生の出力を返す
    pub fn predict_pixels(&self, pixels: &[f32]) -> Result<Vec<f32>> {
        let size = self.image_size();
        if pixels.len() != 3 * size * size {
            return Err(ClassifierError::ImageDecode(format!(
                "expected {} pixel values for a {}x{} RGB image, got {}",
                3 * size * size,
                size,
                size,
                pixels.len()
            )));
        }

        let input = Tensor::<B, 1>::from_floats(pixels, &self.device).reshape([1, 3, size, size]);
        let output = self.model.forward(input);
        tensor_values(output.into_data())
    }

    /// 画像のバイト列を分類
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<PredictionResult> {
        let pixels = decode_image_bytes(bytes, self.image_size())?;
        let output = self.predict_pixels(&pixels)?;
        interpret_output(&output, self.class_mapping())
    }

    /// 画像ファイルを分類
    pub fn predict_path(&self, image_path: &Path) -> Result<PredictionResult> {
        let pixels = load_image_pixels(image_path, self.image_size())?;
        let output = self.predict_pixels(&pixels)?;
        interpret_output(&output, self.class_mapping())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::augmentation::AugmentationConfig;
    use crate::ml::backbone::BackboneConfig;
    use crate::ml::ml_model::ModelConfig;
    use crate::model::save_model_with_metadata;
    use burn::backend::NdArray;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    type TestBackend = NdArray<f32>;

    fn cat_dog() -> ClassMapping {
        ClassMapping::new(vec!["cat".into(), "dog".into()]).unwrap()
    }

    fn png_bytes(color: [u8; 3]) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(40, 30, Rgb(color))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_single_sigmoid_output() {
        let result = interpret_output(&[0.8], &cat_dog()).unwrap();
        assert_eq!(result.predicted_class, "dog");
        assert_eq!(result.predicted_index, 1);
        assert!((result.confidence - 0.8).abs() < 1e-6);
        assert!((result.all_scores["cat"] - 0.2).abs() < 1e-6);
        assert!((result.all_scores["dog"] - 0.8).abs() < 1e-6);
        let sum: f32 = result.all_scores.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        let result = interpret_output(&[0.5], &cat_dog()).unwrap();
        assert_eq!(result.predicted_class, "cat");
        assert!((result.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_categorical_output_uses_argmax() {
        let mapping = ClassMapping::new(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let result = interpret_output(&[0.1, 0.7, 0.2], &mapping).unwrap();
        assert_eq!(result.predicted_index, 1);
        assert_eq!(result.predicted_class, "b");
        assert!((result.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_output_width_must_match_mapping() {
        assert!(matches!(
            interpret_output(&[0.1, 0.7, 0.2], &cat_dog()),
            Err(ClassifierError::ClassMapping(_))
        ));
    }

    #[test]
    fn test_saved_model_predicts_identically() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = ModelConfig::new(
            BackboneConfig::new().with_width_multiplier(0.25),
            AugmentationConfig::new(),
        )
        .with_image_size(32);
        let model = config.init::<TestBackend>(&device);
        let metadata = ModelMetadata::new(cat_dog(), config.clone(), 12);

        let path = save_model_with_metadata(
            &dir.path().join("model.tar.gz"),
            &metadata,
            &model.to_bytes().unwrap(),
            None,
        )
        .unwrap();

        let original = InferenceEngine::from_parts(model, metadata, &device).unwrap();
        let loaded = InferenceEngine::<TestBackend>::load(&path, &device).unwrap();
        assert_eq!(loaded.image_size(), 32);

        let image = png_bytes([200, 120, 40]);
        let a = original.predict_bytes(&image).unwrap();
        let b = loaded.predict_bytes(&image).unwrap();
        assert_eq!(a.predicted_class, b.predicted_class);
        assert!((a.confidence - b.confidence).abs() < 1e-5);
    }

    #[test]
    fn test_undecodable_bytes_are_request_errors() {
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
        let err = engine.predict_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ClassifierError::ImageDecode(_)));
    }

    #[test]
    fn test_missing_model_file_is_unavailable() {
        let device = Default::default();
        let err = InferenceEngine::<TestBackend>::load(Path::new("/nonexistent/model.tar.gz"), &device)
            .unwrap_err();
        assert!(matches!(err, ClassifierError::ModelUnavailable(_)));
    }
}
