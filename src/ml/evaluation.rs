//! 学習済みモデルの評価
//!
//! 分割全体の損失・正解率・AUCと混同行列を計算します。モデルの状態は変更しません。

use burn::tensor::backend::Backend;
use serde::Serialize;

use crate::dataset::{BatchStream, ImageBatch, ImageBatcher, Split, StreamOptions};
use crate::error::{ClassifierError, Result};
use crate::ml::metrics::{BinaryMetrics, ConfusionMatrix};
use crate::ml::ml_model::CatDogClassifier;

/// 評価結果
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub metrics: BinaryMetrics,
    pub confusion: ConfusionMatrix,
}

impl EvaluationReport {
    pub fn from_predictions(probabilities: &[f32], labels: &[f32]) -> Self {
        Self {
            metrics: BinaryMetrics::compute(probabilities, labels),
            confusion: ConfusionMatrix::from_predictions(probabilities, labels),
        }
    }
}

/// バッチ列に対する確率と正解ラベルを集める
pub fn collect_predictions<B, I>(model: &CatDogClassifier<B>, batches: I) -> Result<(Vec<f32>, Vec<f32>)>
where
    B: Backend,
    I: IntoIterator<Item = ImageBatch<B>>,
{
    if model.num_outputs() != 1 {
        return Err(ClassifierError::Config(format!(
            "binary evaluation requires a single sigmoid output, model has {}",
            model.num_outputs()
        )));
    }

    let mut probabilities = Vec::new();
    let mut labels = Vec::new();
    for batch in batches {
        let output = model.forward(batch.images);
        probabilities.extend(tensor_values(output.into_data())?);
        labels.extend(tensor_values(batch.targets.into_data())?);
    }
    Ok((probabilities, labels))
}

pub(crate) fn tensor_values(data: burn::tensor::TensorData) -> Result<Vec<f32>> {
    data.to_vec::<f32>()
        .map_err(|e| ClassifierError::Training(format!("failed to read tensor data: {:?}", e)))
}

/// 分割全体を評価する（データ拡張なし、固定順）
pub fn evaluate<B: Backend>(
    model: &CatDogClassifier<B>,
    split: &Split,
    image_size: usize,
    prefetch: usize,
    device: &B::Device,
) -> Result<EvaluationReport> {
    let stream = BatchStream::spawn(
        split.epoch_order(0),
        StreamOptions {
            batch_size: split.batch_size(),
            image_size,
            prefetch,
            augmentation: None,
            seed: 0,
        },
    );
    let batcher = ImageBatcher::new(image_size);
    let (probabilities, labels) = collect_predictions(model, stream.tensors(&batcher, device))?;

    let report = EvaluationReport::from_predictions(&probabilities, &labels);
    tracing::info!("評価 ({}): {}", split.kind(), report.metrics);
    Ok(report)
}
