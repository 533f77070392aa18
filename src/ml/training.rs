//! 2段階の転移学習
//!
//! HEAD 段階でバックボーンを凍結したまま分類ヘッドを学習し、続く FINE_TUNE 段階で
//! `fine_tune_at` 以降の層を低い学習率で再学習します。各段階は早期終了を持ち、
//! 検証損失が（両段階を通じて）改善するたびにモデルファイルを保存します。

use std::path::{Path, PathBuf};

use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::dataset::{BatchStream, DatasetSplits, ImageBatcher, StreamOptions};
use crate::error::{ClassifierError, Result};
use crate::ml::augmentation::AugmentationConfig;
use crate::ml::backbone::{BackboneConfig, BackboneFactory};
use crate::ml::evaluation::{evaluate, tensor_values};
use crate::ml::metrics::csv_error;
use crate::ml::ml_model::{binary_cross_entropy_with_logits, CatDogClassifier, ModelConfig};
use crate::ml::stages::{
    CheckpointTracker, EarlyStopDecision, EarlyStopping, FineTuneSchedule, StageOutcome,
    StageSettings, TrainingStage,
};
use crate::model::{
    save_model_with_metadata, AppConfig, ClassMapping, FinalSavePolicy, ModelMetadata,
    TrainingSummary,
};

/// 学習の実行設定
#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub head_epochs: usize,
    pub fine_tune_epochs: usize,
    pub head_learning_rate: f64,
    pub fine_tune_learning_rate: f64,
    pub patience: usize,
    pub fine_tune_at: usize,
    pub seed: u64,
    pub prefetch: usize,
    pub final_save: FinalSavePolicy,
    /// モデルファイル（チェックポイントと最終保存先）
    pub artifact_path: PathBuf,
    /// エポック履歴のCSV
    pub history_path: Option<PathBuf>,
    pub show_progress: bool,
}

impl TrainingOptions {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let artifact_path = PathBuf::from(&config.model.model_path);
        let history_path = config.training.write_history.then(|| {
            artifact_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join("training_history.csv")
        });
        Self {
            head_epochs: config.training.head_epochs,
            fine_tune_epochs: config.training.fine_tune_epochs,
            head_learning_rate: config.training.head_learning_rate,
            fine_tune_learning_rate: config.training.fine_tune_learning_rate,
            patience: config.training.patience,
            fine_tune_at: config.training.fine_tune_at,
            seed: config.dataset.seed,
            prefetch: config.dataset.prefetch_batches,
            final_save: config.training.final_save,
            artifact_path,
            history_path,
            show_progress: true,
        }
    }
}

/// アプリケーション設定からモデル設定を作る
pub fn model_config_from(config: &AppConfig) -> ModelConfig {
    ModelConfig::new(
        BackboneConfig::new().with_width_multiplier(config.training.width_multiplier),
        AugmentationConfig::new()
            .with_horizontal_flip(config.augmentation.horizontal_flip)
            .with_max_rotation(config.augmentation.max_rotation)
            .with_max_zoom(config.augmentation.max_zoom),
    )
    .with_image_size(config.dataset.image_size)
    .with_dropout(config.training.dropout)
}

/// 1エポック分の記録（training_history.csv の1行）
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub stage: TrainingStage,
    pub epoch: usize,
    pub stage_epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub val_auc: f64,
    pub checkpoint_saved: bool,
}

/// 学習結果
#[derive(Debug)]
pub struct TrainingOutcome<B: AutodiffBackend> {
    /// 最終的に保存されたモデル（推論用バックエンド）
    pub model: CatDogClassifier<B::InnerBackend>,
    pub metadata: ModelMetadata,
    pub artifact_path: PathBuf,
    pub history: Vec<EpochRecord>,
}

struct TrainingRun<'a, B: AutodiffBackend> {
    splits: &'a DatasetSplits,
    mapping: &'a ClassMapping,
    model_config: &'a ModelConfig,
    options: &'a TrainingOptions,
    device: &'a B::Device,
    tracker: CheckpointTracker,
    history: Vec<EpochRecord>,
    stages: Vec<StageOutcome>,
    /// 全体で最良のモデルとその時点のオプティマイザ状態
    best: Option<(CatDogClassifier<B>, Vec<u8>)>,
    global_epoch: usize,
}

/// 2段階学習を実行し、モデルファイルを書き出す
pub fn train<B, F>(
    splits: &DatasetSplits,
    mapping: &ClassMapping,
    model_config: &ModelConfig,
    options: &TrainingOptions,
    factory: &F,
    device: &B::Device,
) -> Result<TrainingOutcome<B>>
where
    B: AutodiffBackend,
    F: BackboneFactory<B>,
{
    if model_config.num_outputs != 1 {
        return Err(ClassifierError::Config(format!(
            "training supports a single sigmoid output, got {} outputs",
            model_config.num_outputs
        )));
    }
    mapping.validate_output_units(model_config.num_outputs)?;

    let mut model = model_config.init_with::<B, F>(factory, device)?;
    let schedule = FineTuneSchedule::new(
        options.head_epochs,
        options.fine_tune_epochs,
        options.head_learning_rate,
        options.fine_tune_learning_rate,
        options.fine_tune_at,
        model.backbone().num_layers(),
    )?;

    let mut run = TrainingRun {
        splits,
        mapping,
        model_config,
        options,
        device,
        tracker: CheckpointTracker::new(),
        history: Vec::new(),
        stages: Vec::new(),
        best: None,
        global_epoch: 0,
    };

    let mut last_optimizer: Option<Vec<u8>> = None;
    let mut settings = schedule.initial();
    while let Some(stage) = settings {
        tracing::info!(
            "=== 段階 {} を開始: {} エポック, lr={}, 学習可能な層 {}/{} ===",
            stage.stage,
            stage.epochs,
            stage.learning_rate,
            stage.freeze.trainable_count(),
            stage.freeze.num_layers()
        );
        let (trained, optimizer_bytes, outcome) = run.run_stage(model, &stage)?;
        model = trained;
        last_optimizer = Some(optimizer_bytes);

        let transition = schedule.transition(stage.stage, &outcome);
        tracing::info!("段階遷移: {} -> {}", stage.stage, transition.next);
        run.stages.push(outcome);
        settings = transition.settings;
    }

    let (final_model, optimizer) = match options.final_save {
        FinalSavePolicy::KeepBest => match run.best.take() {
            Some((best, optimizer)) => (best, Some(optimizer)),
            None => (model, last_optimizer),
        },
        FinalSavePolicy::KeepFinal => (model, last_optimizer),
    };
    let final_model = final_model.valid();
    let metadata = run.metadata();
    let artifact_path = save_model_with_metadata(
        &options.artifact_path,
        &metadata,
        &final_model.to_bytes()?,
        optimizer.as_deref(),
    )?;
    tracing::info!(
        "最終モデルを保存しました ({:?}): {}",
        options.final_save,
        artifact_path.display()
    );

    if let Some(history_path) = &options.history_path {
        write_history(history_path, &run.history)?;
        tracing::info!("学習履歴を保存しました: {}", history_path.display());
    }

    Ok(TrainingOutcome {
        model: final_model,
        metadata,
        artifact_path,
        history: run.history,
    })
}

impl<'a, B: AutodiffBackend> TrainingRun<'a, B> {
    fn metadata(&self) -> ModelMetadata {
        let summary = TrainingSummary {
            stages: self.stages.clone(),
            best_val_loss: self.tracker.best(),
            final_save: self.options.final_save,
            train_samples: self.splits.train.samples().len(),
            validation_samples: self.splits.validation.samples().len(),
            test_samples: self.splits.test.samples().len(),
            seed: self.options.seed,
        };
        ModelMetadata::new(
            self.mapping.clone(),
            self.model_config.clone(),
            self.options.fine_tune_at,
        )
        .with_training(summary)
    }

    fn progress_bar(&self, len: usize, stage: TrainingStage, epoch: usize, epochs: usize) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("  {prefix} {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}")
        {
            pb.set_style(style);
        }
        pb.set_prefix(format!("[{} {}/{}]", stage, epoch + 1, epochs));
        pb
    }

    fn run_stage(
        &mut self,
        mut model: CatDogClassifier<B>,
        settings: &StageSettings,
    ) -> Result<(CatDogClassifier<B>, Vec<u8>, StageOutcome)> {
        // 段階ごとに新しいオプティマイザ
        let mut optim = AdamConfig::new().init::<B, CatDogClassifier<B>>();
        let mut early_stopping = EarlyStopping::new(self.options.patience);
        let mut stage_best: Option<CatDogClassifier<B>> = None;
        let mut epochs_run = 0;
        let mut early_stopped = false;

        let image_size = self.model_config.image_size;
        let batcher = ImageBatcher::new(image_size);

        for stage_epoch in 0..settings.epochs {
            let epoch = self.global_epoch;
            self.global_epoch += 1;
            epochs_run += 1;

            let train_split = &self.splits.train;
            let stream = BatchStream::spawn(
                train_split.epoch_order(epoch),
                StreamOptions {
                    batch_size: train_split.batch_size(),
                    image_size,
                    prefetch: self.options.prefetch,
                    augmentation: Some(self.model_config.augmentation.clone()),
                    seed: self.options.seed.wrapping_add(epoch as u64),
                },
            );
            let progress = self.progress_bar(
                train_split.num_batches(),
                settings.stage,
                stage_epoch,
                settings.epochs,
            );

            let mut loss_sum = 0.0;
            let mut correct = 0usize;
            let mut seen = 0usize;
            for batch in stream.tensors::<B>(&batcher, self.device) {
                let [batch_size, _] = batch.targets.dims();
                let logits = model.forward_training(batch.images, &settings.freeze);
                let loss = binary_cross_entropy_with_logits(logits.clone(), batch.targets.clone());
                let loss_value: f64 = loss.clone().into_scalar().elem();

                let logit_values = tensor_values(logits.into_data())?;
                let target_values = tensor_values(batch.targets.into_data())?;
                correct += logit_values
                    .iter()
                    .zip(&target_values)
                    .filter(|(z, y)| (**z > 0.0) == (**y > 0.5))
                    .count();
                loss_sum += loss_value * batch_size as f64;
                seen += batch_size;

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(settings.learning_rate, model, grads);

                progress.inc(1);
                progress.set_message(format!("loss {:.4}", loss_value));
            }
            progress.finish_and_clear();

            if seen == 0 {
                return Err(ClassifierError::Training(
                    "no training batch could be loaded".into(),
                ));
            }
            let train_loss = loss_sum / seen as f64;
            let train_accuracy = correct as f64 / seen as f64;

            let report = evaluate(
                &model.valid(),
                &self.splits.validation,
                image_size,
                self.options.prefetch,
                self.device,
            )?;
            let val = report.metrics;

            let decision = early_stopping.update(stage_epoch, val.loss);
            if decision == EarlyStopDecision::Improved {
                stage_best = Some(model.clone());
            }

            let checkpoint_saved = self.tracker.observe(val.loss);
            if checkpoint_saved {
                let optimizer_bytes = record_optimizer::<B, _>(&optim)?;
                let path = save_model_with_metadata(
                    &self.options.artifact_path,
                    &self.metadata(),
                    &model.valid().to_bytes()?,
                    Some(&optimizer_bytes),
                )?;
                tracing::info!(
                    "val_loss が {:.4} に改善したためチェックポイントを保存: {}",
                    val.loss,
                    path.display()
                );
                self.best = Some((model.clone(), optimizer_bytes));
            }

            tracing::info!(
                "[{}] epoch {}/{}: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4} val_auc={:.4}",
                settings.stage,
                stage_epoch + 1,
                settings.epochs,
                train_loss,
                train_accuracy,
                val.loss,
                val.accuracy,
                val.auc
            );
            self.history.push(EpochRecord {
                stage: settings.stage,
                epoch,
                stage_epoch,
                learning_rate: settings.learning_rate,
                train_loss,
                train_accuracy,
                val_loss: val.loss,
                val_accuracy: val.accuracy,
                val_auc: val.auc,
                checkpoint_saved,
            });

            if decision == EarlyStopDecision::Stop {
                tracing::info!(
                    "{} エポック改善がないため段階 {} を早期終了します",
                    self.options.patience,
                    settings.stage
                );
                early_stopped = true;
                break;
            }
        }

        // 段階内の最良の重みに戻す
        if let Some(best) = stage_best {
            model = best;
            if let Some(epoch) = early_stopping.best_epoch() {
                tracing::info!("段階 {} の最良の重み (epoch {}) を復元", settings.stage, epoch + 1);
            }
        }

        let optimizer_bytes = record_optimizer::<B, _>(&optim)?;
        let outcome = StageOutcome {
            stage: settings.stage,
            epochs_run,
            best_val_loss: early_stopping.best(),
            best_epoch: early_stopping.best_epoch(),
            early_stopped,
            learning_rate: settings.learning_rate,
        };
        Ok((model, optimizer_bytes, outcome))
    }
}

/// オプティマイザの状態をバイト列に変換（optimizer.bin）
fn record_optimizer<B, O>(optim: &O) -> Result<Vec<u8>>
where
    B: AutodiffBackend,
    O: Optimizer<CatDogClassifier<B>, B>,
{
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(&recorder, optim.to_record(), ())
        .map_err(|e| ClassifierError::Training(format!("failed to record optimizer state: {:?}", e)))
}

/// エポック履歴をCSVに書き出す
pub fn write_history(path: &Path, history: &[EpochRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    for record in history {
        writer.serialize(record).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}
