pub mod augmentation;
pub mod backbone;
pub mod dual_path;
pub mod evaluation;
pub mod inference;
pub mod metrics;
pub mod ml_model;
pub mod stages;
pub mod training;

pub use augmentation::{AugmentParams, AugmentationConfig};
pub use backbone::{Backbone, BackboneConfig, BackboneFactory, PretrainedBackbone, BACKBONE_LAYERS};
pub use dual_path::{DualPathPredictor, DualPathResult, PreprocessMode, PreprocessPath};
pub use evaluation::{evaluate, EvaluationReport};
pub use inference::{interpret_output, InferenceEngine, PredictionResult};
pub use metrics::{BinaryMetrics, ConfusionMatrix};
pub use ml_model::{CatDogClassifier, ModelConfig, INPUT_PIXEL_RANGE};
pub use stages::{
    CheckpointTracker, EarlyStopping, FineTuneSchedule, LayerFreezeState, StageOutcome,
    TrainingStage,
};
pub use training::{model_config_from, train, EpochRecord, TrainingOptions, TrainingOutcome};
