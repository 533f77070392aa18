pub mod class_mapping;
pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use class_mapping::{ClassMapping, CLASS_MAPPING_VERSION};
pub use config::{
    AppConfig, AugmentationSettings, DatasetSettings, DeviceType, FinalSavePolicy, ModelSettings,
    ServerSettings, TrainingSettings,
};
pub use model_metadata::{ModelMetadata, TrainingSummary, METADATA_FORMAT_VERSION};
pub use model_storage::{
    artifact_path, load_artifact, load_metadata, print_metadata_info, save_model_with_metadata,
    ModelArtifact,
};
