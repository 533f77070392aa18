//! 犬猫画像の2クラス分類器
//!
//! データセットの検証・分割、転移学習（2段階）、評価、推論、HTTP API を提供します。

pub mod backend;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod ml;
pub mod model;
pub mod server;

pub use error::{ClassifierError, ErrorKind, Result};
pub use ml::{DualPathPredictor, InferenceEngine, PredictionResult, PreprocessMode};
pub use model::{AppConfig, ClassMapping, ModelMetadata};
