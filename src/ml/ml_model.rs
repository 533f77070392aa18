//! 分類モデルの定義
//!
//! 入力正規化 -> バックボーン -> 全体平均プーリング -> ドロップアウト -> 全結合 (1ユニット)
//! の構成で、クラス1の確率を出力します。

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig,
    },
    tensor::{
        activation::{sigmoid, softmax},
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};

use crate::error::{self, ClassifierError};
use crate::ml::augmentation::AugmentationConfig;
use crate::ml::backbone::{Backbone, BackboneConfig, BackboneFactory};
use crate::ml::stages::LayerFreezeState;

/// 入力画素の範囲（モデル内部で正規化するため生の 0..255 を受け取る）
pub const INPUT_PIXEL_RANGE: [f32; 2] = [0.0, 255.0];

const PIXEL_SCALE: f32 = 127.5;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// 出力ユニット数（2クラスならシグモイド1ユニット）
    #[config(default = 1)]
    pub num_outputs: usize,
    /// ドロップアウト率
    #[config(default = 0.25)]
    pub dropout: f64,
    pub backbone: BackboneConfig,
    pub augmentation: AugmentationConfig,
}

impl ModelConfig {
    /// ランダム初期化のバックボーンでモデルを作成
    pub fn init<B: Backend>(&self, device: &B::Device) -> CatDogClassifier<B> {
        self.assemble(self.backbone.init(device), device)
    }

    /// 指定したファクトリのバックボーンでモデルを作成
    pub fn init_with<B: Backend, F: BackboneFactory<B>>(
        &self,
        factory: &F,
        device: &B::Device,
    ) -> error::Result<CatDogClassifier<B>> {
        let backbone = factory.build(device)?;
        Ok(self.assemble(backbone, device))
    }

    fn assemble<B: Backend>(&self, backbone: Backbone<B>, device: &B::Device) -> CatDogClassifier<B> {
        let channels = backbone.out_channels();
        tracing::debug!(
            "[Model] 入力: {}x{}, バックボーン層数: {}, 特徴次元: {}, 出力: {}",
            self.image_size,
            self.image_size,
            backbone.num_layers(),
            channels,
            self.num_outputs
        );
        CatDogClassifier {
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(channels, self.num_outputs).init(device),
        }
    }
}

/// 転移学習用の2クラス分類モデル
#[derive(Module, Debug)]
pub struct CatDogClassifier<B: Backend> {
    backbone: Backbone<B>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> CatDogClassifier<B> {
    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    /// 出力ユニット数
    pub fn num_outputs(&self) -> usize {
        let [_, units] = self.output.weight.dims();
        units
    }

    /// 順伝播（ロジット）
    ///
    /// # 引数
    /// - `images`: 0..255 の画素値 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - [batch_size, num_outputs]
    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(normalize_input(images));
        self.head(features)
    }

    /// 順伝播（確率）
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        to_probabilities(self.forward_logits(images))
    }

    /// 重みをバイト列に変換（model.bin）
    pub fn to_bytes(&self) -> error::Result<Vec<u8>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(
            &recorder,
            self.clone().into_record(),
            (),
        )
        .map_err(|e| ClassifierError::Training(format!("failed to record model weights: {:?}", e)))
    }

    /// 設定からモデルを組み立て、バイト列の重みを読み込む
    pub fn from_bytes(config: &ModelConfig, bytes: Vec<u8>, device: &B::Device) -> error::Result<Self> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::load(&recorder, bytes, device)
            .map_err(|e| ClassifierError::ModelUnavailable(format!("モデル重みの読み込みエラー: {:?}", e)))?;
        Ok(config.init::<B>(device).load_record(record))
    }

    fn head(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(features);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }
}

impl<B: AutodiffBackend> CatDogClassifier<B> {
    /// 学習用の順伝播
    ///
    /// 凍結された先頭の層は内側のバックエンドで実行するため勾配が流れません。
    /// バッチ正規化は学習対象の層でも移動平均の統計量を使います。
    pub fn forward_training(&self, images: Tensor<B, 4>, freeze: &LayerFreezeState) -> Tensor<B, 2> {
        let layers = self.backbone.num_layers();
        let cut = freeze.frozen_prefix().min(layers);
        let x = normalize_input(images);

        let x = if cut > 0 {
            let frozen = self.backbone.valid();
            Tensor::from_inner(frozen.forward_range(x.inner(), 0..cut))
        } else {
            x
        };

        let features = self.backbone.forward_range(x, cut..layers);
        self.head(features)
    }
}

/// 0..255 の画素値を [-1, 1] に変換
pub fn normalize_input<B: Backend, const D: usize>(pixels: Tensor<B, D>) -> Tensor<B, D> {
    pixels.div_scalar(PIXEL_SCALE).sub_scalar(1.0)
}

/// ホスト側の画素配列に同じ正規化を適用
pub fn normalize_pixels(pixels: &[f32]) -> Vec<f32> {
    pixels.iter().map(|p| p / PIXEL_SCALE - 1.0).collect()
}

/// ロジットを確率に変換（1ユニットはシグモイド、それ以外はソフトマックス）
pub fn to_probabilities<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 2> {
    let [_, units] = logits.dims();
    if units == 1 {
        sigmoid(logits)
    } else {
        softmax(logits, 1)
    }
}

/// ロジットから計算する二値交差エントロピー
///
/// max(z, 0) - z * y + log(1 + exp(-|z|))
pub fn binary_cross_entropy_with_logits<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let positive = logits.clone().clamp_min(0.0);
    let soft = logits.clone().abs().neg().exp().add_scalar(1.0).log();
    (positive - logits * targets + soft).mean()
}
