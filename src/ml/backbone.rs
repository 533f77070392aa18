//! MobileNetV2系の特徴抽出バックボーン
//!
//! 層（ステム、逆残差ブロック17個、1x1ヘッド畳み込み）を `Vec` で保持し、
//! 層インデックス単位で凍結できるように `forward_range` を提供します。

use std::ops::Range;
use std::path::PathBuf;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};

use crate::error::{self, ClassifierError};

/// 逆残差ブロックの構成 (拡張率 t, 出力チャネル c, 繰り返し n, ストライド s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;

/// バックボーンの層数（ステム + 17ブロック + ヘッド）
pub const BACKBONE_LAYERS: usize = 19;

/// バックボーン設定
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// チャネル幅の係数
    #[config(default = 1.0)]
    pub width_multiplier: f64,
}

/// チャネル数を8の倍数に丸める（10%以上小さくならないように調整）
fn make_divisible(value: f64, divisor: usize) -> usize {
    let divisor_f = divisor as f64;
    let rounded = ((value + divisor_f / 2.0) / divisor_f).floor() as usize * divisor;
    let rounded = rounded.max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded + divisor
    } else {
        rounded
    }
}

impl BackboneConfig {
    fn scaled(&self, channels: usize) -> usize {
        make_divisible(channels as f64 * self.width_multiplier, 8)
    }

    /// 最終特徴マップのチャネル数
    pub fn out_channels(&self) -> usize {
        if self.width_multiplier > 1.0 {
            self.scaled(HEAD_CHANNELS)
        } else {
            HEAD_CHANNELS
        }
    }

    /// ランダム初期化されたバックボーンを作成
    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let mut layers = Vec::with_capacity(BACKBONE_LAYERS);

        let stem_channels = self.scaled(STEM_CHANNELS);
        layers.push(BackboneLayer {
            expand: None,
            conv: ConvBn::new(3, stem_channels, 3, 2, 1, true, device),
            project: None,
            residual: false,
        });

        let mut in_channels = stem_channels;
        for (expansion, channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS {
            let out_channels = self.scaled(channels);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                layers.push(BackboneLayer::inverted_residual(
                    in_channels,
                    out_channels,
                    stride,
                    expansion,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        layers.push(BackboneLayer {
            expand: None,
            conv: ConvBn::pointwise(in_channels, self.out_channels(), true, device),
            project: None,
            residual: false,
        });

        Backbone {
            layers,
            out_channels: self.out_channels(),
        }
    }
}

/// 畳み込み + バッチ正規化 + 任意の ReLU6
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
    activate: bool,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        activate: bool,
        device: &B::Device,
    ) -> Self {
        let padding = kernel / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        Self {
            conv,
            norm: BatchNormConfig::new(out_channels).init(device),
            activate,
        }
    }

    fn pointwise(in_channels: usize, out_channels: usize, activate: bool, device: &B::Device) -> Self {
        Self::new(in_channels, out_channels, 1, 1, 1, activate, device)
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.normalize(x);
        if self.activate {
            // ReLU6
            x.clamp(0.0, 6.0)
        } else {
            x
        }
    }
}

impl<B: Backend> ConvBn<B> {
    /// 移動平均の統計量で正規化する
    ///
    /// `BatchNorm::forward` は自動微分バックエンドでバッチ統計を使い移動平均を更新するため、
    /// 学習中もバックボーンは常に推論モードの正規化を行います。gamma と beta は学習対象のままです。
    fn normalize(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [channels] = self.norm.gamma.val().dims();
        let shape = [1, channels, 1, 1];
        let mean = self.norm.running_mean.value().reshape(shape);
        let std = self
            .norm
            .running_var
            .value()
            .add_scalar(self.norm.epsilon)
            .sqrt()
            .reshape(shape);
        let gamma = self.norm.gamma.val().reshape(shape);
        let beta = self.norm.beta.val().reshape(shape);
        x.sub(mean).div(std).mul(gamma).add(beta)
    }
}

/// バックボーンの1層
///
/// 逆残差ブロックは expand (1x1) -> depthwise (3x3) -> project (1x1, 線形)。
/// ステムとヘッドは `conv` のみを使います。
#[derive(Module, Debug)]
pub struct BackboneLayer<B: Backend> {
    expand: Option<ConvBn<B>>,
    conv: ConvBn<B>,
    project: Option<ConvBn<B>>,
    residual: bool,
}

impl<B: Backend> BackboneLayer<B> {
    fn inverted_residual(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expansion: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expansion;
        let expand = if expansion == 1 {
            None
        } else {
            Some(ConvBn::pointwise(in_channels, hidden, true, device))
        };
        Self {
            expand,
            conv: ConvBn::new(hidden, hidden, 3, stride, hidden, true, device),
            project: Some(ConvBn::pointwise(hidden, out_channels, false, device)),
            residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.conv.forward(x);
        let x = match &self.project {
            Some(project) => project.forward(x),
            None => x,
        };
        if self.residual {
            x + input
        } else {
            x
        }
    }
}

/// 特徴抽出バックボーン
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    layers: Vec<BackboneLayer<B>>,
    out_channels: usize,
}

impl<B: Backend> Backbone<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// 全層の順伝播 [B, 3, H, W] -> [B, C, H/32, W/32]
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_range(input, 0..self.layers.len())
    }

    /// 指定範囲の層だけを順に適用
    pub fn forward_range(&self, input: Tensor<B, 4>, range: Range<usize>) -> Tensor<B, 4> {
        let end = range.end.min(self.layers.len());
        let start = range.start.min(end);
        self.layers[start..end]
            .iter()
            .fold(input, |x, layer| layer.forward(x))
    }
}

/// バックボーンの生成方法
pub trait BackboneFactory<B: Backend> {
    fn build(&self, device: &B::Device) -> error::Result<Backbone<B>>;
}

impl<B: Backend> BackboneFactory<B> for BackboneConfig {
    fn build(&self, device: &B::Device) -> error::Result<Backbone<B>> {
        Ok(self.init(device))
    }
}

/// 事前学習済み重み（burnのNamedMpkレコード）を読み込むファクトリ
#[derive(Debug, Clone)]
pub struct PretrainedBackbone {
    pub config: BackboneConfig,
    pub weights: PathBuf,
}

impl<B: Backend> BackboneFactory<B> for PretrainedBackbone {
    fn build(&self, device: &B::Device) -> error::Result<Backbone<B>> {
        tracing::info!("事前学習済みバックボーンを読み込み: {}", self.weights.display());
        self.config
            .init::<B>(device)
            .load_file(
                self.weights.clone(),
                &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                device,
            )
            .map_err(|e| {
                ClassifierError::ModelUnavailable(format!(
                    "failed to load backbone weights from {}: {e}",
                    self.weights.display()
                ))
            })
    }
}
