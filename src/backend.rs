//! バックエンド定義
//!
//! 学習は `Autodiff<...>`、推論・評価は内側のバックエンドで実行します。

use burn::backend::{Autodiff, NdArray};
use burn_ndarray::NdArrayDevice;

use crate::model::DeviceType;

/// CPUバックエンド
pub type CpuBackend = NdArray<f32>;

/// CPU学習用バックエンド
pub type CpuTrainingBackend = Autodiff<CpuBackend>;

/// GPUバックエンド
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn::backend::Wgpu;

/// GPU学習用バックエンド
#[cfg(feature = "wgpu")]
pub type GpuTrainingBackend = Autodiff<GpuBackend>;

/// HTTPサーバーで使用する推論バックエンド
pub type ServingBackend = CpuBackend;

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

#[cfg(feature = "wgpu")]
pub fn gpu_device() -> burn_wgpu::WgpuDevice {
    burn_wgpu::WgpuDevice::default()
}

/// 実際に使用されるデバイス種別を決定する
///
/// `wgpu` フィーチャーが無効な場合、GPU指定はCPUにフォールバックします。
pub fn resolve_device_type(requested: &DeviceType) -> DeviceType {
    match requested {
        DeviceType::Cpu => DeviceType::Cpu,
        DeviceType::Wgpu => {
            if cfg!(feature = "wgpu") {
                DeviceType::Wgpu
            } else {
                tracing::warn!("wgpu feature is disabled; falling back to CPU (NdArray)");
                DeviceType::Cpu
            }
        }
    }
}
