//! 画像の読み込みとバッチ化
//!
//! `BatchStream` はワーカースレッドで画像のデコード・リサイズ・拡張を行い、
//! 有界チャネルで数バッチ先まで先読みします。テンソルへの変換は
//! `ImageBatcher` が呼び出し側のスレッドで行います。

use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::thread;

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Tensor},
};
use image::{imageops::FilterType, DynamicImage, ImageReader};
use rand::{rngs::StdRng, SeedableRng};

use crate::dataset::split::Sample;
use crate::error::{ClassifierError, Result};
use crate::ml::augmentation::{augment, AugmentationConfig};

/// ホスト側の1サンプル（CHW, 0..255）
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub pixels: Vec<f32>,
    pub label: f32,
}

/// テンソル化されたバッチ
#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// [batch_size, 1]（0.0 / 1.0）
    pub targets: Tensor<B, 2>,
}

/// `ImageItem` をまとめてテンソルにする
#[derive(Debug, Clone)]
pub struct ImageBatcher {
    image_size: usize,
}

impl ImageBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut labels = Vec::with_capacity(batch_size);
        for item in items {
            pixels.extend_from_slice(&item.pixels);
            labels.push(item.label);
        }

        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1>::from_floats(labels.as_slice(), device)
            .reshape([batch_size, 1]);

        ImageBatch { images, targets }
    }
}

/// デコード済み画像を RGB・正方形にリサイズし CHW の画素配列にする
///
/// 縦横比は保持しません。値は 0..255 のまま。
pub fn image_to_pixels(image: &DynamicImage, size: usize) -> Vec<f32> {
    let rgb = image.to_rgb8();
    let resized = image::imageops::resize(&rgb, size as u32, size as u32, FilterType::Triangle);

    let mut data = Vec::with_capacity(3 * size * size);
    for channel in 0..3 {
        for y in 0..size as u32 {
            for x in 0..size as u32 {
                data.push(resized.get_pixel(x, y)[channel] as f32);
            }
        }
    }
    data
}

/// 画像ファイルを読み込む
pub fn load_image_pixels(path: &Path, size: usize) -> Result<Vec<f32>> {
    let image = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| ClassifierError::ImageDecode(format!("{}: {}", path.display(), e)))?;
    Ok(image_to_pixels(&image, size))
}

/// メモリ上の画像バイト列を読み込む（形式は自動判定）
pub fn decode_image_bytes(bytes: &[u8], size: usize) -> Result<Vec<f32>> {
    let image =
        image::load_from_memory(bytes).map_err(|e| ClassifierError::ImageDecode(e.to_string()))?;
    Ok(image_to_pixels(&image, size))
}

/// バッチ列の設定
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub batch_size: usize,
    pub image_size: usize,
    /// 先読みするバッチ数
    pub prefetch: usize,
    /// 学習時のみ指定
    pub augmentation: Option<AugmentationConfig>,
    /// 拡張用乱数のシード
    pub seed: u64,
}

/// 先読み付きの遅延バッチ列
///
/// 読み込めない画像は警告を出してスキップします。
pub struct BatchStream {
    receiver: Receiver<Vec<ImageItem>>,
}

impl BatchStream {
    pub fn spawn(samples: Vec<Sample>, options: StreamOptions) -> Self {
        let (sender, receiver) = mpsc::sync_channel(options.prefetch.max(1));
        let batch_size = options.batch_size.max(1);

        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(options.seed);
            for chunk in samples.chunks(batch_size) {
                let mut items = Vec::with_capacity(chunk.len());
                for sample in chunk {
                    match load_image_pixels(&sample.path, options.image_size) {
                        Ok(pixels) => {
                            let pixels = match &options.augmentation {
                                Some(config) => augment(&pixels, options.image_size, config, &mut rng),
                                None => pixels,
                            };
                            items.push(ImageItem {
                                pixels,
                                label: sample.label as f32,
                            });
                        }
                        Err(e) => tracing::warn!("画像を読み込めないためスキップ: {}", e),
                    }
                }
                if items.is_empty() {
                    continue;
                }
                // 受信側が破棄されたら終了
                if sender.send(items).is_err() {
                    break;
                }
            }
        });

        Self { receiver }
    }

    /// バッチをテンソルに変換しながら列挙する
    pub fn tensors<'a, B: Backend>(
        self,
        batcher: &'a ImageBatcher,
        device: &'a B::Device,
    ) -> impl Iterator<Item = ImageBatch<B>> + 'a {
        self.map(move |items| {
            <ImageBatcher as Batcher<B, ImageItem, ImageBatch<B>>>::batch(batcher, items, device)
        })
    }
}

impl Iterator for BatchStream {
    type Item = Vec<ImageItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::write_class_images;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_load_image_resizes_to_square() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        RgbImage::from_pixel(20, 10, Rgb([255, 0, 128])).save(&path).unwrap();

        let pixels = load_image_pixels(&path, 8).unwrap();
        assert_eq!(pixels.len(), 3 * 8 * 8);
        assert!((pixels[0] - 255.0).abs() <= 1.0);
        assert!(pixels[64].abs() <= 1.0);
        assert!((pixels[128] - 128.0).abs() <= 1.0);
    }

    #[test]
    fn test_decode_bytes_rejects_garbage() {
        let result = decode_image_bytes(b"definitely not an image", 8);
        assert!(matches!(result, Err(ClassifierError::ImageDecode(_))));
    }

    #[test]
    fn test_batcher_shapes() {
        let device = Default::default();
        let batcher = ImageBatcher::new(4);
        let items = vec![
            ImageItem {
                pixels: vec![1.0; 48],
                label: 0.0,
            },
            ImageItem {
                pixels: vec![2.0; 48],
                label: 1.0,
            },
        ];
        let batch =
            <ImageBatcher as Batcher<TestBackend, ImageItem, ImageBatch<TestBackend>>>::batch(
                &batcher, items, &device,
            );
        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        assert_eq!(batch.targets.dims(), [2, 1]);
        assert_eq!(batch.targets.into_data().to_vec::<f32>().unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_stream_batches_and_skips_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_class_images(dir.path(), "cats", 5, [10, 10, 10]);
        let broken = dir.path().join("cats").join("broken.png");
        std::fs::write(&broken, b"broken").unwrap();

        let mut samples: Vec<Sample> = paths
            .into_iter()
            .map(|path| Sample { path, label: 1 })
            .collect();
        samples.push(Sample {
            path: broken,
            label: 0,
        });

        let options = StreamOptions {
            batch_size: 2,
            image_size: 8,
            prefetch: 1,
            augmentation: Some(AugmentationConfig::new()),
            seed: 3,
        };
        let batches: Vec<Vec<ImageItem>> = BatchStream::spawn(samples, options).collect();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(batches
            .iter()
            .flatten()
            .all(|item| item.label == 1.0 && item.pixels.len() == 3 * 8 * 8));
    }

    #[test]
    fn test_stream_to_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_class_images(dir.path(), "dogs", 3, [50, 60, 70]);
        let samples = paths
            .into_iter()
            .map(|path| Sample { path, label: 0 })
            .collect();
        let options = StreamOptions {
            batch_size: 2,
            image_size: 6,
            prefetch: 2,
            augmentation: None,
            seed: 0,
        };
        let device = Default::default();
        let batcher = ImageBatcher::new(6);
        let batches: Vec<ImageBatch<TestBackend>> = BatchStream::spawn(samples, options)
            .tensors(&batcher, &device)
            .collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].images.dims(), [2, 3, 6, 6]);
        assert_eq!(batches[1].images.dims(), [1, 3, 6, 6]);
    }
}
