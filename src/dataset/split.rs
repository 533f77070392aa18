//! データセットのスキャンと学習/検証/テストへの分割
//!
//! ルート直下にクラスごとのサブディレクトリが2つある構成を前提とします。
//! クラスインデックスはディレクトリ名のソート順で決まります。

use std::fmt;
use std::path::{Path, PathBuf};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use walkdir::WalkDir;

use crate::dataset::validator::is_supported_image;
use crate::error::{ClassifierError, Result};
use crate::model::{ClassMapping, DatasetSettings};

/// 画像パスとクラスインデックス
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// クラス別ディレクトリに格納された画像集合
#[derive(Debug, Clone)]
pub struct LabeledImageSet {
    root: PathBuf,
    mapping: ClassMapping,
    samples: Vec<Sample>,
}

impl LabeledImageSet {
    /// ディレクトリをスキャンする
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(ClassifierError::empty_dataset(root, "directory does not exist"));
        }

        let mut class_names = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            class_names.push(name);
        }
        class_names.sort();
        if class_names.len() != 2 {
            return Err(ClassifierError::ClassLayout {
                path: root.to_path_buf(),
                found: class_names,
            });
        }
        let mapping = ClassMapping::from_directory_names(class_names)?;

        let mut samples = Vec::new();
        for (label, name) in mapping.names().iter().enumerate() {
            let class_dir = root.join(name);
            let before = samples.len();
            for entry in WalkDir::new(&class_dir).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!("走査できないエントリをスキップ: {}", e);
                        continue;
                    }
                };
                if entry.file_type().is_file() && is_supported_image(entry.path()) {
                    samples.push(Sample {
                        path: entry.into_path(),
                        label,
                    });
                }
            }
            let count = samples.len() - before;
            if count == 0 {
                tracing::warn!("クラス '{}' に画像がありません", name);
            }
            tracing::info!("クラス {} = '{}': {} 枚", label, name, count);
        }

        if samples.is_empty() {
            return Err(ClassifierError::empty_dataset(root, "no usable images found"));
        }

        Ok(Self {
            root: root.to_path_buf(),
            mapping,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mapping(&self) -> &ClassMapping {
        &self.mapping
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// クラスごとの枚数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.mapping.len()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }
}

/// 分割設定
#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub batch_size: usize,
    pub seed: u64,
    pub holdout_fraction: f64,
    pub shuffle_buffer: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            seed: 123,
            holdout_fraction: 0.2,
            shuffle_buffer: 2000,
        }
    }
}

impl From<&DatasetSettings> for SplitConfig {
    fn from(settings: &DatasetSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            seed: settings.seed,
            holdout_fraction: settings.holdout_fraction,
            shuffle_buffer: settings.shuffle_buffer,
        }
    }
}

/// 分割の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    Train,
    Validation,
    Test,
}

impl fmt::Display for SplitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitKind::Train => write!(f, "train"),
            SplitKind::Validation => write!(f, "validation"),
            SplitKind::Test => write!(f, "test"),
        }
    }
}

/// 1つの分割
#[derive(Debug, Clone)]
pub struct Split {
    kind: SplitKind,
    samples: Vec<Sample>,
    batch_size: usize,
    shuffle_buffer: usize,
    seed: u64,
}

impl Split {
    pub fn kind(&self) -> SplitKind {
        self.kind
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// エポックごとのサンプル順
    ///
    /// 学習データのみ `seed + epoch` で有限バッファシャッフルし、
    /// 検証・テストは常に同じ順序を返す。
    pub fn epoch_order(&self, epoch: usize) -> Vec<Sample> {
        match self.kind {
            SplitKind::Train => {
                let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
                shuffle_buffered(&self.samples, self.shuffle_buffer, &mut rng)
            }
            SplitKind::Validation | SplitKind::Test => self.samples.clone(),
        }
    }
}

/// 有限バッファによるシャッフル
///
/// 先頭 `buffer_size` 件でバッファを満たし、バッファからランダムに1件取り出すたびに
/// 次の要素で補充します。
pub fn shuffle_buffered<T: Clone, R: Rng>(items: &[T], buffer_size: usize, rng: &mut R) -> Vec<T> {
    let mut rest = items.iter().cloned();
    let mut buffer: Vec<T> = rest.by_ref().take(buffer_size.max(1)).collect();
    let mut out = Vec::with_capacity(items.len());
    while !buffer.is_empty() {
        let i = rng.gen_range(0..buffer.len());
        match rest.next() {
            Some(next) => out.push(std::mem::replace(&mut buffer[i], next)),
            None => out.push(buffer.swap_remove(i)),
        }
    }
    out
}

/// 学習・検証・テストの3分割
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: Split,
    pub validation: Split,
    pub test: Split,
}

impl DatasetSplits {
    /// シード付きで分割する
    ///
    /// 全体を一度シャッフルし、末尾 floor(N * holdout) 件を残りとする。
    /// 残りのバッチ数の floor(n/2) を検証、それ以外をテストに割り当てる。
    pub fn from_image_set(set: &LabeledImageSet, config: &SplitConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(ClassifierError::Config("batch_size must be > 0".into()));
        }
        if !(config.holdout_fraction > 0.0 && config.holdout_fraction < 1.0) {
            return Err(ClassifierError::Config(format!(
                "holdout_fraction must be in (0, 1), got {}",
                config.holdout_fraction
            )));
        }
        let mut samples = set.samples().to_vec();
        let mut rng = StdRng::seed_from_u64(config.seed);
        samples.shuffle(&mut rng);

        let total = samples.len();
        let holdout = (total as f64 * config.holdout_fraction).floor() as usize;
        let train_len = total - holdout.min(total);
        let remainder_batches = holdout.div_ceil(config.batch_size);
        let validation_batches = remainder_batches / 2;
        let validation_len = (validation_batches * config.batch_size).min(holdout);

        let test = samples.split_off(train_len + validation_len);
        let validation = samples.split_off(train_len);
        let train = samples;

        if train.is_empty() {
            return Err(ClassifierError::empty_dataset(set.root(), "training split is empty"));
        }
        if validation.is_empty() {
            return Err(ClassifierError::empty_dataset(
                set.root(),
                format!(
                    "validation split is empty ({} images, holdout {})",
                    total, holdout
                ),
            ));
        }
        if test.is_empty() {
            tracing::warn!("テスト分割が空です（{} 枚）", total);
        }

        tracing::info!(
            "分割: train={} validation={} test={} (seed={}, batch={})",
            train.len(),
            validation.len(),
            test.len(),
            config.seed,
            config.batch_size
        );

        let make = |kind, samples| Split {
            kind,
            samples,
            batch_size: config.batch_size,
            shuffle_buffer: config.shuffle_buffer,
            seed: config.seed,
        };
        Ok(Self {
            train: make(SplitKind::Train, train),
            validation: make(SplitKind::Validation, validation),
            test: make(SplitKind::Test, test),
        })
    }
}
