//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス対応表、モデル設定、学習の要約）
//! - model.bin       - モデルの重み（バイナリ）
//! - optimizer.bin   - オプティマイザの状態（バイナリ、任意）

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{ClassifierError, Result};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";
const OPTIMIZER_ENTRY: &str = "optimizer.bin";

/// 読み込んだモデルファイルの中身
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub metadata: ModelMetadata,
    pub model: Vec<u8>,
    pub optimizer: Option<Vec<u8>>,
}

/// 保存先のパスを正規化（.gz で終わらなければ .tar.gz を付ける）
pub fn artifact_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;
    Ok(())
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 一時ファイルに書き込んでからリネームするため、途中で失敗しても
/// 既存のモデルファイルは壊れません。保存先のパスを返します。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
    optimizer_binary: Option<&[u8]>,
) -> Result<PathBuf> {
    let tar_gz_path = artifact_path(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file_name = tar_gz_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "model.tar.gz".to_string());
    let temp_path = tar_gz_path.with_file_name(format!(".{}.tmp", file_name));

    let write = || -> Result<()> {
        let encoder = GzEncoder::new(File::create(&temp_path)?, Compression::default());
        let mut tar_builder = Builder::new(encoder);

        let json_str = metadata.to_json_string()?;
        append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
        append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;
        if let Some(optimizer) = optimizer_binary {
            append_entry(&mut tar_builder, OPTIMIZER_ENTRY, optimizer)?;
        }

        let encoder = tar_builder.into_inner()?;
        encoder.finish()?.sync_all()?;
        Ok(())
    };

    if let Err(e) = write() {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }
    std::fs::rename(&temp_path, &tar_gz_path)?;

    tracing::debug!("モデルを保存しました: {}", tar_gz_path.display());
    Ok(tar_gz_path)
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let file = File::open(tar_gz_path).map_err(|e| {
        ClassifierError::ModelUnavailable(format!(
            "cannot open model file {}: {}",
            tar_gz_path.display(),
            e
        ))
    })?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn corrupt(tar_gz_path: &Path, e: impl std::fmt::Display) -> ClassifierError {
    ClassifierError::ModelUnavailable(format!(
        "model file {} is not a valid archive: {}",
        tar_gz_path.display(),
        e
    ))
}

/// モデルファイルの全エントリを読み込む
pub fn load_artifact(tar_gz_path: &Path) -> Result<ModelArtifact> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;
    let mut optimizer_opt: Option<Vec<u8>> = None;

    for entry in archive.entries().map_err(|e| corrupt(tar_gz_path, e))? {
        let mut entry = entry.map_err(|e| corrupt(tar_gz_path, e))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(tar_gz_path, e))?
            .to_string_lossy()
            .to_string();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry
                    .read_to_string(&mut json_str)
                    .map_err(|e| corrupt(tar_gz_path, e))?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry
                    .read_to_end(&mut buffer)
                    .map_err(|e| corrupt(tar_gz_path, e))?;
                model_binary_opt = Some(buffer);
            }
            OPTIMIZER_ENTRY => {
                let mut buffer = Vec::new();
                entry
                    .read_to_end(&mut buffer)
                    .map_err(|e| corrupt(tar_gz_path, e))?;
                optimizer_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(model)) => Ok(ModelArtifact {
            metadata,
            model,
            optimizer: optimizer_opt,
        }),
        (None, _) => Err(corrupt(tar_gz_path, "metadata.json not found")),
        (_, None) => Err(corrupt(tar_gz_path, "model.bin not found")),
    }
}

/// Tar.gzからモデルメタデータだけを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut archive = open_archive(tar_gz_path)?;
    for entry in archive.entries().map_err(|e| corrupt(tar_gz_path, e))? {
        let mut entry = entry.map_err(|e| corrupt(tar_gz_path, e))?;
        let is_metadata = entry
            .path()
            .map(|p| p.to_str() == Some(METADATA_ENTRY))
            .unwrap_or(false);
        if is_metadata {
            let mut json_str = String::new();
            entry
                .read_to_string(&mut json_str)
                .map_err(|e| corrupt(tar_gz_path, e))?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }
    Err(corrupt(tar_gz_path, "metadata.json not found"))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("フォーマット: v{}", metadata.format_version);
    println!(
        "クラス対応表 (v{}): {}",
        metadata.class_mapping.version(),
        metadata
            .class_mapping
            .names()
            .iter()
            .enumerate()
            .map(|(i, n)| format!("{}={}", i, n))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "モデル入力サイズ: {}x{} (画素範囲 {}..{})",
        metadata.model_config.image_size,
        metadata.model_config.image_size,
        metadata.input_pixel_range[0],
        metadata.input_pixel_range[1]
    );
    println!(
        "出力ユニット数: {}, ドロップアウト率: {}, 幅係数: {}",
        metadata.model_config.num_outputs,
        metadata.model_config.dropout,
        metadata.model_config.backbone.width_multiplier
    );
    println!("凍結層数 (fine_tune_at): {}", metadata.fine_tune_at);
    if let Some(training) = &metadata.training {
        println!(
            "学習データ: train={} validation={} test={} (seed={})",
            training.train_samples,
            training.validation_samples,
            training.test_samples,
            training.seed
        );
        for stage in &training.stages {
            println!(
                "  段階 {}: {} エポック, lr={}, 最良 val_loss={}, 早期終了={}",
                stage.stage,
                stage.epochs_run,
                stage.learning_rate,
                stage
                    .best_val_loss
                    .map(|l| format!("{:.4}", l))
                    .unwrap_or_else(|| "-".into()),
                stage.early_stopped
            );
        }
        println!("最終保存の方針: {:?}", training.final_save);
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}
