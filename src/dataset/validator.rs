//! データセットの検証とクリーニング
//!
//! 対象拡張子の画像ファイルを走査し、0バイトまたはデコードできない
//! ファイルをその場で削除します。分割を計算する前に実行してください。

use std::fmt;
use std::path::{Path, PathBuf};

use image::ImageReader;
use walkdir::WalkDir;

use crate::error::{ClassifierError, Result};

/// 対応する画像拡張子
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

/// 拡張子が対応画像形式かどうか
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// ファイル単位の検証結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// デコード可能な画像
    Valid,
    /// 対象外の拡張子（変更しない）
    Skipped,
    /// 0バイト
    Empty,
    /// デコード失敗
    Corrupt(String),
}

impl FileOutcome {
    pub fn should_remove(&self) -> bool {
        matches!(self, FileOutcome::Empty | FileOutcome::Corrupt(_))
    }
}

/// 1ファイルを検証する（ファイルは変更しない）
pub fn inspect_file(path: &Path) -> FileOutcome {
    if !is_supported_image(path) {
        return FileOutcome::Skipped;
    }
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => return FileOutcome::Empty,
        Ok(_) => {}
        Err(e) => return FileOutcome::Corrupt(e.to_string()),
    }
    match decode_rgb(path) {
        Ok(()) => FileOutcome::Valid,
        Err(reason) => FileOutcome::Corrupt(reason),
    }
}

fn decode_rgb(path: &Path) -> std::result::Result<(), String> {
    let reader = ImageReader::open(path)
        .map_err(|e| e.to_string())?
        .with_guessed_format()
        .map_err(|e| e.to_string())?;
    let image = reader.decode().map_err(|e| e.to_string())?;
    // 3チャネルに変換できることを確認
    let _ = image.to_rgb8();
    Ok(())
}

/// 検証結果の集計
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub scanned: usize,
    pub valid: usize,
    pub skipped: usize,
    pub empty_removed: usize,
    pub corrupt_removed: usize,
    /// 削除に失敗したファイル
    pub failed_deletions: Vec<PathBuf>,
}

impl ValidationReport {
    /// 削除したファイル数
    pub fn removed(&self) -> usize {
        self.empty_removed + self.corrupt_removed
    }

    fn record(&mut self, path: &Path, outcome: &FileOutcome) {
        self.scanned += 1;
        match outcome {
            FileOutcome::Valid => self.valid += 1,
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Empty | FileOutcome::Corrupt(_) => match std::fs::remove_file(path) {
                Ok(()) => {
                    if *outcome == FileOutcome::Empty {
                        self.empty_removed += 1;
                    } else {
                        self.corrupt_removed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("削除に失敗しました {}: {}", path.display(), e);
                    self.failed_deletions.push(path.to_path_buf());
                }
            },
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "走査: {} ファイル", self.scanned)?;
        writeln!(f, "有効: {}", self.valid)?;
        writeln!(f, "対象外: {}", self.skipped)?;
        write!(
            f,
            "削除: {} (空 {}, 破損 {})",
            self.removed(),
            self.empty_removed,
            self.corrupt_removed
        )?;
        if !self.failed_deletions.is_empty() {
            write!(f, "\n削除に失敗: {}", self.failed_deletions.len())?;
            for path in &self.failed_deletions {
                write!(f, "\n  {}", path.display())?;
            }
        }
        Ok(())
    }
}

/// ディレクトリを再帰的に走査し、壊れた画像を削除する
pub fn validate_and_clean(root: &Path) -> Result<ValidationReport> {
    if !root.is_dir() {
        return Err(ClassifierError::empty_dataset(root, "directory does not exist"));
    }

    let mut report = ValidationReport::default();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("走査できないエントリをスキップ: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let outcome = inspect_file(path);
        match &outcome {
            FileOutcome::Empty => tracing::info!("0バイトのファイルを削除: {}", path.display()),
            FileOutcome::Corrupt(reason) => {
                tracing::info!("破損した画像を削除: {} ({})", path.display(), reason)
            }
            FileOutcome::Skipped => tracing::debug!("対象外のファイル: {}", path.display()),
            FileOutcome::Valid => {}
        }
        report.record(path, &outcome);
    }

    tracing::info!(
        "検証完了: {} ファイル中 {} 件を削除 (有効 {}, 対象外 {})",
        report.scanned,
        report.removed(),
        report.valid,
        report.skipped
    );
    Ok(report)
}
