//! エラー定義
//!
//! ライブラリ全体で使用するエラー型。ファイル単位の検証結果は
//! エラーではなく `dataset::FileOutcome` として扱います。

use std::path::PathBuf;

use thiserror::Error;

/// 分類器ライブラリのエラー
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// データセットが存在しない、または使用可能な画像が残っていない
    #[error("Empty dataset at '{path}': {reason}")]
    EmptyDataset { path: PathBuf, reason: String },

    /// データセット直下のクラスディレクトリ構成が不正
    #[error("Expected exactly 2 class directories in '{path}', found {found:?}")]
    ClassLayout { path: PathBuf, found: Vec<String> },

    /// 画像のデコードに失敗
    #[error("Failed to decode image: {0}")]
    ImageDecode(String),

    /// アップロードされたファイルが画像ではない
    #[error("Unsupported content type: {0}")]
    UnsupportedContent(String),

    /// モデルが読み込まれていない、またはモデルファイルが読めない
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// クラスマッピングの不整合
    #[error("Class mapping mismatch: {0}")]
    ClassMapping(String),

    /// 設定値が不正
    #[error("Configuration error: {0}")]
    Config(String),

    /// 学習処理のエラー
    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// エラーの分類（境界層でのステータス決定用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// リクエスト単位の失敗（不正な入力）
    Request,
    /// サービス単位の失敗（モデル未ロードなど）
    Service,
    /// 内部エラー
    Internal,
}

impl ClassifierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClassifierError::ImageDecode(_) | ClassifierError::UnsupportedContent(_) => {
                ErrorKind::Request
            }
            ClassifierError::ModelUnavailable(_) => ErrorKind::Service,
            _ => ErrorKind::Internal,
        }
    }

    pub(crate) fn empty_dataset(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ClassifierError::EmptyDataset {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClassifierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ClassifierError::ImageDecode("bad".into()).kind(),
            ErrorKind::Request
        );
        assert_eq!(
            ClassifierError::UnsupportedContent("text/plain".into()).kind(),
            ErrorKind::Request
        );
        assert_eq!(
            ClassifierError::ModelUnavailable("not loaded".into()).kind(),
            ErrorKind::Service
        );
        assert_eq!(
            ClassifierError::empty_dataset("data", "missing").kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_empty_dataset_message_names_path() {
        let err = ClassifierError::empty_dataset("data/train", "directory does not exist");
        let msg = err.to_string();
        assert!(msg.contains("data/train"));
        assert!(msg.contains("directory does not exist"));
    }
}
