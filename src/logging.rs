//! ログ初期化
//!
//! `tracing` のサブスクライバを設定します。

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 表示する最小ログレベル
    pub level: Level,
    /// モジュールパスを表示するか
    pub include_target: bool,
    /// ANSIカラーを使うか
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// デバッグ用の詳細設定
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            include_target: true,
            ..Self::default()
        }
    }
}

/// グローバルサブスクライバを設定する
///
/// 既に設定済みの場合（テストなど）は何もしません。
pub fn init_logging(config: &LogConfig) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level)
        .with_target(config.include_target)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(config.ansi_colors)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
