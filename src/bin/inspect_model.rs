//! モデルファイルのメタデータ確認用バイナリ

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use pet_classifier_lib::dataset::LabeledImageSet;
use pet_classifier_lib::logging::{init_logging, LogConfig};
use pet_classifier_lib::model::{artifact_path, load_metadata, print_metadata_info};

#[derive(Parser, Debug)]
#[command(name = "inspect_model", about = "Print the metadata stored in a model artifact")]
struct Cli {
    /// モデルファイル
    #[arg(default_value = "cat_dog_model.tar.gz")]
    model_path: PathBuf,

    /// クラス対応表をこのデータセットのディレクトリ構成と照合
    #[arg(long)]
    verify_dataset: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LogConfig::default());

    let model_path = artifact_path(&cli.model_path);
    let metadata = load_metadata(&model_path)
        .with_context(|| format!("failed to read metadata from {}", model_path.display()))?;
    print_metadata_info(&metadata);

    if let Some(data_dir) = cli.verify_dataset {
        let set = LabeledImageSet::scan(&data_dir)
            .with_context(|| format!("failed to scan {}", data_dir.display()))?;
        match metadata.class_mapping.verify_against(set.mapping()) {
            Ok(()) => println!("✓ クラス対応表はデータセットと一致しています"),
            Err(e) => {
                eprintln!("✗ {}", e);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
