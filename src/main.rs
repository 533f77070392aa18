//! 犬猫分類器のコマンドラインツール
#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, Subcommand};

use pet_classifier_lib::backend::{cpu_device, resolve_device_type, CpuBackend, CpuTrainingBackend};
use pet_classifier_lib::dataset::{validate_and_clean, DatasetSplits, LabeledImageSet, SplitConfig};
use pet_classifier_lib::logging::{init_logging, LogConfig};
use pet_classifier_lib::ml::{
    evaluate, model_config_from, train, BackboneConfig, CatDogClassifier, DualPathPredictor,
    EvaluationReport, InferenceEngine, PreprocessMode, PretrainedBackbone, TrainingOptions,
};
use pet_classifier_lib::model::{artifact_path, load_artifact, AppConfig, ClassMapping, DeviceType};
use pet_classifier_lib::server::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "pet_classifier", version, about = "Cat vs dog image classifier")]
struct Cli {
    /// 設定ファイル（省略時は config.json）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// DEBUGレベルのログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 壊れた画像・空ファイルをデータセットから削除
    Validate {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// 2段階の転移学習を実行
    Train {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        model_path: Option<PathBuf>,
        #[arg(long)]
        head_epochs: Option<usize>,
        #[arg(long)]
        fine_tune_epochs: Option<usize>,
        /// GPUを使わずCPUで学習
        #[arg(long)]
        cpu: bool,
        /// データセットの検証（ファイル削除）を省略
        #[arg(long)]
        skip_validation: bool,
        #[arg(long)]
        no_progress: bool,
    },
    /// テスト分割でモデルを評価
    Evaluate {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        model_path: Option<PathBuf>,
        /// 混同行列のCSV出力先
        #[arg(long)]
        confusion_csv: Option<PathBuf>,
    },
    /// 1枚の画像を分類（raw / normalized の2系統）
    Predict {
        image: PathBuf,
        #[arg(long)]
        model_path: Option<PathBuf>,
        #[arg(long, default_value = "auto")]
        mode: PreprocessMode,
        #[arg(long)]
        class0: Option<String>,
        #[arg(long)]
        class1: Option<String>,
        #[arg(long)]
        swap_classes: bool,
    },
    /// 推論APIサーバーを起動
    Serve {
        #[arg(long)]
        model_path: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// デフォルト設定ファイルを書き出す
    InitConfig {
        /// 既存のファイルを上書き
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    });

    if let Command::InitConfig { force } = &cli.command {
        return init_config(cli.config.as_deref(), *force);
    }

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_or_default_from(path),
        None => AppConfig::load_or_default(),
    };
    match cli.command {
        Command::Validate { data_dir } => {
            if let Some(dir) = data_dir {
                config.dataset.data_dir = dir.to_string_lossy().to_string();
            }
            run_validate(&config)
        }
        Command::Train {
            data_dir,
            model_path,
            head_epochs,
            fine_tune_epochs,
            cpu,
            skip_validation,
            no_progress,
        } => {
            if let Some(dir) = data_dir {
                config.dataset.data_dir = dir.to_string_lossy().to_string();
            }
            if let Some(path) = model_path {
                config.model.model_path = path.to_string_lossy().to_string();
            }
            if let Some(epochs) = head_epochs {
                config.training.head_epochs = epochs;
            }
            if let Some(epochs) = fine_tune_epochs {
                config.training.fine_tune_epochs = epochs;
            }
            if cpu {
                config.device_type = DeviceType::Cpu;
            }
            config.validate().context("invalid configuration")?;
            run_train(&config, skip_validation, !no_progress)
        }
        Command::Evaluate {
            data_dir,
            model_path,
            confusion_csv,
        } => {
            if let Some(dir) = data_dir {
                config.dataset.data_dir = dir.to_string_lossy().to_string();
            }
            if let Some(path) = model_path {
                config.model.model_path = path.to_string_lossy().to_string();
            }
            config.validate().context("invalid configuration")?;
            run_evaluate(&config, confusion_csv)
        }
        Command::Predict {
            image,
            model_path,
            mode,
            class0,
            class1,
            swap_classes,
        } => {
            let model_path = model_path.unwrap_or_else(|| PathBuf::from(&config.model.model_path));
            run_predict(&model_path, &image, mode, class0, class1, swap_classes)
        }
        Command::Serve {
            model_path,
            host,
            port,
        } => {
            if let Some(path) = model_path {
                config.model.model_path = path.to_string_lossy().to_string();
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate().context("invalid configuration")?;
            run_serve(&config)
        }
        Command::InitConfig { .. } => Ok(()),
    }
}

fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let target = path.map(Path::to_path_buf).unwrap_or_else(AppConfig::default_path);
    if target.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            target.display()
        );
    }
    let config = AppConfig::default();
    match path {
        Some(path) => config.save(path),
        None => config.save_default(),
    }
    .with_context(|| format!("failed to write {}", target.display()))?;
    println!("デフォルト設定を書き出しました: {}", target.display());
    Ok(())
}

fn run_validate(config: &AppConfig) -> Result<()> {
    let data_dir = PathBuf::from(&config.dataset.data_dir);
    let report = validate_and_clean(&data_dir)
        .with_context(|| format!("failed to validate {}", data_dir.display()))?;
    println!("\n=== データセット検証 ===");
    println!("{}", report);
    Ok(())
}

fn load_splits(config: &AppConfig) -> Result<(LabeledImageSet, DatasetSplits)> {
    let data_dir = PathBuf::from(&config.dataset.data_dir);
    let set = LabeledImageSet::scan(&data_dir)
        .with_context(|| format!("failed to scan dataset {}", data_dir.display()))?;
    let splits = DatasetSplits::from_image_set(&set, &SplitConfig::from(&config.dataset))
        .context("failed to split dataset")?;
    Ok((set, splits))
}

fn run_train(config: &AppConfig, skip_validation: bool, show_progress: bool) -> Result<()> {
    config.display();

    if !skip_validation {
        run_validate(config)?;
    }
    let (set, splits) = load_splits(config)?;

    match resolve_device_type(&config.device_type) {
        DeviceType::Cpu => {
            train_on::<CpuTrainingBackend>(config, &set, &splits, show_progress, &cpu_device())
        }
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => train_on::<pet_classifier_lib::backend::GpuTrainingBackend>(
            config,
            &set,
            &splits,
            show_progress,
            &pet_classifier_lib::backend::gpu_device(),
        ),
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            train_on::<CpuTrainingBackend>(config, &set, &splits, show_progress, &cpu_device())
        }
    }
}

fn train_on<B: AutodiffBackend>(
    config: &AppConfig,
    set: &LabeledImageSet,
    splits: &DatasetSplits,
    show_progress: bool,
    device: &B::Device,
) -> Result<()> {
    let model_config = model_config_from(config);
    let mut options = TrainingOptions::from_app_config(config);
    options.show_progress = show_progress;

    let backbone = BackboneConfig::new().with_width_multiplier(config.training.width_multiplier);
    let outcome = match &config.training.pretrained_backbone {
        Some(weights) => train::<B, _>(
            splits,
            set.mapping(),
            &model_config,
            &options,
            &PretrainedBackbone {
                config: backbone,
                weights: PathBuf::from(weights),
            },
            device,
        ),
        None => {
            tracing::warn!("事前学習済みの重みが指定されていないため、バックボーンをランダム初期化します");
            train::<B, _>(splits, set.mapping(), &model_config, &options, &backbone, device)
        }
    }
    .context("training failed")?;

    println!("\nモデルを保存しました: {}", outcome.artifact_path.display());

    let report = evaluate(
        &outcome.model,
        &splits.test,
        model_config.image_size,
        config.dataset.prefetch_batches,
        device,
    )
    .context("test evaluation failed")?;
    let csv_path = outcome
        .artifact_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join("confusion_matrix.csv");
    print_report(&report, set.mapping(), Some(&csv_path))
}

fn print_report(report: &EvaluationReport, mapping: &ClassMapping, csv_path: Option<&Path>) -> Result<()> {
    println!("\n=== テスト評価 ===");
    println!("{}", report.metrics);
    println!("\n混同行列 (行=正解, 列=予測):");
    println!("{}", report.confusion.render(mapping));
    if let Some(path) = csv_path {
        report
            .confusion
            .write_csv(path, mapping)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("混同行列を保存しました: {}", path.display());
    }
    Ok(())
}

fn run_evaluate(config: &AppConfig, confusion_csv: Option<PathBuf>) -> Result<()> {
    let model_path = artifact_path(Path::new(&config.model.model_path));
    let artifact = load_artifact(&model_path)
        .with_context(|| format!("failed to load {}", model_path.display()))?;
    let metadata = artifact.metadata;

    let (set, splits) = load_splits(config)?;
    metadata
        .class_mapping
        .verify_against(set.mapping())
        .context("dataset classes do not match the model")?;

    let device = cpu_device();
    let model =
        CatDogClassifier::<CpuBackend>::from_bytes(&metadata.model_config, artifact.model, &device)?;
    let report = evaluate(
        &model,
        &splits.test,
        metadata.model_config.image_size,
        config.dataset.prefetch_batches,
        &device,
    )?;
    print_report(&report, &metadata.class_mapping, confusion_csv.as_deref())
}

fn run_predict(
    model_path: &Path,
    image: &Path,
    mode: PreprocessMode,
    class0: Option<String>,
    class1: Option<String>,
    swap_classes: bool,
) -> Result<()> {
    let engine = InferenceEngine::<CpuBackend>::load(&artifact_path(model_path), &cpu_device())
        .with_context(|| format!("failed to load {}", model_path.display()))?;

    let mut predictor = DualPathPredictor::new(engine).with_class_names(class0, class1)?;
    if swap_classes {
        predictor = predictor.with_swapped_classes();
    }

    let result = predictor
        .predict_path(image, mode)
        .with_context(|| format!("failed to classify {}", image.display()))?;

    println!("画像: {}", image.display());
    println!("モード: {} (採用: {})", result.mode, result.chosen);
    println!(
        "予測: {} (p({})={:.4})",
        result.label,
        predictor.labels().name(1).unwrap_or("1"),
        result.probability
    );
    println!(
        "診断: raw={:.4} normalized={:.4}",
        result.p_raw, result.p_normalized
    );
    Ok(())
}

fn run_serve(config: &AppConfig) -> Result<()> {
    let model_path = artifact_path(Path::new(&config.model.model_path));
    let state = AppState::load(&model_path)
        .with_upload_limit(config.server.max_upload_bytes)
        .into_shared();

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime
        .block_on(server::serve(state, &config.server.host, config.server.port))
        .context("server error")
}
