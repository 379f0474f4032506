use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use blendtrain::{
    build_loader, BatchSource, BlendModel, CheckpointStore, DataConfig, Device, DriverConfig,
    JsonlLogger, MetricTracker, SelectionConfig, TrainingConfig, TrainingDriver,
};

#[derive(Parser, Debug)]
#[command(name = "blendtrain")]
#[command(about = "Resumable training supervisor for the blend deraining model", long_about = None)]
struct Cli {
    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Device number; -1 uses the CPU
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    device: i64,

    /// Validation metric used for model selection
    #[arg(long = "model_selection_metric", default_value = "psnr")]
    model_selection_metric: String,

    /// Whether higher or lower metric values are better
    #[arg(long = "model_selection_mode", default_value = "maximize")]
    model_selection_mode: String,

    /// Training data root
    #[arg(long = "train_dir")]
    train_dir: Option<PathBuf>,

    /// Validation data root
    #[arg(long = "val_dir")]
    val_dir: Option<PathBuf>,

    /// Output root for checkpoints, visualizations and logs
    #[arg(long = "out_dir", default_value = "output")]
    out_dir: PathBuf,

    /// Truncate the dataset, for fast debug iteration
    #[arg(long)]
    length: Option<usize>,

    /// Per-sample vector width
    #[arg(long = "sample_dim", default_value_t = 128 * 128)]
    sample_dim: usize,

    /// How many epochs to run (non-terminating ceiling)
    #[arg(long = "epoch_size", default_value_t = 100)]
    epoch_size: i64,

    /// Mini-batch size
    #[arg(long = "batch_size", default_value_t = 16)]
    batch_size: usize,

    /// Sample-decoding worker threads
    #[arg(long = "num_workers", default_value_t = 1)]
    num_workers: usize,

    /// Learning rate
    #[arg(long, default_value_t = 0.0002)]
    lr: f64,

    /// Progress-print cadence in iterations, 0 disables
    #[arg(long = "print_every", default_value_t = 10)]
    print_every: u64,

    /// Rolling-checkpoint cadence, 0 disables
    #[arg(long = "checkpoint_every", default_value_t = 500)]
    checkpoint_every: u64,

    /// Validation cadence, 0 disables
    #[arg(long = "validate_every", default_value_t = 10_000)]
    validate_every: u64,

    /// Visualization cadence, 0 disables
    #[arg(long = "visualize_every", default_value_t = 1_000)]
    visualize_every: u64,

    /// Backup-checkpoint cadence, 0 disables
    #[arg(long = "backup_every", default_value_t = 1_000_000)]
    backup_every: u64,

    /// Checkpoint and exit after this many seconds with exit code 3;
    /// <= 0 disables
    #[arg(long = "exit-after", default_value_t = -1, allow_negative_numbers = true)]
    exit_after: i64,

    /// Force small, fast values for every knob
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> TrainingConfig {
        let debug = self.debug;
        let mut config = TrainingConfig {
            seed: self.seed,
            device: Device::from_index(self.device),
            selection: SelectionConfig {
                metric: self.model_selection_metric,
                mode: self.model_selection_mode,
            },
            data: DataConfig {
                train_dir: self.train_dir,
                val_dir: self.val_dir,
                length: self.length,
                sample_dim: self.sample_dim,
                batch_size: self.batch_size,
                num_workers: self.num_workers,
            },
            out_dir: self.out_dir,
            lr: self.lr,
            epoch_size: self.epoch_size,
            cadence: blendtrain::CadenceConfig {
                print_every: self.print_every,
                checkpoint_every: self.checkpoint_every,
                validate_every: self.validate_every,
                visualize_every: self.visualize_every,
                backup_every: self.backup_every,
            },
            exit_after_secs: self.exit_after,
        };
        if debug {
            config.apply_debug_overrides();
        }
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config();

    // Validated before anything touches the filesystem: a bad
    // configuration leaves no directories or checkpoints behind.
    config.validate()?;
    let mode = config.selection.selection_mode()?;

    info!(
        seed = config.seed,
        device = %config.device,
        out_dir = %config.out_dir.display(),
        "starting training supervisor"
    );

    let mut train = build_loader(config.data.train_dir.as_deref(), &config.data)
        .context("failed to construct training loader")?
        .context("train_dir is required")?;
    let mut val = build_loader(config.data.val_dir.as_deref(), &config.data)
        .context("failed to construct validation loader")?;

    let model = BlendModel::new(config.data.sample_dim, config.lr, config.seed, config.device)
        .context("failed to initialize blend model")?;
    let dim = config.data.sample_dim;
    info!(
        generator = dim * dim + dim,
        discriminator = dim + 1,
        "total number of parameters"
    );

    let logger = JsonlLogger::new(config.logs_dir(), config.vis_dir())
        .context("failed to open metrics logger")?;
    let store = CheckpointStore::new(&config.out_dir)?;
    let tracker = MetricTracker::new(mode);

    let mut driver = TrainingDriver::new(DriverConfig::from(&config), model, logger, store, tracker);
    let outcome = driver.run(
        &mut train,
        val.as_mut().map(|v| v as &mut dyn BatchSource),
    )?;

    // The only path out of the loop; the distinguished status lets
    // orchestration layers tell "ran out of time" apart from crashes.
    std::process::exit(outcome.exit_code());
}
