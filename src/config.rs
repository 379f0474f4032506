//! Configuration for the training supervisor
//!
//! All knobs the CLI exposes land here. `validate()` runs before any side
//! effect (directory creation, checkpoint reads), so an invalid
//! configuration never leaves traces on disk.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::state::SelectionMode;

/// Compute device handle, injected into collaborators rather than read
/// from process-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Map the CLI device index: -1 selects the CPU, anything else a
    /// numbered accelerator.
    pub fn from_index(index: i64) -> Self {
        if index < 0 {
            Device::Cpu
        } else {
            Device::Cuda(index as usize)
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(n) => write!(f, "cuda:{}", n),
        }
    }
}

/// Model-selection policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Key used to read the validation metric mapping
    pub metric: String,

    /// "maximize" or "minimize"; anything else is a fatal configuration
    /// error
    pub mode: String,
}

impl SelectionConfig {
    /// Parse the configured mode string
    pub fn selection_mode(&self) -> Result<SelectionMode> {
        self.mode.parse()
    }
}

/// Data source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Training data root; required for a run
    pub train_dir: Option<PathBuf>,

    /// Validation data root; absent disables visualization and validation
    pub val_dir: Option<PathBuf>,

    /// Truncate the dataset to this many samples, for fast debug iteration
    pub length: Option<usize>,

    /// Per-sample vector width (a flattened 128x128 image by default)
    pub sample_dim: usize,

    /// Mini-batch size
    pub batch_size: usize,

    /// Threads used to decode a batch's sample files
    pub num_workers: usize,
}

/// Cadences for the periodic actions, in iterations; 0 disables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    pub print_every: u64,
    pub checkpoint_every: u64,
    pub validate_every: u64,
    pub visualize_every: u64,
    pub backup_every: u64,
}

/// Main supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Deterministic initialization seed
    pub seed: u64,

    /// Compute device handle
    pub device: Device,

    /// Model-selection policy
    pub selection: SelectionConfig,

    /// Data sources
    pub data: DataConfig,

    /// Root for checkpoints, visualizations and logs
    pub out_dir: PathBuf,

    /// Learning rate passed through to the model collaborator
    pub lr: f64,

    /// Epoch ceiling, checked once per epoch (non-terminating)
    pub epoch_size: i64,

    /// Trigger cadences
    pub cadence: CadenceConfig,

    /// Wall-clock budget in seconds; <= 0 disables the time-budget exit
    pub exit_after_secs: i64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            device: Device::Cpu,
            selection: SelectionConfig {
                metric: "psnr".to_string(),
                mode: "maximize".to_string(),
            },
            data: DataConfig {
                train_dir: None,
                val_dir: None,
                length: None,
                sample_dim: 128 * 128,
                batch_size: 16,
                num_workers: 1,
            },
            out_dir: PathBuf::from("output"),
            lr: 0.0002,
            epoch_size: 100,
            cadence: CadenceConfig {
                print_every: 10,
                checkpoint_every: 500,
                validate_every: 10_000,
                visualize_every: 1_000,
                backup_every: 1_000_000,
            },
            exit_after_secs: -1,
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration. Must be called before anything touches
    /// the filesystem.
    pub fn validate(&self) -> Result<()> {
        self.selection.selection_mode()?;

        if self.data.train_dir.is_none() {
            return Err(Error::config("train_dir is required"));
        }
        if self.data.batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        if self.data.sample_dim == 0 {
            return Err(Error::config("sample_dim must be positive"));
        }
        if self.lr <= 0.0 {
            return Err(Error::config("lr must be positive"));
        }

        Ok(())
    }

    /// Force small, fast settings for every knob that affects turnaround.
    pub fn apply_debug_overrides(&mut self) {
        self.data.batch_size = 1;
        self.data.length = Some(10);
        self.cadence.print_every = 1;
        self.cadence.checkpoint_every = 1;
        self.cadence.validate_every = 1;
        self.cadence.visualize_every = 1;
        self.cadence.backup_every = 1;
    }

    /// The time budget, if one is configured
    pub fn exit_after(&self) -> Option<Duration> {
        if self.exit_after_secs > 0 {
            Some(Duration::from_secs(self.exit_after_secs as u64))
        } else {
            None
        }
    }

    /// Directory for visualization artifacts
    pub fn vis_dir(&self) -> PathBuf {
        self.out_dir.join("vis")
    }

    /// Directory for the metrics log stream
    pub fn logs_dir(&self) -> PathBuf {
        self.out_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.data.train_dir = Some(PathBuf::from("/tmp/train"));
        config
    }

    #[test]
    fn test_default_config_matches_cli_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.seed, 42);
        assert_eq!(config.selection.metric, "psnr");
        assert_eq!(config.cadence.checkpoint_every, 500);
        assert_eq!(config.cadence.backup_every, 1_000_000);
        assert_eq!(config.exit_after_secs, -1);
        assert!(config.exit_after().is_none());
    }

    #[test]
    fn test_invalid_selection_mode_is_config_error() {
        let mut config = valid_config();
        config.selection.mode = "average".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_train_dir_is_config_error() {
        let config = TrainingConfig::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_debug_overrides() {
        let mut config = valid_config();
        config.apply_debug_overrides();
        assert_eq!(config.data.batch_size, 1);
        assert_eq!(config.data.length, Some(10));
        assert_eq!(config.cadence.print_every, 1);
        assert_eq!(config.cadence.validate_every, 1);
    }

    #[test]
    fn test_exit_after_enabled() {
        let mut config = valid_config();
        config.exit_after_secs = 5;
        assert_eq!(config.exit_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_device_from_index() {
        assert_eq!(Device::from_index(-1), Device::Cpu);
        assert_eq!(Device::from_index(1), Device::Cuda(1));
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
    }
}
