//! blendtrain - resumable training supervisor for a generator/discriminator
//! deraining model
//!
//! The crate drives an unbounded epoch/iteration loop over injected model,
//! data and logger collaborators, firing periodic side effects (progress
//! printing, visualization, checkpointing, backups, validation) at
//! independently configured cadences, tracking the best validation metric
//! under a configurable comparison sign, and persisting full run state so
//! a killed process resumes where the last checkpoint left it.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod training;

// Re-exports
pub use config::{CadenceConfig, DataConfig, Device, SelectionConfig, TrainingConfig};
pub use data::{build_loader, Batch, BatchSource, DataLoader, Dataset, RaindropDataset};
pub use error::{Error, Result};
pub use model::{BlendModel, ModelTrainer};
pub use training::{
    CheckpointRecord, CheckpointStore, DriverConfig, DriverPhase, ImageGrid, JsonlLogger,
    LoopOutcome, MetricTracker, MetricsLogger, PeriodicTrigger, RunState, SelectionMode,
    TrainingDriver,
};
