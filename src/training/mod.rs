//! Training supervision infrastructure
//!
//! The pieces the driver is built from: run state and metric tracking,
//! the periodic trigger predicate, the checkpoint store, the metrics
//! logger, and the driver itself.

pub mod checkpoint;
pub mod driver;
pub mod logger;
pub mod state;
pub mod trigger;

// Checkpoint re-exports
pub use checkpoint::{CheckpointRecord, CheckpointStore};

// Driver re-exports
pub use driver::{
    DriverConfig, DriverPhase, LoopOutcome, TrainingDriver, BEST_PREV_SLOT, BEST_SLOT,
    ROLLING_SLOT,
};

// Logger re-exports
pub use logger::{ImageGrid, JsonlLogger, MetricsLogger, ScalarRecord};

// State re-exports
pub use state::{MetricTracker, RunState, SelectionMode};

// Trigger re-exports
pub use trigger::PeriodicTrigger;
