//! Run state and model-selection tracking
//!
//! `RunState` holds the counters the driver owns for the lifetime of the
//! process; `MetricTracker` is the single policy deciding when a
//! validation metric constitutes a new best model.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Direction of the model-selection comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionMode {
    /// Higher metric values are better (sign +1)
    Maximize,
    /// Lower metric values are better (sign -1)
    Minimize,
}

impl SelectionMode {
    /// The +1/-1 multiplier encoding the comparison direction
    pub fn sign(&self) -> f64 {
        match self {
            SelectionMode::Maximize => 1.0,
            SelectionMode::Minimize => -1.0,
        }
    }
}

impl FromStr for SelectionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maximize" => Ok(SelectionMode::Maximize),
            "minimize" => Ok(SelectionMode::Minimize),
            other => Err(Error::config(format!(
                "model_selection_mode must be either maximize or minimize, got '{}'",
                other
            ))),
        }
    }
}

/// Counters the driver mutates while running. -1 means "nothing completed
/// yet"; both counters are restored verbatim on resumption and never reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Index of the current epoch pass
    pub epoch_it: i64,
    /// Global iteration counter across all epochs
    pub it: i64,
}

impl RunState {
    /// State for a fresh run
    pub fn fresh() -> Self {
        Self { epoch_it: -1, it: -1 }
    }

    /// State restored from a checkpoint record
    pub fn restored(epoch_it: i64, it: i64) -> Self {
        Self { epoch_it, it }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::fresh()
    }
}

/// Directional best-value tracker for the validation metric.
#[derive(Debug, Clone)]
pub struct MetricTracker {
    mode: SelectionMode,
    best: f64,
}

impl MetricTracker {
    /// Create a tracker with the best value every real measurement beats
    pub fn new(mode: SelectionMode) -> Self {
        Self {
            mode,
            best: -mode.sign() * f64::INFINITY,
        }
    }

    /// Seed the best value from a restored checkpoint. An absent value, or
    /// an infinity of either sign, re-derives the fresh sentinel from the
    /// current mode; a stored infinity may come from a run configured with
    /// the opposite sign and cannot be trusted literally.
    pub fn seed(&mut self, restored: Option<f64>) {
        self.best = match restored {
            Some(value) if value.is_finite() => value,
            _ => -self.mode.sign() * f64::INFINITY,
        };
    }

    /// Consider a candidate metric. Returns true and updates the best iff
    /// the candidate strictly improves under the configured sign; a tie is
    /// not an improvement.
    pub fn consider(&mut self, candidate: f64) -> bool {
        if self.mode.sign() * (candidate - self.best) > 0.0 {
            self.best = candidate;
            true
        } else {
            false
        }
    }

    /// Best value seen so far
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Configured comparison direction
    pub fn mode(&self) -> SelectionMode {
        self.mode
    }
}
