//! The training driver
//!
//! Composes the run state, metric tracker, periodic triggers and
//! checkpoint store into the main loop, calling out to the injected
//! model, data and logger collaborators. The driver moves through
//! `Bootstrapping -> Resuming -> Running -> Exiting`; the only transition
//! out of `Running` is the wall-clock budget. Exceeding the epoch ceiling
//! checkpoints but deliberately does not stop the loop, matching the
//! long-standing behavior of this trainer (pending product-owner
//! confirmation that a hard stop is wanted).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::config::{CadenceConfig, TrainingConfig};
use crate::data::{Batch, BatchSource};
use crate::model::ModelTrainer;
use crate::training::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::training::logger::MetricsLogger;
use crate::training::state::{MetricTracker, RunState};
use crate::training::trigger::PeriodicTrigger;

/// Rolling "latest" checkpoint slot, overwritten at the checkpoint cadence
pub const ROLLING_SLOT: &str = "model";
/// Slot holding the best-validation model
pub const BEST_SLOT: &str = "model_best";
/// Slot the previous best is promoted to before a new best overwrites it
pub const BEST_PREV_SLOT: &str = "model_best_prev";

/// Driver lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Bootstrapping,
    Resuming,
    Running,
    Exiting,
}

/// How the loop ended. The loop is unbounded; the time budget is the only
/// way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    TimeLimitReached,
}

impl LoopOutcome {
    /// Process status distinguishing this outcome from ordinary failures
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopOutcome::TimeLimitReached => 3,
        }
    }
}

/// The slice of the configuration the driver consumes
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Key into the evaluation metric mapping
    pub selection_metric: String,
    /// Trigger cadences
    pub cadence: CadenceConfig,
    /// Epoch ceiling, checked once per epoch
    pub epoch_size: i64,
    /// Wall-clock budget, if any
    pub exit_after: Option<Duration>,
}

impl From<&TrainingConfig> for DriverConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            selection_metric: config.selection.metric.clone(),
            cadence: config.cadence.clone(),
            epoch_size: config.epoch_size,
            exit_after: config.exit_after(),
        }
    }
}

struct Triggers {
    print: PeriodicTrigger,
    visualize: PeriodicTrigger,
    checkpoint: PeriodicTrigger,
    backup: PeriodicTrigger,
    validate: PeriodicTrigger,
}

impl Triggers {
    fn new(cadence: &CadenceConfig) -> Self {
        Self {
            print: PeriodicTrigger::new(cadence.print_every),
            visualize: PeriodicTrigger::new(cadence.visualize_every),
            checkpoint: PeriodicTrigger::new(cadence.checkpoint_every),
            backup: PeriodicTrigger::new(cadence.backup_every),
            validate: PeriodicTrigger::new(cadence.validate_every),
        }
    }
}

/// Main training loop supervisor.
pub struct TrainingDriver<M: ModelTrainer, L: MetricsLogger> {
    config: DriverConfig,
    model: M,
    logger: L,
    store: CheckpointStore,
    tracker: MetricTracker,
    state: RunState,
    phase: DriverPhase,
    triggers: Triggers,
    fixed_batch: Option<Batch>,
}

impl<M: ModelTrainer, L: MetricsLogger> TrainingDriver<M, L> {
    /// Assemble a driver from its injected collaborators.
    pub fn new(
        config: DriverConfig,
        model: M,
        logger: L,
        store: CheckpointStore,
        tracker: MetricTracker,
    ) -> Self {
        let triggers = Triggers::new(&config.cadence);
        Self {
            config,
            model,
            logger,
            store,
            tracker,
            state: RunState::fresh(),
            phase: DriverPhase::Bootstrapping,
            triggers,
            fixed_batch: None,
        }
    }

    /// Current run counters
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    /// Best validation metric seen so far
    pub fn best_metric(&self) -> f64 {
        self.tracker.best()
    }

    /// Restore run state from the rolling checkpoint, or start fresh when
    /// no slot exists. Also captures the held-out fixed batch used for
    /// visualization from the validation source.
    fn resume(&mut self, val: &mut Option<&mut dyn BatchSource>) -> Result<()> {
        self.phase = DriverPhase::Resuming;

        match self.store.load(ROLLING_SLOT) {
            Ok(record) => {
                self.model.load_state_bytes(&record.model_state)?;
                self.state = RunState::restored(record.epoch_it, record.it);
                self.tracker.seed(Some(record.loss_val_best));
                info!(
                    epoch_it = record.epoch_it,
                    it = record.it,
                    "loaded model checkpoint"
                );
            }
            Err(e) if e.is_not_found() => {
                self.state = RunState::fresh();
                self.tracker.seed(None);
                info!("no model checkpoint found, starting fresh");
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            metric = %self.config.selection_metric,
            best = self.tracker.best(),
            "current best validation metric"
        );

        if let Some(v) = val.as_deref_mut() {
            v.reset();
            self.fixed_batch = v.next_batch()?;
        }

        Ok(())
    }

    /// Serialize the model and persist a record under `slot`. A failed
    /// save is logged and swallowed: it forfeits resumability from this
    /// point, never the run itself.
    fn try_save(&mut self, slot: &str) {
        let blob = match self.model.state_bytes() {
            Ok(blob) => blob,
            Err(e) => {
                warn!(slot, error = %e, "model state serialization failed, skipping checkpoint");
                return;
            }
        };
        let record =
            CheckpointRecord::new(self.state.epoch_it, self.state.it, self.tracker.best(), blob);
        if let Err(e) = self.store.save(slot, &record) {
            warn!(slot, error = %e, "checkpoint save failed, continuing");
        }
    }

    fn print_progress(&self, losses: &BTreeMap<String, f64>, since_print: Duration) {
        let mut line = format!(
            "[Epoch {:02}] it={:03}, time={:.3}",
            self.state.epoch_it,
            self.state.it,
            since_print.as_secs_f64()
        );
        for (name, value) in losses {
            line.push_str(&format!(", {}: {:.4}", name, value));
        }
        info!("{}", line);
    }

    fn validate_step(&mut self, val: &mut dyn BatchSource) -> Result<()> {
        info!("performing evaluation step");
        let metrics: BTreeMap<String, f64> =
            self.model.evaluate(val)?.into_iter().collect();

        for (name, value) in &metrics {
            self.logger
                .log_scalar(&format!("val/{}", name), *value, self.state.it)?;
        }

        let metric_val = *metrics.get(&self.config.selection_metric).ok_or_else(|| {
            anyhow!(
                "selection metric '{}' missing from evaluation results",
                self.config.selection_metric
            )
        })?;
        info!(
            metric = %self.config.selection_metric,
            value = metric_val,
            "validation metric"
        );

        if self.tracker.consider(metric_val) {
            info!(
                metric = %self.config.selection_metric,
                best = self.tracker.best(),
                "new best model"
            );
            if let Err(e) = self.store.promote_best(BEST_SLOT, BEST_PREV_SLOT) {
                warn!(error = %e, "failed to promote previous best, continuing");
            }
            self.try_save(BEST_SLOT);
        }

        Ok(())
    }

    /// Run the loop to completion. Returns only when the time budget
    /// expires; collaborator failures propagate out as errors.
    pub fn run(
        &mut self,
        train: &mut dyn BatchSource,
        mut val: Option<&mut dyn BatchSource>,
    ) -> Result<LoopOutcome> {
        self.resume(&mut val)?;

        match train.len_hint() {
            Some(samples) => info!(samples, "training source ready"),
            None => info!("training source ready, size unknown"),
        }

        self.phase = DriverPhase::Running;
        let started = Instant::now();
        let mut last_print = Instant::now();

        loop {
            self.state.epoch_it += 1;
            train.reset();

            while let Some(batch) = train.next_batch()? {
                self.state.it += 1;
                let it = self.state.it;

                let losses: BTreeMap<String, f64> =
                    self.model.train_step(&batch, it)?.into_iter().collect();
                for (name, value) in &losses {
                    self.logger.log_scalar(name, *value, it)?;
                }

                if self.triggers.print.fires(it) {
                    self.print_progress(&losses, last_print.elapsed());
                    last_print = Instant::now();
                }

                if self.triggers.visualize.fires(it) {
                    if let Some(fixed) = self.fixed_batch.clone() {
                        info!("visualizing");
                        if let Some(grid) = self.model.visualize(&fixed, it)? {
                            self.logger.log_image("images", &grid, it)?;
                        }
                    }
                }

                if self.triggers.checkpoint.fires(it) {
                    info!("saving checkpoint");
                    self.try_save(ROLLING_SLOT);
                }

                if self.triggers.backup.fires(it) {
                    info!(it, "backup checkpoint");
                    self.try_save(&format!("model_{}", it));
                }

                if self.triggers.validate.fires(it) && it > 0 {
                    if let Some(v) = val.as_deref_mut() {
                        self.validate_step(v)?;
                    }
                }

                if let Some(budget) = self.config.exit_after {
                    if started.elapsed() >= budget {
                        info!("time limit reached, exiting");
                        self.try_save(ROLLING_SLOT);
                        self.phase = DriverPhase::Exiting;
                        return Ok(LoopOutcome::TimeLimitReached);
                    }
                }
            }

            if self.state.epoch_it > self.config.epoch_size {
                // Checkpoints but keeps looping; see the module note.
                info!(epoch_it = self.state.epoch_it, "epoch ceiling reached, checkpointing");
                self.try_save(ROLLING_SLOT);
            }
        }
    }
}
