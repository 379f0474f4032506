//! End-to-end driver scenarios with scripted in-memory collaborators.
//!
//! The loop is unbounded by design, so scripted models stop a run either
//! through the wall-clock budget or by failing after a set number of
//! steps (collaborator failures propagate out of `run`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use ndarray::Array2;
use tempfile::TempDir;

use blendtrain::{
    Batch, BatchSource, CadenceConfig, CheckpointRecord, CheckpointStore, DriverConfig,
    DriverPhase, ImageGrid, LoopOutcome, MetricTracker, MetricsLogger, ModelTrainer, RunState,
    SelectionMode, TrainingDriver,
};

#[derive(Default)]
struct Telemetry {
    train_its: Vec<i64>,
    evaluate_calls: usize,
    visualize_calls: usize,
    state_dumps: usize,
    loaded_blobs: Vec<Vec<u8>>,
}

/// Model double: replays a scripted validation-metric sequence and can
/// sleep per step or fail after a set number of steps.
struct ScriptedModel {
    telemetry: Arc<Mutex<Telemetry>>,
    val_metrics: Vec<f64>,
    val_cursor: usize,
    step_delay: Option<Duration>,
    fail_after: Option<usize>,
}

impl ScriptedModel {
    fn new(telemetry: Arc<Mutex<Telemetry>>) -> Self {
        Self {
            telemetry,
            val_metrics: vec![0.0],
            val_cursor: 0,
            step_delay: None,
            fail_after: None,
        }
    }

    fn with_val_metrics(mut self, metrics: Vec<f64>) -> Self {
        self.val_metrics = metrics;
        self
    }

    fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    fn with_fail_after(mut self, steps: usize) -> Self {
        self.fail_after = Some(steps);
        self
    }
}

impl ModelTrainer for ScriptedModel {
    fn train_step(&mut self, _batch: &Batch, it: i64) -> Result<HashMap<String, f64>> {
        let mut telemetry = self.telemetry.lock().unwrap();
        if let Some(max) = self.fail_after {
            if telemetry.train_its.len() >= max {
                return Err(anyhow!("scripted stop"));
            }
        }
        telemetry.train_its.push(it);
        drop(telemetry);

        if let Some(delay) = self.step_delay {
            std::thread::sleep(delay);
        }
        Ok(HashMap::from([("loss_g".to_string(), 0.25)]))
    }

    fn evaluate(&mut self, _val: &mut dyn BatchSource) -> Result<HashMap<String, f64>> {
        self.telemetry.lock().unwrap().evaluate_calls += 1;
        let index = self.val_cursor.min(self.val_metrics.len() - 1);
        self.val_cursor += 1;
        Ok(HashMap::from([(
            "psnr".to_string(),
            self.val_metrics[index],
        )]))
    }

    fn visualize(&mut self, _batch: &Batch, _it: i64) -> Result<Option<ImageGrid>> {
        self.telemetry.lock().unwrap().visualize_calls += 1;
        Ok(Some(ImageGrid::new(1, 1, vec![0.5])))
    }

    fn state_bytes(&self) -> Result<Vec<u8>> {
        let mut telemetry = self.telemetry.lock().unwrap();
        telemetry.state_dumps += 1;
        Ok(vec![telemetry.train_its.len() as u8])
    }

    fn load_state_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.telemetry.lock().unwrap().loaded_blobs.push(bytes.to_vec());
        Ok(())
    }
}

/// Fixed number of single-sample batches per epoch pass.
struct SyntheticSource {
    per_epoch: usize,
    cursor: usize,
    hint_calls: std::cell::Cell<usize>,
}

impl SyntheticSource {
    fn new(per_epoch: usize) -> Self {
        Self {
            per_epoch,
            cursor: 0,
            hint_calls: std::cell::Cell::new(0),
        }
    }
}

impl BatchSource for SyntheticSource {
    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.per_epoch {
            return Ok(None);
        }
        self.cursor += 1;
        Ok(Some(Batch {
            inputs: Array2::zeros((1, 4)),
            targets: Array2::zeros((1, 4)),
        }))
    }

    fn len_hint(&self) -> Option<usize> {
        self.hint_calls.set(self.hint_calls.get() + 1);
        Some(self.per_epoch)
    }
}

#[derive(Default, Clone)]
struct LoggedOutput {
    scalars: Vec<(String, f64, i64)>,
    images: Vec<(String, i64)>,
}

struct RecordingLogger {
    output: Arc<Mutex<LoggedOutput>>,
}

impl MetricsLogger for RecordingLogger {
    fn log_scalar(&mut self, tag: &str, value: f64, step: i64) -> Result<()> {
        self.output
            .lock()
            .unwrap()
            .scalars
            .push((tag.to_string(), value, step));
        Ok(())
    }

    fn log_image(&mut self, tag: &str, _image: &ImageGrid, step: i64) -> Result<()> {
        self.output
            .lock()
            .unwrap()
            .images
            .push((tag.to_string(), step));
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    store: CheckpointStore,
    telemetry: Arc<Mutex<Telemetry>>,
    output: Arc<Mutex<LoggedOutput>>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("out")).unwrap();
        Self {
            _dir: dir,
            store,
            telemetry: Arc::new(Mutex::new(Telemetry::default())),
            output: Arc::new(Mutex::new(LoggedOutput::default())),
        }
    }

    fn logger(&self) -> RecordingLogger {
        RecordingLogger {
            output: Arc::clone(&self.output),
        }
    }

    fn driver(
        &self,
        config: DriverConfig,
        model: ScriptedModel,
        mode: SelectionMode,
    ) -> TrainingDriver<ScriptedModel, RecordingLogger> {
        TrainingDriver::new(
            config,
            model,
            self.logger(),
            self.store.clone(),
            MetricTracker::new(mode),
        )
    }
}

fn quiet_cadence() -> CadenceConfig {
    CadenceConfig {
        print_every: 0,
        checkpoint_every: 0,
        validate_every: 0,
        visualize_every: 0,
        backup_every: 0,
    }
}

fn config(cadence: CadenceConfig) -> DriverConfig {
    DriverConfig {
        selection_metric: "psnr".to_string(),
        cadence,
        epoch_size: 100,
        exit_after: None,
    }
}

#[test]
fn fresh_run_starts_from_sentinels() {
    let harness = Harness::new();
    assert!(harness.store.load("model").unwrap_err().is_not_found());

    let model = ScriptedModel::new(Arc::clone(&harness.telemetry)).with_fail_after(1);
    let mut driver = harness.driver(config(quiet_cadence()), model, SelectionMode::Maximize);

    let err = driver
        .run(&mut SyntheticSource::new(3), None)
        .unwrap_err();
    assert!(err.to_string().contains("scripted stop"));

    // One fresh iteration completed (it=0); the counter had already
    // advanced for the step that failed.
    assert_eq!(driver.state(), RunState { epoch_it: 0, it: 1 });
    assert_eq!(driver.best_metric(), f64::NEG_INFINITY);
    assert_eq!(harness.telemetry.lock().unwrap().train_its, vec![0]);
}

#[test]
fn run_reports_training_source_size() {
    let harness = Harness::new();
    let model = ScriptedModel::new(Arc::clone(&harness.telemetry)).with_fail_after(2);
    let mut driver = harness.driver(config(quiet_cadence()), model, SelectionMode::Maximize);

    let mut train = SyntheticSource::new(3);
    let _ = driver.run(&mut train, None);

    assert!(train.hint_calls.get() > 0);
}

#[test]
fn losses_are_logged_every_iteration() {
    let harness = Harness::new();
    let model = ScriptedModel::new(Arc::clone(&harness.telemetry)).with_fail_after(3);
    let mut driver = harness.driver(config(quiet_cadence()), model, SelectionMode::Maximize);

    let _ = driver.run(&mut SyntheticSource::new(3), None);

    let output = harness.output.lock().unwrap();
    let steps: Vec<i64> = output
        .scalars
        .iter()
        .filter(|(tag, _, _)| tag == "loss_g")
        .map(|&(_, _, step)| step)
        .collect();
    assert_eq!(steps, vec![0, 1, 2]);
}

/// `checkpoint_every = 5`, backups disabled, resumed from a checkpoint
/// taken at iteration 0, then 12 further iterations: exactly two rolling
/// saves (iterations 5 and 10) and no backup slots.
#[test]
fn scenario_rolling_checkpoint_cadence() {
    let harness = Harness::new();
    harness
        .store
        .save(
            "model",
            &CheckpointRecord::new(-1, 0, f64::NEG_INFINITY, vec![7, 7]),
        )
        .unwrap();

    let model = ScriptedModel::new(Arc::clone(&harness.telemetry)).with_fail_after(12);
    let mut cadence = quiet_cadence();
    cadence.checkpoint_every = 5;
    let mut driver = harness.driver(config(cadence), model, SelectionMode::Maximize);

    let _ = driver.run(&mut SyntheticSource::new(12), None);

    let telemetry = harness.telemetry.lock().unwrap();
    assert_eq!(telemetry.train_its, (1..=12).collect::<Vec<i64>>());
    assert_eq!(telemetry.loaded_blobs, vec![vec![7, 7]]);
    // One state dump per rolling save.
    assert_eq!(telemetry.state_dumps, 2);

    let rolling = harness.store.load("model").unwrap();
    assert_eq!(rolling.it, 10);

    // No numbered backup slots were written.
    assert!(!harness.store.exists("model_5"));
    assert!(!harness.store.exists("model_10"));
}

#[test]
fn backup_slots_are_distinct_per_iteration() {
    let harness = Harness::new();
    let model = ScriptedModel::new(Arc::clone(&harness.telemetry)).with_fail_after(7);
    let mut cadence = quiet_cadence();
    cadence.backup_every = 3;
    let mut driver = harness.driver(config(cadence), model, SelectionMode::Maximize);

    let _ = driver.run(&mut SyntheticSource::new(7), None);

    // Iterations 0..=6; backups at 0, 3 and 6, each in its own slot.
    for it in [0i64, 3, 6] {
        let record = harness.store.load(&format!("model_{}", it)).unwrap();
        assert_eq!(record.it, it);
    }
    assert!(!harness.store.exists("model"));
}

/// `validate_every = 3`, maximize, metric sequence [0.1, 0.5, 0.3, 0.9]
/// at iterations 3/6/9/12: best promotions at 3, 6 and 12 but not 9.
#[test]
fn scenario_best_model_promotion() {
    let harness = Harness::new();
    let model = ScriptedModel::new(Arc::clone(&harness.telemetry))
        .with_val_metrics(vec![0.1, 0.5, 0.3, 0.9])
        .with_fail_after(13);
    let mut cadence = quiet_cadence();
    cadence.validate_every = 3;
    let mut driver = harness.driver(config(cadence), model, SelectionMode::Maximize);

    let _ = driver.run(
        &mut SyntheticSource::new(13),
        Some(&mut SyntheticSource::new(1)),
    );

    let telemetry = harness.telemetry.lock().unwrap();
    assert_eq!(telemetry.evaluate_calls, 4);
    // New-best saves at 3, 6 and 12 only.
    assert_eq!(telemetry.state_dumps, 3);

    let best = harness.store.load("model_best").unwrap();
    assert_eq!(best.it, 12);
    assert_eq!(best.loss_val_best, 0.9);

    // The promotion preserved the previous best (from iteration 6).
    let previous = harness.store.load("model_best_prev").unwrap();
    assert_eq!(previous.it, 6);
    assert_eq!(previous.loss_val_best, 0.5);

    let output = harness.output.lock().unwrap();
    let val_series: Vec<(f64, i64)> = output
        .scalars
        .iter()
        .filter(|(tag, _, _)| tag == "val/psnr")
        .map(|&(_, value, step)| (value, step))
        .collect();
    assert_eq!(
        val_series,
        vec![(0.1, 3), (0.5, 6), (0.3, 9), (0.9, 12)]
    );
}

#[test]
fn validation_does_not_fire_at_iteration_zero() {
    let harness = Harness::new();
    let model = ScriptedModel::new(Arc::clone(&harness.telemetry))
        .with_val_metrics(vec![1.0])
        .with_fail_after(1);
    let mut cadence = quiet_cadence();
    cadence.validate_every = 1;
    let mut driver = harness.driver(config(cadence), model, SelectionMode::Maximize);

    let _ = driver.run(
        &mut SyntheticSource::new(1),
        Some(&mut SyntheticSource::new(1)),
    );

    // Iteration 0 ran but no evaluation happened before the first step.
    assert_eq!(harness.telemetry.lock().unwrap().train_its, vec![0]);
    assert_eq!(harness.telemetry.lock().unwrap().evaluate_calls, 0);
}

/// A one-second budget with a slower first train step: the driver saves
/// the rolling checkpoint and reports the time-limit outcome after
/// exactly one iteration.
#[test]
fn scenario_time_budget_exit() {
    let harness = Harness::new();
    let model = ScriptedModel::new(Arc::clone(&harness.telemetry))
        .with_step_delay(Duration::from_millis(1100));
    let mut config = config(quiet_cadence());
    config.exit_after = Some(Duration::from_secs(1));
    let mut driver = harness.driver(config, model, SelectionMode::Maximize);

    let outcome = driver
        .run(&mut SyntheticSource::new(100), None)
        .unwrap();
    assert_eq!(outcome, LoopOutcome::TimeLimitReached);
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(driver.phase(), DriverPhase::Exiting);

    assert_eq!(harness.telemetry.lock().unwrap().train_its, vec![0]);
    let rolling = harness.store.load("model").unwrap();
    assert_eq!(rolling.it, 0);
    assert_eq!(rolling.epoch_it, 0);
}

/// Exceeding the epoch ceiling checkpoints but does not stop the loop.
#[test]
fn epoch_ceiling_checkpoints_without_stopping() {
    let harness = Harness::new();
    let model = ScriptedModel::new(Arc::clone(&harness.telemetry)).with_fail_after(5);
    let mut config = config(quiet_cadence());
    config.epoch_size = 0;
    let mut driver = harness.driver(config, model, SelectionMode::Maximize);

    let _ = driver.run(&mut SyntheticSource::new(2), None);

    // Epoch 1 exceeded the ceiling of 0 and checkpointed; the loop then
    // kept going into epoch 2.
    let telemetry = harness.telemetry.lock().unwrap();
    assert_eq!(telemetry.train_its, vec![0, 1, 2, 3, 4]);
    let rolling = harness.store.load("model").unwrap();
    assert_eq!(rolling.epoch_it, 1);
    assert_eq!(rolling.it, 3);
}

/// Counters restored from a checkpoint continue monotonically.
#[test]
fn resumption_continues_iteration_numbering() {
    let harness = Harness::new();

    {
        let model = ScriptedModel::new(Arc::clone(&harness.telemetry)).with_fail_after(5);
        let mut cadence = quiet_cadence();
        cadence.checkpoint_every = 2;
        let mut driver = harness.driver(config(cadence), model, SelectionMode::Maximize);
        let _ = driver.run(&mut SyntheticSource::new(10), None);
    }
    // First run covered iterations 0..=4 with rolling saves at 0, 2, 4.
    assert_eq!(harness.store.load("model").unwrap().it, 4);

    let telemetry = Arc::new(Mutex::new(Telemetry::default()));
    let model = ScriptedModel::new(Arc::clone(&telemetry)).with_fail_after(3);
    let mut driver = harness.driver(config(quiet_cadence()), model, SelectionMode::Maximize);
    let _ = driver.run(&mut SyntheticSource::new(10), None);

    assert_eq!(telemetry.lock().unwrap().train_its, vec![5, 6, 7]);
}

#[test]
fn restored_best_metric_survives_resumption() {
    let harness = Harness::new();
    harness
        .store
        .save("model", &CheckpointRecord::new(2, 99, 27.5, vec![1]))
        .unwrap();

    let model = ScriptedModel::new(Arc::clone(&harness.telemetry))
        .with_val_metrics(vec![27.5, 28.0])
        .with_fail_after(2);
    let mut cadence = quiet_cadence();
    cadence.validate_every = 1;
    let mut driver = harness.driver(config(cadence), model, SelectionMode::Maximize);

    let _ = driver.run(
        &mut SyntheticSource::new(5),
        Some(&mut SyntheticSource::new(1)),
    );

    // A tie with the restored best (27.5 at it=100) is not an
    // improvement; 28.0 at it=101 is.
    assert_eq!(driver.best_metric(), 28.0);
    let best = harness.store.load("model_best").unwrap();
    assert_eq!(best.it, 101);
}

#[test]
fn visualization_uses_fixed_validation_batch() {
    let harness = Harness::new();
    let model = ScriptedModel::new(Arc::clone(&harness.telemetry)).with_fail_after(4);
    let mut cadence = quiet_cadence();
    cadence.visualize_every = 2;
    let mut driver = harness.driver(config(cadence), model, SelectionMode::Maximize);

    let _ = driver.run(
        &mut SyntheticSource::new(4),
        Some(&mut SyntheticSource::new(2)),
    );

    assert_eq!(harness.telemetry.lock().unwrap().visualize_calls, 2);
    let output = harness.output.lock().unwrap();
    assert_eq!(
        output.images,
        vec![("images".to_string(), 0), ("images".to_string(), 2)]
    );
}

#[test]
fn visualization_skipped_without_validation_source() {
    let harness = Harness::new();
    let model = ScriptedModel::new(Arc::clone(&harness.telemetry)).with_fail_after(4);
    let mut cadence = quiet_cadence();
    cadence.visualize_every = 1;
    let mut driver = harness.driver(config(cadence), model, SelectionMode::Maximize);

    let _ = driver.run(&mut SyntheticSource::new(4), None);

    assert_eq!(harness.telemetry.lock().unwrap().visualize_calls, 0);
    assert!(harness.output.lock().unwrap().images.is_empty());
}
