//! Model collaborator interface and the built-in blend model
//!
//! The driver only sees the `ModelTrainer` trait: a blocking train step
//! returning named scalar losses, an evaluation pass returning named
//! metrics, a visualization hook, and an opaque state blob for
//! checkpointing. `BlendModel` is the shipped implementation: a linear
//! generator trained against a linear discriminator plus a fixed seeded
//! random projection standing in for the perceptual-feature extractor,
//! with exact analytic gradients and plain SGD.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Device;
use crate::data::{Batch, BatchSource};
use crate::training::logger::ImageGrid;

/// Weight of the perceptual term in the generator loss
const LAMBDA_PERCEPTUAL: f32 = 0.2;
/// Weight of the adversarial term in the generator loss
const LAMBDA_ADV: f32 = 0.01;
/// Width of the random perceptual projection
const FEATURE_DIM: usize = 64;
/// Floor for the MSE inside the PSNR computation
const PSNR_MSE_FLOOR: f64 = 1e-12;

/// The interface the training driver consumes. All calls are blocking and
/// synchronous; failures propagate to the driver without retry.
pub trait ModelTrainer {
    /// One optimizer step over one mini-batch; returns named scalar losses
    fn train_step(&mut self, batch: &Batch, it: i64) -> Result<HashMap<String, f64>>;

    /// Full pass over a validation source; returns named metrics
    fn evaluate(&mut self, val: &mut dyn BatchSource) -> Result<HashMap<String, f64>>;

    /// Render a visualization artifact for a held-out batch, if any
    fn visualize(&mut self, batch: &Batch, it: i64) -> Result<Option<ImageGrid>>;

    /// Serialize model/optimizer state for checkpointing
    fn state_bytes(&self) -> Result<Vec<u8>>;

    /// Restore model/optimizer state from a checkpoint blob
    fn load_state_bytes(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Linear deraining generator: `out = x W^T + b`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinearGenerator {
    w: Array2<f32>,
    b: Array1<f32>,
}

/// Linear realness scorer: `score = out . v + c`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinearDiscriminator {
    v: Array1<f32>,
    c: f32,
}

/// Everything that goes into the checkpoint blob
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlendState {
    dim: usize,
    generator: LinearGenerator,
    discriminator: LinearDiscriminator,
}

/// Generator/discriminator pair with a fixed perceptual projection.
pub struct BlendModel {
    state: BlendState,
    /// Fixed Gaussian projection, (FEATURE_DIM, dim); never trained, never
    /// checkpointed, re-derived from the seed.
    features: Array2<f32>,
    lr: f32,
    device: Device,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl BlendModel {
    /// Build a model for `dim`-wide samples with deterministic
    /// seed-derived initialization. The generator starts near identity so
    /// early outputs are a passthrough of the rainy input.
    pub fn new(dim: usize, lr: f64, seed: u64, device: Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let init = Normal::new(0.0f32, 0.01).context("bad init distribution")?;

        let mut w = Array2::from_shape_fn((dim, dim), |_| init.sample(&mut rng));
        for i in 0..dim {
            w[[i, i]] += 1.0;
        }
        let b = Array1::zeros(dim);
        let v = Array1::from_shape_fn(dim, |_| init.sample(&mut rng));

        let feature_dim = FEATURE_DIM.min(dim);
        let feature_std = 1.0 / (dim as f32).sqrt();
        let feature_init = Normal::new(0.0f32, feature_std).context("bad feature distribution")?;
        let features =
            Array2::from_shape_fn((feature_dim, dim), |_| feature_init.sample(&mut rng));

        debug!(dim, feature_dim, %device, "initialized blend model");
        Ok(Self {
            state: BlendState {
                dim,
                generator: LinearGenerator { w, b },
                discriminator: LinearDiscriminator { v, c: 0.0 },
            },
            features,
            lr: lr as f32,
            device,
        })
    }

    /// The device handle this model was constructed for
    pub fn device(&self) -> Device {
        self.device
    }

    fn forward(&self, inputs: &Array2<f32>) -> Array2<f32> {
        inputs.dot(&self.state.generator.w.t()) + &self.state.generator.b
    }

    fn scores(&self, samples: &Array2<f32>) -> Array1<f32> {
        samples.dot(&self.state.discriminator.v) + self.state.discriminator.c
    }
}

impl ModelTrainer for BlendModel {
    fn train_step(&mut self, batch: &Batch, _it: i64) -> Result<HashMap<String, f64>> {
        if batch.is_empty() {
            return Err(anyhow!("train_step received an empty batch"));
        }
        let x = &batch.inputs;
        let y = &batch.targets;
        let n = batch.len() as f32;
        let d = self.state.dim as f32;
        let k = self.features.nrows() as f32;

        let out = self.forward(x);
        let diff = &out - y;

        // Reconstruction terms.
        let loss_l1 = diff.mapv(f32::abs).mean().unwrap_or(0.0);
        let feat_diff = diff.dot(&self.features.t());
        let loss_percep = feat_diff.mapv(|v| v * v).mean().unwrap_or(0.0);

        // Discriminator pass on both real and generated samples.
        let sig_real = self.scores(y).mapv(sigmoid);
        let sig_fake = self.scores(&out).mapv(sigmoid);
        let eps = 1e-7f32;
        let loss_d = -(sig_real.mapv(|s| (s.max(eps)).ln()).sum()
            + sig_fake.mapv(|s| ((1.0 - s).max(eps)).ln()).sum())
            / n;
        let loss_adv = -sig_fake.mapv(|s| (s.max(eps)).ln()).sum() / n;

        // Discriminator update: logistic regression gradient, real labeled
        // 1 and generated labeled 0.
        let ds_real = sig_real.mapv(|s| -(1.0 - s) / n);
        let ds_fake = sig_fake.mapv(|s| s / n);
        let dv = y.t().dot(&ds_real) + out.t().dot(&ds_fake);
        let dc = ds_real.sum() + ds_fake.sum();
        self.state.discriminator.v = &self.state.discriminator.v - &(dv * self.lr);
        self.state.discriminator.c -= self.lr * dc;

        // Generator update. Gradients w.r.t. the generator output for each
        // term, then one chain-rule step through the linear map.
        let dout_l1 = diff.mapv(|v| v.signum() / (n * d));
        let dout_percep = feat_diff.dot(&self.features) * (2.0 / (n * k));
        let v = &self.state.discriminator.v;
        let dout_adv = Array2::from_shape_fn(out.raw_dim(), |(i, j)| {
            -(1.0 - sig_fake[i]) / n * v[j]
        });
        let dout = dout_l1 + dout_percep * LAMBDA_PERCEPTUAL + dout_adv * LAMBDA_ADV;

        let dw = dout.t().dot(x);
        let db = dout.sum_axis(Axis(0));
        self.state.generator.w = &self.state.generator.w - &(dw * self.lr);
        self.state.generator.b = &self.state.generator.b - &(db * self.lr);

        let loss_g = loss_l1 + LAMBDA_PERCEPTUAL * loss_percep + LAMBDA_ADV * loss_adv;

        Ok(HashMap::from([
            ("loss_g".to_string(), loss_g as f64),
            ("loss_d".to_string(), loss_d as f64),
            ("loss_l1".to_string(), loss_l1 as f64),
            ("loss_percep".to_string(), loss_percep as f64),
            ("loss_adv".to_string(), loss_adv as f64),
        ]))
    }

    fn evaluate(&mut self, val: &mut dyn BatchSource) -> Result<HashMap<String, f64>> {
        val.reset();

        let mut sq_sum = 0.0f64;
        let mut abs_sum = 0.0f64;
        let mut count = 0usize;
        while let Some(batch) = val.next_batch()? {
            let out = self.forward(&batch.inputs);
            let diff = &out - &batch.targets;
            sq_sum += diff.mapv(|v| (v as f64) * (v as f64)).sum();
            abs_sum += diff.mapv(|v| v.abs() as f64).sum();
            count += diff.len();
        }
        if count == 0 {
            return Err(anyhow!("validation source yielded no samples"));
        }

        let mse = (sq_sum / count as f64).max(PSNR_MSE_FLOOR);
        // Samples live in [0, 1], so peak signal is 1.
        let psnr = -10.0 * mse.log10();
        let l1 = abs_sum / count as f64;

        Ok(HashMap::from([
            ("psnr".to_string(), psnr),
            ("l1".to_string(), l1),
        ]))
    }

    fn visualize(&mut self, batch: &Batch, it: i64) -> Result<Option<ImageGrid>> {
        let side = (self.state.dim as f64).sqrt() as usize;
        if side == 0 || side * side != self.state.dim {
            // Non-square sample width; nothing sensible to render.
            return Ok(None);
        }

        let rows = batch.len().min(4);
        if rows == 0 {
            return Ok(None);
        }
        let out = self.forward(&batch.inputs);

        // Rainy input, derained output and clean target side by side, one
        // row of panels per sample.
        let width = side * 3;
        let height = side * rows;
        let mut pixels = Vec::with_capacity(width * height);
        for sample in 0..rows {
            for r in 0..side {
                for panel in [&batch.inputs, &out, &batch.targets] {
                    for c in 0..side {
                        pixels.push(panel[[sample, r * side + c]]);
                    }
                }
            }
        }

        debug!(it, rows, "rendered visualization grid");
        Ok(Some(ImageGrid::new(width, height, pixels)))
    }

    fn state_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.state).context("failed to serialize model state")
    }

    fn load_state_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let state: BlendState =
            bincode::deserialize(bytes).context("failed to deserialize model state")?;
        if state.dim != self.state.dim {
            return Err(anyhow!(
                "checkpointed model width {} does not match configured width {}",
                state.dim,
                self.state.dim
            ));
        }
        self.state = state;
        Ok(())
    }
}
