//! Data loading for paired rainy/clean samples
//!
//! A sample is one `.bin` file holding `2 * sample_dim` little-endian f32
//! values in [0, 1]: the rainy vector followed by the clean vector. The
//! loader batches sequentially without shuffling; `num_workers` decodes a
//! batch's sample files on a rayon pool.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::DataConfig;
use crate::error::{Error, Result};

/// One mini-batch of paired samples, row per sample.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Rainy inputs, shape (n, sample_dim)
    pub inputs: Array2<f32>,
    /// Clean targets, shape (n, sample_dim)
    pub targets: Array2<f32>,
}

impl Batch {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    /// Whether the batch holds no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Producer of mini-batches. One `reset` plus draining `next_batch` is one
/// epoch; any prefetch parallelism lives behind this interface and is
/// invisible to the driver.
pub trait BatchSource {
    /// Start a new pass over the data
    fn reset(&mut self);

    /// Next batch, or `None` when the pass is exhausted
    fn next_batch(&mut self) -> anyhow::Result<Option<Batch>>;

    /// Number of samples, when known
    fn len_hint(&self) -> Option<usize>;
}

/// Indexed sample access backing a `DataLoader`.
pub trait Dataset: Sync {
    /// Number of samples
    fn len(&self) -> usize;

    /// Whether the dataset holds no samples
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-sample vector width
    fn dim(&self) -> usize;

    /// Decode sample `index` into (rainy, clean) vectors
    fn get(&self, index: usize) -> Result<(Vec<f32>, Vec<f32>)>;
}

/// Paired raindrop dataset: a directory of `.bin` files, listed in sorted
/// order, optionally truncated to `length` samples.
#[derive(Debug)]
pub struct RaindropDataset {
    files: Vec<PathBuf>,
    dim: usize,
}

impl RaindropDataset {
    /// Open a dataset directory
    pub fn open(dir: &Path, dim: usize, length: Option<usize>) -> Result<Self> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| Error::data(format!("cannot read {}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "bin"))
            .collect();
        files.sort();

        if let Some(length) = length {
            files.truncate(length);
        }
        if files.is_empty() {
            return Err(Error::data(format!("no .bin samples in {}", dir.display())));
        }

        debug!(dir = %dir.display(), samples = files.len(), "opened dataset");
        Ok(Self { files, dim })
    }
}

impl Dataset for RaindropDataset {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn get(&self, index: usize) -> Result<(Vec<f32>, Vec<f32>)> {
        let path = &self.files[index];
        let bytes = fs::read(path)?;
        let expected = 2 * self.dim * 4;
        if bytes.len() != expected {
            return Err(Error::data(format!(
                "{}: expected {} bytes, found {}",
                path.display(),
                expected,
                bytes.len()
            )));
        }

        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let (rainy, clean) = values.split_at(self.dim);
        Ok((rainy.to_vec(), clean.to_vec()))
    }
}

/// Sequential, unshuffled batcher over a dataset.
pub struct DataLoader<D: Dataset> {
    dataset: D,
    batch_size: usize,
    cursor: usize,
    pool: Option<rayon::ThreadPool>,
}

impl<D: Dataset> DataLoader<D> {
    /// Create a loader; `num_workers > 1` builds a dedicated decode pool.
    pub fn new(dataset: D, batch_size: usize, num_workers: usize) -> Result<Self> {
        let pool = if num_workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .build()
                .map_err(|e| Error::data(format!("failed to build decode pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            dataset,
            batch_size,
            cursor: 0,
            pool,
        })
    }

    /// The wrapped dataset
    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    fn decode(&self, indices: &[usize]) -> Result<Vec<(Vec<f32>, Vec<f32>)>> {
        match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&i| self.dataset.get(i))
                    .collect::<Result<Vec<_>>>()
            }),
            None => indices.iter().map(|&i| self.dataset.get(i)).collect(),
        }
    }
}

impl<D: Dataset> BatchSource for DataLoader<D> {
    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> anyhow::Result<Option<Batch>> {
        if self.cursor >= self.dataset.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.dataset.len());
        let indices: Vec<usize> = (self.cursor..end).collect();
        self.cursor = end;

        let samples = self.decode(&indices)?;
        let n = samples.len();
        let dim = self.dataset.dim();

        let mut inputs = Vec::with_capacity(n * dim);
        let mut targets = Vec::with_capacity(n * dim);
        for (rainy, clean) in samples {
            inputs.extend_from_slice(&rainy);
            targets.extend_from_slice(&clean);
        }

        Ok(Some(Batch {
            inputs: Array2::from_shape_vec((n, dim), inputs)?,
            targets: Array2::from_shape_vec((n, dim), targets)?,
        }))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.dataset.len())
    }
}

type DatasetCtor = fn(&Path, usize, Option<usize>) -> Result<RaindropDataset>;

/// Directory-basename patterns to dataset constructors, resolved once at
/// configuration time. Every pattern currently maps to the raindrop
/// reader; the table is the extension point for further paired datasets.
const DATASET_REGISTRY: &[(&str, DatasetCtor)] = &[("raindrop", RaindropDataset::open)];

fn dataset_ctor_for(dir: &Path) -> DatasetCtor {
    let basename = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    for (pattern, ctor) in DATASET_REGISTRY {
        if basename.contains(pattern) {
            return *ctor;
        }
    }
    RaindropDataset::open
}

/// Build a loader for an optional data root; an absent root builds nothing.
pub fn build_loader(
    dir: Option<&Path>,
    config: &DataConfig,
) -> Result<Option<DataLoader<RaindropDataset>>> {
    let Some(dir) = dir else {
        return Ok(None);
    };

    let ctor = dataset_ctor_for(dir);
    let dataset = ctor(dir, config.sample_dim, config.length)?;
    info!(
        dir = %dir.display(),
        samples = dataset.len(),
        batch_size = config.batch_size,
        "constructed data loader"
    );
    let loader = DataLoader::new(dataset, config.batch_size, config.num_workers)?;
    Ok(Some(loader))
}
