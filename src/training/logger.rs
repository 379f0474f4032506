//! Metrics and artifact logging
//!
//! The driver talks to an injected `MetricsLogger` handle instead of a
//! process-wide writer. The shipped implementation appends scalars as a
//! JSONL stream and writes visualization grids as PGM images; each tag is
//! an independent series, so sparse or varying key sets between steps are
//! fine.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A grayscale image grid produced by the model collaborator's
/// visualization step, values in [0, 1], row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageGrid {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f32>,
}

impl ImageGrid {
    /// Create a grid; panics in debug builds if the buffer does not match
    /// the dimensions.
    pub fn new(width: usize, height: usize, pixels: Vec<f32>) -> Self {
        debug_assert_eq!(pixels.len(), width * height);
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// Sink for per-iteration scalars and visualization artifacts.
pub trait MetricsLogger {
    /// Record a scalar under a tag at a step
    fn log_scalar(&mut self, tag: &str, value: f64, step: i64) -> Result<()>;

    /// Record an image grid under a tag at a step
    fn log_image(&mut self, tag: &str, image: &ImageGrid, step: i64) -> Result<()>;
}

/// One line of the scalar stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f64,
    pub step: i64,
}

/// File-backed logger: scalars go to `<logs_dir>/scalars.jsonl`, images to
/// `<vis_dir>/<tag>_<step>.pgm`.
pub struct JsonlLogger {
    scalars: BufWriter<File>,
    vis_dir: PathBuf,
}

impl JsonlLogger {
    /// Open the logger, creating both directories if needed
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(logs_dir: P, vis_dir: Q) -> Result<Self> {
        let logs_dir = logs_dir.as_ref();
        let vis_dir = vis_dir.as_ref().to_path_buf();
        fs::create_dir_all(logs_dir)
            .with_context(|| format!("failed to create logs dir {}", logs_dir.display()))?;
        fs::create_dir_all(&vis_dir)
            .with_context(|| format!("failed to create vis dir {}", vis_dir.display()))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join("scalars.jsonl"))
            .context("failed to open scalar stream")?;

        Ok(Self {
            scalars: BufWriter::new(file),
            vis_dir,
        })
    }

    fn write_pgm(path: &Path, image: &ImageGrid) -> Result<()> {
        let mut out = Vec::with_capacity(32 + image.pixels.len());
        out.extend_from_slice(format!("P5\n{} {}\n255\n", image.width, image.height).as_bytes());
        out.extend(
            image
                .pixels
                .iter()
                .map(|&p| (p.clamp(0.0, 1.0) * 255.0).round() as u8),
        );
        fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

impl MetricsLogger for JsonlLogger {
    fn log_scalar(&mut self, tag: &str, value: f64, step: i64) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
        };
        serde_json::to_writer(&mut self.scalars, &record)?;
        self.scalars.write_all(b"\n")?;
        self.scalars.flush()?;
        Ok(())
    }

    fn log_image(&mut self, tag: &str, image: &ImageGrid, step: i64) -> Result<()> {
        let name = format!("{}_{:08}.pgm", tag.replace('/', "_"), step);
        Self::write_pgm(&self.vis_dir.join(name), image)
    }
}
