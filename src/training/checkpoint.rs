//! Checkpoint persistence
//!
//! Named slots under one directory, one bincode-encoded file per slot.
//! Writes go through a temp-file-then-rename sequence so a reader never
//! observes a partially written record and a failed save never corrupts
//! the previous record for that slot.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// A persisted training checkpoint: the run counters, the best validation
/// metric, and the model collaborator's opaque state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Epoch counter at save time
    pub epoch_it: i64,

    /// Global iteration counter at save time
    pub it: i64,

    /// Best validation metric seen so far
    pub loss_val_best: f64,

    /// Opaque model/optimizer state supplied by the model collaborator
    pub model_state: Vec<u8>,

    /// When the record was written
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Build a record for the given counters and model blob
    pub fn new(epoch_it: i64, it: i64, loss_val_best: f64, model_state: Vec<u8>) -> Self {
        Self {
            epoch_it,
            it,
            loss_val_best,
            model_state,
            created_at: Utc::now(),
        }
    }
}

/// Slot-addressed checkpoint store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open a store, creating the root directory if needed
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The store's root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing a slot
    pub fn slot_path(&self, slot: &str) -> PathBuf {
        self.root.join(format!("{}.ckpt", slot))
    }

    /// Whether a slot has ever been written
    pub fn exists(&self, slot: &str) -> bool {
        self.slot_path(slot).is_file()
    }

    /// Load the record for a slot. A slot that has never been written
    /// yields `CheckpointNotFound`, which the driver treats as a fresh
    /// run rather than a failure.
    pub fn load(&self, slot: &str) -> Result<CheckpointRecord> {
        let path = self.slot_path(slot);
        if !path.is_file() {
            return Err(Error::CheckpointNotFound {
                slot: slot.to_string(),
            });
        }
        let bytes = fs::read(&path)?;
        let record = bincode::deserialize(&bytes)?;
        debug!(slot, path = %path.display(), "loaded checkpoint");
        Ok(record)
    }

    /// Durably persist a record under a slot. All-or-nothing visibility:
    /// the record is written to a temp file and renamed into place.
    pub fn save(&self, slot: &str, record: &CheckpointRecord) -> Result<()> {
        let path = self.slot_path(slot);
        let tmp_path = path.with_extension("ckpt.tmp");

        let bytes = bincode::serialize(record)?;
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &path)?;

        debug!(slot, bytes = bytes.len(), "saved checkpoint");
        Ok(())
    }

    /// Copy an existing slot to a stable, human-identifiable slot,
    /// independent of numbered periodic backups. A missing source is a
    /// no-op: there is nothing to promote the first time a best model is
    /// found.
    pub fn promote_best(&self, source_slot: &str, dest_slot: &str) -> Result<()> {
        let source = self.slot_path(source_slot);
        if !source.is_file() {
            debug!(slot = source_slot, "no existing record to promote");
            return Ok(());
        }

        let dest = self.slot_path(dest_slot);
        let tmp_dest = dest.with_extension("ckpt.tmp");
        fs::copy(&source, &tmp_dest)?;
        fs::rename(&tmp_dest, &dest)?;

        debug!(from = source_slot, to = dest_slot, "promoted checkpoint");
        Ok(())
    }
}
