//! Resume checkpoints
//!
//! After every completed group the job saves `checkpoint.json` in the
//! output directory. A later run over the same input and mapping resumes
//! after the recorded group; any other input discards the file. The file
//! is removed once a run completes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transfer::types::Counters;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Persisted resume state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identifies the interrupted run across resumes
    pub run_id: Uuid,
    /// Canonical path of the input file
    pub input_path: String,
    pub mapping: String,
    /// Index of the last fully processed group
    pub last_completed_group: usize,
    pub counters: Counters,
    /// Identity keys handled so far, with their first source line
    #[serde(default)]
    pub seen: HashMap<String, usize>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Group index to continue from
    pub fn next_group(&self) -> usize {
        self.last_completed_group + 1
    }
}

/// Canonical string form of an input path, used to match checkpoints
pub fn input_key(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Checkpoint file in an output directory
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint for `input` and `mapping`. A checkpoint written
    /// for anything else, or one that cannot be parsed, is cleared.
    pub fn load(&self, input: &Path, mapping: &str) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read checkpoint: {}", self.path.display()))?;

        let checkpoint: Checkpoint = match serde_json::from_str(&content) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Discarding unreadable checkpoint {}: {}", self.path.display(), e);
                self.clear()?;
                return Ok(None);
            }
        };

        let input = input_key(input);
        if checkpoint.input_path != input || checkpoint.mapping != mapping {
            info!(
                "Checkpoint belongs to {} ({}); starting over",
                checkpoint.input_path, checkpoint.mapping
            );
            self.clear()?;
            return Ok(None);
        }

        info!(
            "Resuming run {} after group {} (saved {})",
            checkpoint.run_id,
            checkpoint.last_completed_group,
            checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(Some(checkpoint))
    }

    /// Write the checkpoint atomically (temporary file, then rename)
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json =
            serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write checkpoint: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace checkpoint: {}", self.path.display()))?;
        debug!("Checkpoint at group {}", checkpoint.last_completed_group);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to remove checkpoint: {}", self.path.display())
            }),
        }
    }
}
