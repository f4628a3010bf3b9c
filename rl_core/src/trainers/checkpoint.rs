// Checkpoint management - numbered model snapshots with retention
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TrainerError;
use crate::trainers::policy::PolicySnapshot;

/// On-disk form of a saved or exported model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub brain_name: String,
    pub behavior_id: String,
    pub step: u64,
    pub policy: PolicySnapshot,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    keep_checkpoints: usize,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TrainerError + '_ {
    move |source| TrainerError::CheckpointIo {
        path: path.to_path_buf(),
        source,
    }
}

impl CheckpointManager {
    /// The directory is created on first save.
    pub fn new(checkpoint_dir: impl Into<PathBuf>, keep_checkpoints: usize) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            keep_checkpoints,
        }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    fn file_stem(checkpoint: &ModelCheckpoint) -> String {
        checkpoint.behavior_id.replace(['?', '='], "_")
    }

    fn write(&self, path: &Path, checkpoint: &ModelCheckpoint) -> Result<(), TrainerError> {
        fs::create_dir_all(&self.checkpoint_dir).map_err(io_error(&self.checkpoint_dir))?;
        let json = serde_json::to_string_pretty(checkpoint)?;
        fs::write(path, json).map_err(io_error(path))
    }

    /// Writes `<dir>/<behavior>-<step>.json` and removes the oldest files
    /// beyond the retention limit.
    pub fn save_checkpoint(&self, checkpoint: &ModelCheckpoint) -> Result<PathBuf, TrainerError> {
        let stem = Self::file_stem(checkpoint);
        let path = self
            .checkpoint_dir
            .join(format!("{stem}-{}.json", checkpoint.step));
        self.write(&path, checkpoint)?;
        info!(
            brain = %checkpoint.brain_name,
            behavior_id = %checkpoint.behavior_id,
            step = checkpoint.step,
            path = %path.display(),
            "checkpoint saved"
        );
        self.cleanup_old_checkpoints(&stem)?;
        Ok(path)
    }

    /// Writes the final model as `<dir>/<behavior>.json`.
    pub fn export_model(&self, checkpoint: &ModelCheckpoint) -> Result<PathBuf, TrainerError> {
        let path = self
            .checkpoint_dir
            .join(format!("{}.json", Self::file_stem(checkpoint)));
        self.write(&path, checkpoint)?;
        info!(
            brain = %checkpoint.brain_name,
            behavior_id = %checkpoint.behavior_id,
            path = %path.display(),
            "model exported"
        );
        Ok(path)
    }

    fn numbered_checkpoints(&self, stem: &str) -> Result<Vec<(u64, PathBuf)>, TrainerError> {
        let re = Regex::new(&format!(r"^{}-(\d+)\.json$", regex::escape(stem)))?;
        let mut checkpoints = Vec::new();
        let entries = match fs::read_dir(&self.checkpoint_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(e) => return Err(io_error(&self.checkpoint_dir)(e)),
        };
        for entry in entries {
            let entry = entry.map_err(io_error(&self.checkpoint_dir))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(step) = re
                .captures(file_name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
            {
                checkpoints.push((step, entry.path()));
            }
        }
        // Newest first
        checkpoints.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(checkpoints)
    }

    fn cleanup_old_checkpoints(&self, stem: &str) -> Result<(), TrainerError> {
        let checkpoints = self.numbered_checkpoints(stem)?;
        for (_, old) in checkpoints.iter().skip(self.keep_checkpoints) {
            fs::remove_file(old).map_err(io_error(old))?;
            debug!(path = %old.display(), "removed old checkpoint");
        }
        Ok(())
    }

    /// Loads the newest numbered checkpoint of `behavior_id`, if any.
    pub fn latest(&self, behavior_id: &str) -> Result<Option<ModelCheckpoint>, TrainerError> {
        let stem = behavior_id.replace(['?', '='], "_");
        let Some((_, path)) = self.numbered_checkpoints(&stem)?.into_iter().next() else {
            return Ok(None);
        };
        let content = fs::read_to_string(&path).map_err(io_error(&path))?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(step: u64) -> ModelCheckpoint {
        ModelCheckpoint {
            brain_name: "Ball".into(),
            behavior_id: "Ball?team=0".into(),
            step,
            policy: PolicySnapshot { version: step, weights: vec![0.5; 4] },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn keeps_only_newest_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("Ball"), 2);
        for step in [10, 20, 30] {
            manager.save_checkpoint(&checkpoint(step)).unwrap();
        }
        let mut names: Vec<String> = fs::read_dir(manager.checkpoint_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Ball_team_0-20.json", "Ball_team_0-30.json"]);
    }

    #[test]
    fn export_is_not_counted_as_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 1);
        manager.save_checkpoint(&checkpoint(5)).unwrap();
        let exported = manager.export_model(&checkpoint(5)).unwrap();
        manager.save_checkpoint(&checkpoint(6)).unwrap();
        assert!(exported.exists());
        assert_eq!(manager.latest("Ball?team=0").unwrap().unwrap().step, 6);
    }

    #[test]
    fn latest_without_checkpoints_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("missing"), 3);
        assert!(manager.latest("Ball").unwrap().is_none());
    }
}
