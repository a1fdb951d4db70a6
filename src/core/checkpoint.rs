//! Parameter checkpoints with a bounded retention window
//!
//! Each save writes `model.ckpt-<step>.json` into the checkpoint directory and
//! rewrites the `checkpoint` index, which lists the retained files newest last.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::neural_net::{NeuralNet, StateDict};
use crate::{NetError, Result};

const INDEX_FILE: &str = "checkpoint";
const PREFIX: &str = "model.ckpt-";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    model_checkpoint_path: Option<String>,
    all_model_checkpoint_paths: Vec<String>,
}

/// Serialized checkpoint contents
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Global step the checkpoint was taken at
    pub step: usize,
    /// RFC 3339 wall-clock time of the save
    pub saved_at: String,
    /// Monitored accuracy that triggered the save, if recorded
    #[serde(default)]
    pub accuracy: Option<f32>,
    /// Parameter tensors
    pub parameters: StateDict,
}

fn read_checkpoint(path: &Path) -> Result<CheckpointFile> {
    let contents = fs::read_to_string(path)
        .map_err(|e| NetError::Checkpoint(format!("{}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&contents)?)
}

fn read_index(dir: &Path) -> Result<Option<CheckpointIndex>> {
    let path = dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Writes checkpoints and keeps at most `max_to_keep` of them on disk.
#[derive(Debug)]
pub struct Saver {
    dir: PathBuf,
    max_to_keep: usize,
    kept: VecDeque<String>,
}

impl Saver {
    /// Saver keeping the 5 most recent checkpoints
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_max_to_keep(dir, 5)
    }

    /// Saver with an explicit retention window (at least 1)
    pub fn with_max_to_keep(dir: impl AsRef<Path>, max_to_keep: usize) -> Result<Self> {
        if max_to_keep == 0 {
            return Err(NetError::InvalidArgument("max_to_keep must be positive".into()));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let kept = read_index(&dir)?
            .map(|index| index.all_model_checkpoint_paths.into_iter().collect())
            .unwrap_or_default();
        Ok(Saver {
            dir,
            max_to_keep,
            kept,
        })
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Retained checkpoint paths, oldest first
    pub fn checkpoints(&self) -> Vec<PathBuf> {
        self.kept.iter().map(|name| self.dir.join(name)).collect()
    }

    /// Save the parameters of `net` at `step`
    pub fn save<N: NeuralNet>(&mut self, net: &N, step: usize) -> Result<PathBuf> {
        self.save_with_accuracy(net, step, None)
    }

    /// Save the parameters of `net` at `step`, recording the accuracy it reached
    pub fn save_with_accuracy<N: NeuralNet>(
        &mut self,
        net: &N,
        step: usize,
        accuracy: Option<f32>,
    ) -> Result<PathBuf> {
        let name = format!("{}{}.json", PREFIX, step);
        let path = self.dir.join(&name);
        let file = CheckpointFile {
            step,
            saved_at: chrono::Local::now().to_rfc3339(),
            accuracy,
            parameters: net.state_dict(),
        };
        fs::write(&path, serde_json::to_string(&file)?)?;

        self.kept.retain(|kept| kept != &name);
        self.kept.push_back(name.clone());
        while self.kept.len() > self.max_to_keep {
            if let Some(old) = self.kept.pop_front() {
                if let Err(e) = fs::remove_file(self.dir.join(&old)) {
                    warn!("could not remove old checkpoint {}: {}", old, e);
                }
            }
        }

        let index = CheckpointIndex {
            model_checkpoint_path: Some(name),
            all_model_checkpoint_paths: self.kept.iter().cloned().collect(),
        };
        fs::write(self.dir.join(INDEX_FILE), serde_json::to_string_pretty(&index)?)?;
        debug!("saved checkpoint {}", path.display());
        Ok(path)
    }

    /// Load the parameters stored at `path` into `net`; returns the saved step
    pub fn restore<N: NeuralNet>(net: &mut N, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let file = read_checkpoint(path)?;
        net.load_state_dict(&file.parameters)?;
        debug!("restored checkpoint {} (step {})", path.display(), file.step);
        Ok(file.step)
    }
}

/// Most recent checkpoint recorded in `dir`'s index, if any
pub fn latest_checkpoint(dir: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    let dir = dir.as_ref();
    Ok(read_index(dir)?
        .and_then(|index| index.model_checkpoint_path)
        .map(|name| dir.join(name)))
}

/// Accuracy recorded with the latest checkpoint in `dir`, if any
pub fn latest_accuracy(dir: impl AsRef<Path>) -> Result<Option<f32>> {
    match latest_checkpoint(dir)? {
        Some(path) => Ok(read_checkpoint(&path)?.accuracy),
        None => Ok(None),
    }
}

/// Restore the latest checkpoint in `dir` into `net`
pub fn restore_latest<N: NeuralNet>(net: &mut N, dir: impl AsRef<Path>) -> Result<usize> {
    let dir = dir.as_ref();
    let path = latest_checkpoint(dir)?
        .ok_or_else(|| NetError::Checkpoint(format!("no checkpoint in {}", dir.display())))?;
    Saver::restore(net, path)
}
