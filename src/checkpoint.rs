use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_nn::VarMap;

use crate::error::TrainerError;

const CHECKPOINT_PREFIX: &str = "occnet_weights_";
const CHECKPOINT_EXTENSION: &str = "safetensors";

/// File path for the checkpoint embedding the given 1-based epoch count.
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("{CHECKPOINT_PREFIX}{epoch}.{CHECKPOINT_EXTENSION}"))
}

/// Epoch number embedded in a checkpoint file name, if the name matches the
/// `occnet_weights_<epoch>.safetensors` pattern.
pub fn parse_epoch(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(CHECKPOINT_EXTENSION)?.strip_suffix('.')?;
    let digits = stem.strip_prefix(CHECKPOINT_PREFIX)?;
    digits.parse().ok()
}

/// Scans `dir` for checkpoint files and returns the one with the maximum
/// embedded epoch number together with that number. The result does not
/// depend on directory iteration order.
pub fn latest_checkpoint(dir: &Path) -> anyhow::Result<(PathBuf, usize)> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read checkpoint directory: {}", dir.display()))?;

    let mut best: Option<(PathBuf, usize)> = None;
    for entry in entries {
        let path = entry?.path();
        if let Some(epoch) = parse_epoch(&path) {
            if best.as_ref().map_or(true, |(_, max)| epoch > *max) {
                best = Some((path, epoch));
            }
        }
    }

    best.ok_or_else(|| {
        TrainerError::CheckpointNotFound {
            dir: dir.to_path_buf(),
        }
        .into()
    })
}

/// Serializes the model parameter state to an epoch-named file in `dir`.
pub fn save_checkpoint(varmap: &VarMap, dir: &Path, epoch: usize) -> anyhow::Result<PathBuf> {
    let path = checkpoint_path(dir, epoch);
    varmap
        .save(&path)
        .with_context(|| format!("Failed writing checkpoint: {}", path.display()))?;
    Ok(path)
}

/// Restores parameter state from `path` into the model's existing variables.
pub fn load_checkpoint(varmap: &mut VarMap, path: &Path) -> anyhow::Result<()> {
    varmap
        .load(path)
        .with_context(|| format!("Failed loading checkpoint: {}", path.display()))
}
