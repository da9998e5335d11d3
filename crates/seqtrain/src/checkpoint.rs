//! Per-epoch checkpoint files in a flat working directory.
//!
//! Weights go to `weights_<epoch>.safetensors`; optimizer state, when saved,
//! goes to `optim_<epoch>.json`. The epoch index is always recoverable from
//! the file name.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use candle_core::{
    safetensors::{load as load_safetensors, save as save_safetensors},
    Device,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{Result, TrainingError},
    model::SequenceModel,
    optimizer::{OptimizerState, TrainerOptimizer},
    remap::NameMatcher,
};

pub const WEIGHTS_PREFIX: &str = "weights";
pub const WEIGHTS_EXTENSION: &str = "safetensors";
pub const OPTIMIZER_PREFIX: &str = "optim";
pub const OPTIMIZER_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDescriptor {
    pub epoch: usize,
    pub weights: PathBuf,
    pub optimizer: Option<PathBuf>,
}

/// Checkpoint files found in a working directory, keyed by epoch.
#[derive(Debug, Clone, Default)]
pub struct CheckpointIndex {
    weights: BTreeMap<usize, PathBuf>,
    optimizer: BTreeMap<usize, PathBuf>,
}

impl CheckpointIndex {
    /// A missing directory scans as empty.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut index = Self::default();
        if !dir.is_dir() {
            return Ok(index);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(epoch) = parse_epoch(name, WEIGHTS_PREFIX, WEIGHTS_EXTENSION) {
                index.weights.insert(epoch, entry.path());
            } else if let Some(epoch) = parse_epoch(name, OPTIMIZER_PREFIX, OPTIMIZER_EXTENSION) {
                index.optimizer.insert(epoch, entry.path());
            }
        }
        Ok(index)
    }

    pub fn weight_epochs(&self) -> BTreeSet<usize> {
        self.weights.keys().copied().collect()
    }

    pub fn optimizer_epochs(&self) -> BTreeSet<usize> {
        self.optimizer.keys().copied().collect()
    }

    /// Latest epoch with weights (and optimizer state, when requested).
    /// Epoch 0 never counts as a resume point.
    pub fn resume_point(&self, with_optimizer: bool) -> Option<CheckpointDescriptor> {
        let latest = if with_optimizer {
            self.weights
                .keys()
                .filter(|epoch| self.optimizer.contains_key(*epoch))
                .max()
                .copied()
        } else {
            self.weights.keys().max().copied()
        };
        let epoch = latest.filter(|epoch| *epoch > 0)?;

        Some(CheckpointDescriptor {
            epoch,
            weights: self.weights[&epoch].clone(),
            optimizer: if with_optimizer {
                self.optimizer.get(&epoch).cloned()
            } else {
                None
            },
        })
    }
}

/// Extracts `N` from `<prefix>_<N>.<extension>`.
pub fn parse_epoch(file_name: &str, prefix: &str, extension: &str) -> Option<usize> {
    let digits = file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(extension)?
        .strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn weights_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("{WEIGHTS_PREFIX}_{epoch}.{WEIGHTS_EXTENSION}"))
}

pub fn optimizer_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("{OPTIMIZER_PREFIX}_{epoch}.{OPTIMIZER_EXTENSION}"))
}

/// Loads the newest usable checkpoint into `model` (and `optimizer`) and
/// returns its epoch, or 0 when starting from scratch.
pub fn resume<M>(
    dir: &Path,
    device: &Device,
    model: &M,
    optimizer: Option<&mut TrainerOptimizer>,
    matcher: &dyn NameMatcher,
) -> Result<usize>
where
    M: SequenceModel + ?Sized,
{
    let index = CheckpointIndex::scan(dir)?;
    let Some(descriptor) = index.resume_point(optimizer.is_some()) else {
        return Ok(0);
    };

    tracing::info!(
        epoch = descriptor.epoch,
        weights = %descriptor.weights.display(),
        "picking up training from checkpoint"
    );
    load_weights(&descriptor.weights, device, model, matcher)?;

    if let (Some(optimizer), Some(path)) = (optimizer, descriptor.optimizer.as_ref()) {
        let state: OptimizerState = read_json(path)?;
        optimizer
            .load_state(state)
            .map_err(|err| TrainingError::checkpoint(path, err.to_string()))?;
    }

    Ok(descriptor.epoch)
}

pub fn load_weights<M>(
    path: &Path,
    device: &Device,
    model: &M,
    matcher: &dyn NameMatcher,
) -> Result<()>
where
    M: SequenceModel + ?Sized,
{
    let stored = load_safetensors(path, device)
        .map_err(|err| TrainingError::checkpoint(path, err.to_string()))?;
    let live = model.parameters();

    let stored_shapes: Vec<_> = stored
        .iter()
        .map(|(name, tensor)| (name.clone(), tensor.dims().to_vec()))
        .collect();
    let live_shapes: Vec<_> = live
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().dims().to_vec()))
        .collect();
    let mapping = matcher
        .remap(&stored_shapes, &live_shapes)
        .map_err(|err| TrainingError::checkpoint(path, err.to_string()))?;

    let mut by_live_name: HashMap<String, candle_core::Tensor> = stored
        .into_iter()
        .filter_map(|(name, tensor)| mapping.get(&name).map(|live| (live.clone(), tensor)))
        .collect();

    for (name, var) in live {
        let tensor = by_live_name.remove(&name).ok_or_else(|| {
            TrainingError::checkpoint(path, format!("missing parameter {name}"))
        })?;
        let desired = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired {
            tensor
        } else {
            tensor.to_dtype(desired)?
        };
        var.set(&tensor)?;
    }

    Ok(())
}

pub fn save_weights<M>(dir: &Path, epoch: usize, model: &M) -> Result<PathBuf>
where
    M: SequenceModel + ?Sized,
{
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<_, _> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();

    fs::create_dir_all(dir)?;
    let path = weights_path(dir, epoch);
    let staging = path.with_extension(format!("{WEIGHTS_EXTENSION}.tmp"));
    save_safetensors(&tensors, &staging)
        .map_err(|err| TrainingError::checkpoint(&staging, err.to_string()))?;
    fs::rename(&staging, &path)?;
    tracing::debug!(epoch, path = %path.display(), "saved weights");
    Ok(path)
}

pub fn save_optimizer(dir: &Path, epoch: usize, optimizer: &TrainerOptimizer) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = optimizer_path(dir, epoch);
    let staging = path.with_extension(format!("{OPTIMIZER_EXTENSION}.tmp"));
    write_json(&staging, &optimizer.state()?)?;
    fs::rename(&staging, &path)?;
    tracing::debug!(epoch, path = %path.display(), "saved optimizer state");
    Ok(path)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value)
        .map_err(|err| TrainingError::checkpoint(path, err.to_string()))?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|err| TrainingError::checkpoint(path, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_epoch_from_well_formed_names() {
        assert_eq!(parse_epoch("weights_12.safetensors", "weights", "safetensors"), Some(12));
        assert_eq!(parse_epoch("optim_3.json", "optim", "json"), Some(3));
        assert_eq!(parse_epoch("weights_.safetensors", "weights", "safetensors"), None);
        assert_eq!(parse_epoch("weights_1a.safetensors", "weights", "safetensors"), None);
        assert_eq!(parse_epoch("weights_-1.safetensors", "weights", "safetensors"), None);
        assert_eq!(
            parse_epoch("weights_4.safetensors.tmp", "weights", "safetensors"),
            None
        );
        assert_eq!(parse_epoch("weights_4.json", "weights", "safetensors"), None);
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn resume_point_uses_intersection_when_optimizer_requested() {
        let tmp = tempdir().unwrap();
        for epoch in 1..=5 {
            touch(tmp.path(), &format!("weights_{epoch}.safetensors"));
        }
        touch(tmp.path(), "optim_3.json");
        touch(tmp.path(), "notes.txt");
        touch(tmp.path(), "weights_final.safetensors");

        let index = CheckpointIndex::scan(tmp.path()).unwrap();
        let with_optim = index.resume_point(true).unwrap();
        assert_eq!(with_optim.epoch, 3);
        assert_eq!(with_optim.optimizer, Some(optimizer_path(tmp.path(), 3)));

        let weights_only = index.resume_point(false).unwrap();
        assert_eq!(weights_only.epoch, 5);
        assert_eq!(weights_only.optimizer, None);
    }

    #[test]
    fn no_overlap_means_cold_start() {
        let tmp = tempdir().unwrap();
        touch(tmp.path(), "weights_2.safetensors");
        touch(tmp.path(), "optim_1.json");
        let index = CheckpointIndex::scan(tmp.path()).unwrap();
        assert!(index.resume_point(true).is_none());
        assert_eq!(index.resume_point(false).unwrap().epoch, 2);
    }

    #[test]
    fn missing_directory_scans_empty() {
        let tmp = tempdir().unwrap();
        let index = CheckpointIndex::scan(&tmp.path().join("absent")).unwrap();
        assert!(index.weight_epochs().is_empty());
        assert!(index.resume_point(false).is_none());
    }
}
