use std::{collections::HashMap, path::Path};

use candle_core::{Device, Tensor};
use futures::future::{self, BoxFuture, FutureExt};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    batch::{AuxLabels, Batch},
    config::TrainingConfig,
    error::{Result, TrainingError},
};

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>>;

    /// Rewinds to the start of a fresh pass.
    fn restart(&mut self) -> Result<()>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader {
    inner: Box<dyn DataLoader>,
}

impl BlockingDataLoader {
    pub fn new<L>(inner: L) -> Self
    where
        L: DataLoader + 'static,
    {
        Self {
            inner: Box::new(inner),
        }
    }

    pub fn from_boxed(inner: Box<dyn DataLoader>) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn restart(&mut self) -> Result<()> {
        self.inner.restart()
    }
}

/// Serves fixed-size batches from chunks held in memory. The ragged tail
/// that cannot fill a batch is dropped.
pub struct ChunkDataLoader {
    dataset: Batch,
    device: Device,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    passes: u64,
    order: Vec<u32>,
    cursor: usize,
}

impl ChunkDataLoader {
    pub fn new(
        dataset: Batch,
        device: Device,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization("batch size must be greater than 0"));
        }
        // Splitting into one part checks that every tensor agrees on the
        // number of chunks.
        dataset.split(1)?;
        // Row gathers need contiguous storage; copy once up front.
        let dataset = dataset.contiguous()?;
        let total = dataset.batch_size()?;
        let mut loader = Self {
            dataset,
            device,
            batch_size,
            shuffle,
            seed,
            passes: 0,
            order: (0..total as u32).collect(),
            cursor: 0,
        };
        loader.reorder();
        Ok(loader)
    }

    /// Reads `chunks` plus either `targets`/`lengths` (or the
    /// `references`/`reference_lengths` aliases) or, for pre-training, the
    /// `hp_lengths`/`is_hp`/`hp_bases` labels.
    pub fn from_safetensors(
        path: &Path,
        device: Device,
        batch_size: usize,
        pre_training: bool,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|err| TrainingError::checkpoint(path, err.to_string()))?;
        let mut take = |names: &[&str]| -> Result<Tensor> {
            names
                .iter()
                .find_map(|name| tensors.remove(*name))
                .ok_or_else(|| {
                    TrainingError::initialization(format!(
                        "{} has no `{}` tensor",
                        path.display(),
                        names.join("` or `")
                    ))
                })
        };

        let dataset = if pre_training {
            Batch::PreTraining {
                data: take(&["chunks"])?,
                labels: AuxLabels {
                    hp_lengths: take(&["hp_lengths"])?,
                    is_hp: take(&["is_hp"])?,
                    hp_bases: take(&["hp_bases"])?,
                },
            }
        } else {
            Batch::supervised(
                take(&["chunks"])?,
                take(&["targets", "references"])?,
                take(&["lengths", "reference_lengths"])?,
            )
        };
        log_unused(path, &tensors);

        Self::new(dataset, device, batch_size, shuffle, seed)
    }

    /// Number of chunks held.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn reorder(&mut self) {
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.passes));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
    }

    fn take_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor + self.batch_size > self.order.len() {
            return Ok(None);
        }
        let rows = &self.order[self.cursor..self.cursor + self.batch_size];
        let indices = Tensor::from_slice(rows, rows.len(), self.dataset.data().device())?;
        self.cursor += self.batch_size;
        let batch = self.dataset.select(&indices)?;
        Ok(Some(batch.to_device(&self.device)?))
    }
}

impl DataLoader for ChunkDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        future::ready(self.take_batch()).boxed()
    }

    fn restart(&mut self) -> Result<()> {
        self.passes += 1;
        self.reorder();
        Ok(())
    }
}

/// Training and validation loaders for the chunk files named in `config`.
/// Validation data is never shuffled.
pub fn loaders_from_config(
    config: &TrainingConfig,
    device: &Device,
) -> Result<(BlockingDataLoader, BlockingDataLoader)> {
    fn required<'p>(path: Option<&'p Path>, name: &str) -> Result<&'p Path> {
        path.ok_or_else(|| TrainingError::initialization(format!("data.{name} is not set")))
    }

    let data = &config.data;
    let train = ChunkDataLoader::from_safetensors(
        required(data.train_path.as_deref(), "train_path")?,
        device.clone(),
        data.batch_size,
        data.pre_training,
        data.shuffle,
        config.runtime.seed,
    )?;
    let valid = ChunkDataLoader::from_safetensors(
        required(data.valid_path.as_deref(), "valid_path")?,
        device.clone(),
        data.batch_size,
        data.pre_training,
        false,
        config.runtime.seed,
    )?;
    tracing::info!(
        train_chunks = train.len(),
        valid_chunks = valid.len(),
        batch_size = data.batch_size,
        "chunk data loaded"
    );
    Ok((BlockingDataLoader::new(train), BlockingDataLoader::new(valid)))
}

fn log_unused(path: &Path, remaining: &HashMap<String, Tensor>) {
    if !remaining.is_empty() {
        let mut names: Vec<_> = remaining.keys().map(String::as_str).collect();
        names.sort_unstable();
        tracing::debug!(path = %path.display(), unused = ?names, "ignoring extra tensors");
    }
}
