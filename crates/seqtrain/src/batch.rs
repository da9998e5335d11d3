use candle_core::{Device, Tensor};

use crate::error::{Result, TrainingError};

/// Labels for self-supervised pre-training batches.
#[derive(Debug, Clone)]
pub struct AuxLabels {
    pub hp_lengths: Tensor,
    pub is_hp: Tensor,
    pub hp_bases: Tensor,
}

/// One batch of signal chunks. Every tensor shares the batch size as its
/// leading dimension.
#[derive(Debug, Clone)]
pub enum Batch {
    Supervised {
        data: Tensor,
        targets: Tensor,
        lengths: Tensor,
        extra: Vec<Tensor>,
    },
    PreTraining {
        data: Tensor,
        labels: AuxLabels,
    },
}

impl Batch {
    pub fn supervised(data: Tensor, targets: Tensor, lengths: Tensor) -> Self {
        Batch::Supervised {
            data,
            targets,
            lengths,
            extra: Vec::new(),
        }
    }

    pub fn data(&self) -> &Tensor {
        match self {
            Batch::Supervised { data, .. } | Batch::PreTraining { data, .. } => data,
        }
    }

    pub fn is_pre_training(&self) -> bool {
        matches!(self, Batch::PreTraining { .. })
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.data().dim(0)?)
    }

    fn tensors(&self) -> Vec<&Tensor> {
        match self {
            Batch::Supervised {
                data,
                targets,
                lengths,
                extra,
            } => {
                let mut all = vec![data, targets, lengths];
                all.extend(extra.iter());
                all
            }
            Batch::PreTraining { data, labels } => {
                vec![data, &labels.hp_lengths, &labels.is_hp, &labels.hp_bases]
            }
        }
    }

    fn map_tensors<F>(&self, mut f: F) -> Result<Batch>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        Ok(match self {
            Batch::Supervised {
                data,
                targets,
                lengths,
                extra,
            } => Batch::Supervised {
                data: f(data)?,
                targets: f(targets)?,
                lengths: f(lengths)?,
                extra: extra.iter().map(&mut f).collect::<Result<Vec<_>>>()?,
            },
            Batch::PreTraining { data, labels } => Batch::PreTraining {
                data: f(data)?,
                labels: AuxLabels {
                    hp_lengths: f(&labels.hp_lengths)?,
                    is_hp: f(&labels.is_hp)?,
                    hp_bases: f(&labels.hp_bases)?,
                },
            },
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        self.map_tensors(|tensor| Ok(tensor.to_device(device)?))
    }

    /// Copies broadcast or strided tensors into contiguous storage.
    pub fn contiguous(&self) -> Result<Batch> {
        self.map_tensors(|tensor| Ok(tensor.contiguous()?))
    }

    /// Gathers the rows listed in `indices` (a 1-D integer tensor).
    pub fn select(&self, indices: &Tensor) -> Result<Batch> {
        self.map_tensors(|tensor| Ok(tensor.contiguous()?.index_select(indices, 0)?))
    }

    /// Splits along the batch axis into `parts` equally sized sub-batches.
    pub fn split(&self, parts: usize) -> Result<Vec<Batch>> {
        if parts == 0 {
            return Err(TrainingError::invalid_batch("cannot split a batch into zero parts"));
        }
        let size = self.batch_size()?;
        for tensor in self.tensors() {
            let leading = tensor.dim(0)?;
            if leading != size {
                return Err(TrainingError::invalid_batch(format!(
                    "tensor leading dimension {} does not match batch size {}",
                    leading, size
                )));
            }
        }
        if size % parts != 0 {
            return Err(TrainingError::invalid_batch(format!(
                "batch size {} is not divisible by {} sub-batches",
                size, parts
            )));
        }
        if parts == 1 {
            return Ok(vec![self.clone()]);
        }

        let chunk = size / parts;
        (0..parts)
            .map(|index| self.map_tensors(|tensor| Ok(tensor.narrow(0, index * chunk, chunk)?)))
            .collect()
    }
}
