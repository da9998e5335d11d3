//! Interfaces the trainer drives. Architectures live outside this crate.

use candle_core::{DType, Tensor, Var};

use crate::{
    batch::AuxLabels,
    error::{Result, TrainingError},
    loss::LossOutput,
};

/// Per-call forward settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardContext {
    pub training: bool,
    /// Reduced precision requested for the forward computation. `F32` when
    /// mixed precision is off.
    pub dtype: DType,
}

impl ForwardContext {
    pub fn train(dtype: DType) -> Self {
        Self {
            training: true,
            dtype,
        }
    }

    pub fn eval(dtype: DType) -> Self {
        Self {
            training: false,
            dtype,
        }
    }
}

/// Raw model output: per-frame scores laid out `[T, N, C]`, or named tensors
/// where the scores live under `logits`.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Scores(Tensor),
    Named(Vec<(String, Tensor)>),
}

impl ModelOutput {
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        match self {
            ModelOutput::Scores(scores) if name == "logits" => Some(scores),
            ModelOutput::Scores(_) => None,
            ModelOutput::Named(entries) => entries
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, tensor)| tensor),
        }
    }

    pub fn scores(&self) -> Result<&Tensor> {
        self.get("logits")
            .ok_or_else(|| TrainingError::runtime("model output has no `logits` entry"))
    }
}

/// Static facts about a model that change how it is validated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCapabilities {
    /// Reference bases consumed as left context, trimmed before scoring.
    pub n_pre_context_bases: usize,
    /// Reference bases consumed as right context, trimmed before scoring.
    pub n_post_context_bases: usize,
    /// Whether [`SequenceModel::decode_batch`] is implemented.
    pub batch_decode: bool,
}

pub trait SequenceModel {
    fn forward(&self, input: &Tensor, extra: &[Tensor], ctx: &ForwardContext)
        -> Result<ModelOutput>;

    /// Forward pass for self-supervised batches; the model receives the
    /// auxiliary labels directly.
    fn forward_pretraining(
        &self,
        _input: &Tensor,
        _labels: &AuxLabels,
        _ctx: &ForwardContext,
    ) -> Result<ModelOutput> {
        Err(TrainingError::runtime(
            "model does not support pre-training batches",
        ))
    }

    /// Default criterion, used when the trainer is not given one.
    fn loss(
        &self,
        output: &ModelOutput,
        targets: Option<&Tensor>,
        lengths: Option<&Tensor>,
    ) -> Result<LossOutput>;

    /// Decodes `[T, C]` scores for one example.
    fn decode(&self, scores: &Tensor) -> Result<String>;

    /// Decodes `[T, N, C]` scores for a whole batch.
    fn decode_batch(&self, _scores: &Tensor) -> Result<Vec<String>> {
        Err(TrainingError::runtime("model does not support batch decoding"))
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::default()
    }

    /// Symbols indexed by label id; index 0 is the blank.
    fn alphabet(&self) -> &[String];

    fn parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;
}

/// Loss function supplied separately from the model.
pub trait Criterion {
    fn loss(
        &self,
        output: &ModelOutput,
        targets: Option<&Tensor>,
        lengths: Option<&Tensor>,
    ) -> Result<LossOutput>;
}

impl<F> Criterion for F
where
    F: Fn(&ModelOutput, Option<&Tensor>, Option<&Tensor>) -> Result<LossOutput>,
{
    fn loss(
        &self,
        output: &ModelOutput,
        targets: Option<&Tensor>,
        lengths: Option<&Tensor>,
    ) -> Result<LossOutput> {
        self(output, targets, lengths)
    }
}

pub(crate) fn compute_loss<M: SequenceModel + ?Sized>(
    model: &M,
    criterion: Option<&dyn Criterion>,
    output: &ModelOutput,
    targets: Option<&Tensor>,
    lengths: Option<&Tensor>,
) -> Result<LossOutput> {
    match criterion {
        Some(criterion) => criterion.loss(output, targets, lengths),
        None => model.loss(output, targets, lengths),
    }
}
