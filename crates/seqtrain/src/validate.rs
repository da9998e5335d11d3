//! Held-out loss and read accuracy after each epoch.

use candle_core::{DType, Tensor};

use crate::{
    accuracy::{AccuracyMetric, AlignmentAccuracy},
    batch::Batch,
    data::BlockingDataLoader,
    decode::{decode_targets, trim_context},
    error::{Result, TrainingError},
    loss::LossRecord,
    metrics::{mean, summarize},
    model::{compute_loss, Criterion, ForwardContext, ModelOutput, SequenceModel},
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValidationSummary {
    /// Mean of the per-batch primary losses.
    pub loss: f64,
    pub mean_accuracy: f64,
    pub median_accuracy: f64,
}

pub struct Validator {
    dtype: DType,
    metric: Box<dyn AccuracyMetric>,
}

impl Validator {
    pub fn new(dtype: DType, min_coverage: f64) -> Self {
        Self::with_metric(dtype, Box::new(AlignmentAccuracy::new(min_coverage)))
    }

    pub fn with_metric(dtype: DType, metric: Box<dyn AccuracyMetric>) -> Self {
        Self { dtype, metric }
    }

    /// Runs the whole validation stream with the model in eval mode; the
    /// previous mode is restored even when the pass fails.
    pub fn validate_epoch<M>(
        &self,
        model: &mut M,
        criterion: Option<&dyn Criterion>,
        loader: &mut BlockingDataLoader,
    ) -> Result<ValidationSummary>
    where
        M: SequenceModel + ?Sized,
    {
        let was_training = model.is_training();
        model.set_training(false);
        let summary = self.evaluate(&*model, criterion, loader);
        model.set_training(was_training);
        summary
    }

    fn evaluate<M>(
        &self,
        model: &M,
        criterion: Option<&dyn Criterion>,
        loader: &mut BlockingDataLoader,
    ) -> Result<ValidationSummary>
    where
        M: SequenceModel + ?Sized,
    {
        loader.restart()?;
        let ctx = ForwardContext::eval(self.dtype);

        let mut losses = Vec::new();
        let mut accuracies = Vec::new();
        let mut pre_training = false;
        while let Some(batch) = loader.next_batch()? {
            match &batch {
                Batch::PreTraining { data, labels } => {
                    pre_training = true;
                    let output = model.forward_pretraining(data, labels, &ctx)?;
                    let record = compute_loss(model, criterion, &output, None, None)?
                        .resolve()?
                        .record;
                    losses.push(primary(&record)?);
                }
                Batch::Supervised {
                    data,
                    targets,
                    lengths,
                    extra,
                } => {
                    let output = model.forward(data, extra, &ctx)?;
                    let record =
                        compute_loss(model, criterion, &output, Some(targets), Some(lengths))?
                            .resolve()?
                            .record;
                    losses.push(primary(&record)?);
                    accuracies.extend(self.score_batch(model, &output, targets)?);
                }
            }
        }

        if losses.is_empty() {
            return Err(TrainingError::runtime("validation data produced no batches"));
        }
        let loss = mean(&losses);
        if pre_training {
            return Ok(ValidationSummary {
                loss,
                ..ValidationSummary::default()
            });
        }

        let accuracy = summarize(&accuracies);
        Ok(ValidationSummary {
            loss,
            mean_accuracy: accuracy.mean,
            median_accuracy: accuracy.median,
        })
    }

    fn score_batch<M>(&self, model: &M, output: &ModelOutput, targets: &Tensor) -> Result<Vec<f64>>
    where
        M: SequenceModel + ?Sized,
    {
        let scores = output.scores()?;
        let capabilities = model.capabilities();

        let sequences = if capabilities.batch_decode {
            model.decode_batch(scores)?
        } else {
            let batch = scores.dim(1)?;
            (0..batch)
                .map(|index| model.decode(&scores.narrow(1, index, 1)?.squeeze(1)?))
                .collect::<Result<Vec<_>>>()?
        };

        let mut references = decode_targets(targets, model.alphabet())?;
        let (pre, post) = (
            capabilities.n_pre_context_bases,
            capabilities.n_post_context_bases,
        );
        if pre > 0 || post > 0 {
            references = references
                .iter()
                .map(|reference| trim_context(reference, pre, post))
                .collect();
        }

        if sequences.len() != references.len() {
            return Err(TrainingError::runtime(format!(
                "decoded {} sequences for {} references",
                sequences.len(),
                references.len()
            )));
        }

        Ok(references
            .iter()
            .zip(&sequences)
            .map(|(reference, sequence)| {
                if sequence.is_empty() {
                    0.0
                } else {
                    self.metric.score(reference, sequence)
                }
            })
            .collect())
    }
}

fn primary(record: &LossRecord) -> Result<f64> {
    record
        .primary()
        .ok_or_else(|| TrainingError::runtime("validation loss has no `loss` entry"))
}
