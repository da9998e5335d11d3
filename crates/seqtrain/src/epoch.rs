use std::time::{Duration, Instant};

use crate::{
    config::TrainingConfig,
    data::BlockingDataLoader,
    error::Result,
    logging::{epoch_progress, CsvLogger, LrValue, StepLogEntry},
    loss::PRIMARY_LOSS,
    metrics::LossSmoother,
    model::{Criterion, SequenceModel},
    step::StepExecutor,
    trainer::TrainingState,
};

const CTC_LOSS: &str = "ctc_loss";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochTraining {
    /// Exponentially smoothed primary loss at the end of the epoch.
    pub smoothed_loss: f64,
    pub duration: Duration,
    pub steps: usize,
}

/// Drives one epoch worth of optimizer steps.
#[derive(Debug, Clone, Copy)]
pub struct EpochRunner {
    steps_per_epoch: usize,
    chunks_per_epoch: usize,
    pre_training: bool,
}

impl EpochRunner {
    pub fn new(steps_per_epoch: usize, chunks_per_epoch: usize, pre_training: bool) -> Self {
        Self {
            steps_per_epoch,
            chunks_per_epoch,
            pre_training,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.steps_per_epoch(),
            config.data.chunks_per_epoch,
            config.data.pre_training,
        )
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn run_epoch<M>(
        &self,
        executor: &mut StepExecutor,
        model: &M,
        criterion: Option<&dyn Criterion>,
        loader: &mut BlockingDataLoader,
        state: &mut TrainingState,
        mut loss_log: Option<&mut CsvLogger>,
    ) -> Result<EpochTraining>
    where
        M: SequenceModel + ?Sized,
    {
        let started = Instant::now();
        loader.restart()?;

        let progress = epoch_progress(self.steps_per_epoch);
        progress.set_prefix(format!("[0/{}]", self.chunks_per_epoch));

        let mut smoother = LossSmoother::default();
        let mut chunks = 0usize;
        let mut steps = 0usize;
        while steps < self.steps_per_epoch {
            let Some(batch) = loader.next_batch()? else {
                tracing::warn!(
                    steps,
                    expected = self.steps_per_epoch,
                    "training data ran out before the end of the epoch"
                );
                break;
            };
            chunks += batch.batch_size()?;

            let rates = state.scheduler.last_lr().to_vec();
            state.optimizer.set_learning_rates(&rates)?;
            let output = executor.step(model, criterion, &mut state.optimizer, &batch)?;
            steps += 1;

            smoother.update(&output.losses);
            progress.set_message(progress_postfix(&smoother, self.pre_training));
            progress.set_prefix(format!("[{}/{}]", chunks, self.chunks_per_epoch));
            progress.inc(1);

            if let Some(log) = loss_log.as_deref_mut() {
                log.append(&StepLogEntry {
                    chunks,
                    time: started.elapsed().as_secs_f64(),
                    grad_norm: output.grad_norm,
                    lr: LrValue::from(rates.as_slice()),
                    scale: output.scale,
                    losses: output.losses,
                })?;
            }

            state.scheduler.step();
        }
        state.optimizer.set_learning_rates(state.scheduler.last_lr())?;
        progress.finish();

        Ok(EpochTraining {
            smoothed_loss: smoother.get(PRIMARY_LOSS).unwrap_or(0.0),
            duration: started.elapsed(),
            steps,
        })
    }
}

/// Progress bar message: the smoothed primary loss, or in pre-training every
/// smoothed component except the CTC term.
pub(crate) fn progress_postfix(smoother: &LossSmoother, pre_training: bool) -> String {
    if !pre_training {
        return format!("loss={:.4}", smoother.get(PRIMARY_LOSS).unwrap_or(0.0));
    }
    smoother
        .iter()
        .filter(|(name, _)| *name != CTC_LOSS)
        .map(|(name, value)| {
            let short = name.strip_suffix("_loss").unwrap_or(name);
            format!("{short}={value:.4}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
