use std::{fs, path::Path, time::Duration};

use candle_core::Device;
use chrono::Local;

use crate::{
    checkpoint,
    config::{LearningRate, OptimizerConfig, TrainingConfig},
    data::{loaders_from_config, BlockingDataLoader},
    device::select_device,
    epoch::{EpochRunner, EpochTraining},
    error::{Result, TrainingError},
    logging::{init_logging, CsvLogger, EpochRecord, ValidationFields},
    model::{Criterion, SequenceModel},
    optimizer::TrainerOptimizer,
    remap::{NameMatcher, ShapeOrderMatcher},
    scheduler::{LRScheduler, SchedulerFactory},
    shutdown::ShutdownSignal,
    step::StepExecutor,
    validate::{ValidationSummary, Validator},
};

const TRAINING_LOG: &str = "training.csv";

#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    pub epochs: usize,
    /// Explicit learning rate. Also replaces restored optimizer rates.
    pub lr: Option<LearningRate>,
}

impl FitOptions {
    pub fn epochs(epochs: usize) -> Self {
        Self { epochs, lr: None }
    }

    pub fn with_lr(mut self, lr: LearningRate) -> Self {
        self.lr = Some(lr);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitOutcome {
    Completed { last_epoch: usize },
    /// Stopped on request; `last_epoch` is the last epoch fully written out.
    Interrupted { last_epoch: usize },
}

impl FitOutcome {
    pub fn last_epoch(&self) -> usize {
        match self {
            FitOutcome::Completed { last_epoch } | FitOutcome::Interrupted { last_epoch } => {
                *last_epoch
            }
        }
    }
}

/// Optimizer and schedule for one `fit` call, positioned after `last_epoch`.
pub struct TrainingState {
    pub optimizer: TrainerOptimizer,
    pub scheduler: Box<dyn LRScheduler>,
    pub last_epoch: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub duration: Duration,
    pub validation: ValidationSummary,
}

pub struct Trainer<M: SequenceModel> {
    model: M,
    device: Device,
    train_loader: BlockingDataLoader,
    valid_loader: BlockingDataLoader,
    criterion: Option<Box<dyn Criterion>>,
    scheduler_factory: Box<dyn SchedulerFactory>,
    matcher: Box<dyn NameMatcher>,
    executor: StepExecutor,
    runner: EpochRunner,
    validator: Validator,
    optimizer_config: OptimizerConfig,
    restore_optim: bool,
    save_optim_every: usize,
    pre_training: bool,
}

/// Runs a configured job end to end: logging per `runtime.json_logs`, a
/// Ctrl-C handler that stops at the next epoch boundary, then `fit`.
pub fn train<M, F>(
    config: &TrainingConfig,
    build_model: F,
    workdir: &Path,
    options: FitOptions,
) -> Result<(FitOutcome, M)>
where
    M: SequenceModel,
    F: FnOnce(&Device) -> Result<M>,
{
    init_logging(config.runtime.json_logs);
    let shutdown = ShutdownSignal::new();
    if let Err(err) = shutdown.install_ctrlc_handler() {
        tracing::warn!(%err, "continuing without Ctrl-C handling");
    }

    let mut trainer = Trainer::from_config(config, build_model)?;
    let outcome = trainer.fit(workdir, options, &shutdown)?;
    if let FitOutcome::Interrupted { last_epoch } = outcome {
        tracing::info!(last_epoch, "training interrupted");
    }
    Ok((outcome, trainer.into_model()))
}

impl<M: SequenceModel> Trainer<M> {
    pub fn new(
        config: &TrainingConfig,
        model: M,
        device: Device,
        train_loader: BlockingDataLoader,
        valid_loader: BlockingDataLoader,
    ) -> Result<Self> {
        config.validate()?;
        if config.steps_per_epoch() == 0 {
            return Err(TrainingError::initialization(
                "chunks_per_epoch yields zero steps per epoch",
            ));
        }
        if let Err(err) = device.set_seed(config.runtime.seed) {
            tracing::debug!(%err, "device does not support seeding");
        }

        Ok(Self {
            model,
            device,
            train_loader,
            valid_loader,
            criterion: None,
            scheduler_factory: Box::new(config.scheduler.clone()),
            matcher: Box::new(ShapeOrderMatcher),
            executor: StepExecutor::from_config(&config.runtime)?,
            runner: EpochRunner::from_config(config),
            validator: Validator::new(config.runtime.compute_dtype(), config.runtime.min_coverage),
            optimizer_config: config.optimizer.clone(),
            restore_optim: config.runtime.restore_optim,
            save_optim_every: config.runtime.save_optim_every,
            pre_training: config.data.pre_training,
        })
    }

    /// Selects the device from `runtime.device`, builds the model on it and
    /// loads the chunk files named under `data`.
    pub fn from_config<F>(config: &TrainingConfig, build_model: F) -> Result<Self>
    where
        F: FnOnce(&Device) -> Result<M>,
    {
        let device = select_device(config.runtime.device);
        let model = build_model(&device)?;
        let (train_loader, valid_loader) = loaders_from_config(config, &device)?;
        Self::new(config, model, device, train_loader, valid_loader)
    }

    /// Loss used instead of the model's own.
    pub fn with_criterion(mut self, criterion: Box<dyn Criterion>) -> Self {
        self.criterion = Some(criterion);
        self
    }

    pub fn with_scheduler_factory(mut self, factory: Box<dyn SchedulerFactory>) -> Self {
        self.scheduler_factory = factory;
        self
    }

    pub fn with_name_matcher(mut self, matcher: Box<dyn NameMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn fit(
        &mut self,
        workdir: &Path,
        options: FitOptions,
        shutdown: &ShutdownSignal,
    ) -> Result<FitOutcome> {
        let optimizer = self.build_optimizer(options.lr.as_ref())?;
        self.fit_with_optimizer(workdir, options, optimizer, shutdown)
    }

    /// Like [`Trainer::fit`] with a caller-built optimizer.
    pub fn fit_with_optimizer(
        &mut self,
        workdir: &Path,
        options: FitOptions,
        optimizer: TrainerOptimizer,
        shutdown: &ShutdownSignal,
    ) -> Result<FitOutcome> {
        if options.epochs == 0 {
            return Err(TrainingError::initialization("epochs must be greater than 0"));
        }
        fs::create_dir_all(workdir)?;
        let state = self.resume(workdir, optimizer, options.lr.as_ref(), options.epochs)?;
        self.run(workdir, state, options.epochs, shutdown)
    }

    pub fn build_optimizer(&self, lr: Option<&LearningRate>) -> Result<TrainerOptimizer> {
        let named_parameters = self.model.parameters();
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        let lr = lr.unwrap_or(&self.optimizer_config.learning_rate);
        let optimizer = TrainerOptimizer::new(named_parameters, &self.optimizer_config, lr)?;
        tracing::info!(
            algorithm = ?optimizer.algorithm(),
            groups = optimizer.groups().len(),
            lr = ?optimizer.learning_rates(),
            weight_decay = self.optimizer_config.weight_decay,
            "optimizer ready"
        );
        Ok(optimizer)
    }

    /// Loads the newest checkpoint in `workdir` and positions the schedule
    /// after it.
    pub fn resume(
        &mut self,
        workdir: &Path,
        mut optimizer: TrainerOptimizer,
        lr: Option<&LearningRate>,
        epochs: usize,
    ) -> Result<TrainingState> {
        let last_epoch = checkpoint::resume(
            workdir,
            &self.device,
            &self.model,
            self.restore_optim.then_some(&mut optimizer),
            self.matcher.as_ref(),
        )?;

        if self.restore_optim && last_epoch > 0 {
            if let Some(lr) = lr {
                optimizer.override_learning_rates(lr)?;
                tracing::info!(lr = ?optimizer.learning_rates(), "replaced restored learning rates");
            }
        }

        let scheduler = self.scheduler_factory.build(
            optimizer.initial_learning_rates(),
            self.runner.steps_per_epoch(),
            epochs,
            last_epoch,
        )?;
        optimizer.set_learning_rates(scheduler.last_lr())?;

        Ok(TrainingState {
            optimizer,
            scheduler,
            last_epoch,
        })
    }

    /// Trains epochs `state.last_epoch + 1 ..= epochs`, stopping early at an
    /// epoch boundary once `shutdown` is raised.
    pub fn run(
        &mut self,
        workdir: &Path,
        mut state: TrainingState,
        epochs: usize,
        shutdown: &ShutdownSignal,
    ) -> Result<FitOutcome> {
        for epoch in state.last_epoch + 1..=epochs {
            if shutdown.is_raised() {
                tracing::info!(last_epoch = state.last_epoch, "stop requested; leaving training");
                return Ok(FitOutcome::Interrupted {
                    last_epoch: state.last_epoch,
                });
            }

            let summary = self.run_epoch(workdir, epoch, &mut state)?;
            tracing::info!(
                "[epoch {}] directory={} loss={:.4} mean_acc={:.3}% median_acc={:.3}%",
                epoch,
                workdir.display(),
                summary.validation.loss,
                summary.validation.mean_accuracy,
                summary.validation.median_accuracy
            );

            let mut training_log = CsvLogger::open(workdir.join(TRAINING_LOG))?;
            training_log.append(&self.epoch_record(&summary))?;
            training_log.flush()?;

            state.last_epoch = epoch;
        }

        Ok(FitOutcome::Completed {
            last_epoch: state.last_epoch,
        })
    }

    fn run_epoch(
        &mut self,
        workdir: &Path,
        epoch: usize,
        state: &mut TrainingState,
    ) -> Result<EpochSummary> {
        self.model.set_training(true);
        let EpochTraining {
            smoothed_loss,
            duration,
            ..
        } = {
            let mut loss_log = CsvLogger::open(workdir.join(format!("losses_{epoch}.csv")))?;
            self.runner.run_epoch(
                &mut self.executor,
                &self.model,
                self.criterion.as_deref(),
                &mut self.train_loader,
                state,
                Some(&mut loss_log),
            )?
        };

        checkpoint::save_weights(workdir, epoch, &self.model)?;
        if epoch % self.save_optim_every == 0 {
            checkpoint::save_optimizer(workdir, epoch, &state.optimizer)?;
        }

        let validation = self.validator.validate_epoch(
            &mut self.model,
            self.criterion.as_deref(),
            &mut self.valid_loader,
        )?;

        Ok(EpochSummary {
            epoch,
            train_loss: smoothed_loss,
            duration,
            validation,
        })
    }

    fn epoch_record(&self, summary: &EpochSummary) -> EpochRecord {
        EpochRecord {
            time: Local::now(),
            duration_secs: summary.duration.as_secs(),
            epoch: summary.epoch,
            train_loss: summary.train_loss,
            validation: (!self.pre_training).then_some(ValidationFields {
                loss: summary.validation.loss,
                mean: summary.validation.mean_accuracy,
                median: summary.validation.median_accuracy,
            }),
        }
    }
}
