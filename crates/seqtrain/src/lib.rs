pub mod accuracy;
pub mod batch;
pub mod checkpoint;
pub mod clip;
pub mod config;
pub mod data;
pub mod decode;
pub mod device;
pub mod epoch;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod remap;
pub mod scheduler;
pub mod shutdown;
pub mod step;
pub mod trainer;
pub mod validate;

pub use accuracy::{AccuracyMetric, AlignmentAccuracy};
pub use batch::{AuxLabels, Batch};
pub use checkpoint::{CheckpointDescriptor, CheckpointIndex};
pub use clip::{GradientClipper, QuantileClipper};
pub use config::{ConfigOverride, LearningRate, TrainingConfig};
pub use data::{BlockingDataLoader, ChunkDataLoader, DataLoader};
pub use epoch::{EpochRunner, EpochTraining};
pub use error::{Result, TrainingError};
pub use loss::{LossOutput, LossRecord};
pub use model::{Criterion, ForwardContext, ModelCapabilities, ModelOutput, SequenceModel};
pub use optimizer::{GradientScaler, OptimizerState, TrainerOptimizer};
pub use remap::{NameMatcher, ShapeOrderMatcher};
pub use scheduler::{LRScheduler, SchedulerFactory};
pub use shutdown::ShutdownSignal;
pub use step::{StepExecutor, StepOutput};
pub use trainer::{train, EpochSummary, FitOptions, FitOutcome, Trainer, TrainingState};
pub use validate::{ValidationSummary, Validator};
