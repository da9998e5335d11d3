#![allow(dead_code)]

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use seqtrain::{
    batch::AuxLabels,
    config::{DataConfig, RuntimeConfig, SchedulerConfig},
    decode::greedy_ctc_decode,
    AlignmentAccuracy, Batch, BlockingDataLoader, ChunkDataLoader, ForwardContext, LossOutput,
    ModelOutput, Result, SequenceModel, Trainer, TrainingConfig, TrainingError, Validator,
};

pub const FRAMES: usize = 8;
pub const CLASSES: usize = 5;

/// Per-frame regression `pred = weight * signal + bias`; class scores are the
/// negated squared distance of `pred` to every label id.
pub struct ToyModel {
    pub weight: Var,
    pub bias: Var,
    alphabet: Vec<String>,
    training: bool,
}

impl ToyModel {
    pub fn new(weight: f32, bias: f32) -> Self {
        let device = Device::Cpu;
        Self {
            weight: Var::new(&[weight], &device).expect("weight"),
            bias: Var::new(&[bias], &device).expect("bias"),
            alphabet: ["N", "A", "C", "G", "T"].iter().map(|s| s.to_string()).collect(),
            training: true,
        }
    }

    pub fn weight_value(&self) -> f32 {
        self.weight.as_tensor().to_vec1::<f32>().expect("weight")[0]
    }

    fn predict(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input
            .broadcast_mul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?)
    }
}

impl SequenceModel for ToyModel {
    fn forward(&self, input: &Tensor, _: &[Tensor], _: &ForwardContext) -> Result<ModelOutput> {
        let pred = self.predict(input)?;
        let classes = Tensor::arange(0f32, CLASSES as f32, input.device())?.reshape((1, 1, CLASSES))?;
        let logits = pred
            .t()?
            .unsqueeze(2)?
            .broadcast_sub(&classes)?
            .sqr()?
            .neg()?
            .contiguous()?;
        Ok(ModelOutput::Named(vec![
            ("logits".to_string(), logits),
            ("pred".to_string(), pred),
        ]))
    }

    fn forward_pretraining(
        &self,
        input: &Tensor,
        labels: &AuxLabels,
        _: &ForwardContext,
    ) -> Result<ModelOutput> {
        Ok(ModelOutput::Named(vec![
            ("pred".to_string(), self.predict(input)?),
            ("hp_target".to_string(), labels.hp_lengths.to_dtype(DType::F32)?),
        ]))
    }

    fn loss(
        &self,
        output: &ModelOutput,
        targets: Option<&Tensor>,
        lengths: Option<&Tensor>,
    ) -> Result<LossOutput> {
        toy_loss(output, targets, lengths)
    }

    fn decode(&self, scores: &Tensor) -> Result<String> {
        greedy_ctc_decode(scores, &self.alphabet)
    }

    fn alphabet(&self) -> &[String] {
        &self.alphabet
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Mean squared error against the targets, or against the homopolymer
/// lengths for pre-training batches.
pub fn toy_loss(
    output: &ModelOutput,
    targets: Option<&Tensor>,
    _: Option<&Tensor>,
) -> Result<LossOutput> {
    let pred = output
        .get("pred")
        .ok_or_else(|| TrainingError::runtime("missing prediction"))?;
    match targets {
        Some(targets) => {
            let mse = candle_nn::loss::mse(pred, &targets.to_dtype(DType::F32)?)?;
            Ok(LossOutput::Scalar(mse))
        }
        None => {
            let target = output
                .get("hp_target")
                .ok_or_else(|| TrainingError::runtime("missing homopolymer target"))?;
            let mse = candle_nn::loss::mse(pred, target)?;
            Ok(LossOutput::Components(vec![
                ("loss".to_string(), mse.clone()),
                ("hp_loss".to_string(), mse),
            ]))
        }
    }
}

/// Label ids cycling through `1..=4`, offset per row so no row repeats a
/// label back to back.
pub fn labels(rows: usize) -> Vec<i64> {
    (0..rows)
        .flat_map(|row| (0..FRAMES).map(move |frame| ((row + frame) % 4) as i64 + 1))
        .collect()
}

pub fn supervised_dataset(rows: usize) -> Batch {
    let device = Device::Cpu;
    let labels = labels(rows);
    let signal: Vec<f32> = labels.iter().map(|label| *label as f32).collect();
    Batch::supervised(
        Tensor::from_vec(signal, (rows, FRAMES), &device).expect("signal"),
        Tensor::from_vec(labels, (rows, FRAMES), &device).expect("targets"),
        Tensor::full(FRAMES as i64, rows, &device).expect("lengths"),
    )
}

pub fn pre_training_dataset(rows: usize) -> Batch {
    let device = Device::Cpu;
    let labels = labels(rows);
    let signal: Vec<f32> = labels.iter().map(|label| *label as f32).collect();
    Batch::PreTraining {
        data: Tensor::from_vec(signal, (rows, FRAMES), &device).expect("signal"),
        labels: AuxLabels {
            hp_lengths: Tensor::from_vec(labels.clone(), (rows, FRAMES), &device)
                .expect("hp lengths"),
            is_hp: Tensor::zeros((rows, FRAMES), DType::U8, &device).expect("is_hp"),
            hp_bases: Tensor::from_vec(labels, (rows, FRAMES), &device).expect("hp bases"),
        },
    }
}

pub fn loader(dataset: Batch, batch_size: usize) -> BlockingDataLoader {
    BlockingDataLoader::new(
        ChunkDataLoader::new(dataset, Device::Cpu, batch_size, false, 7).expect("loader"),
    )
}

/// Four steps per epoch of four chunks, split in two, full precision.
pub fn config(pre_training: bool) -> TrainingConfig {
    TrainingConfig {
        data: DataConfig {
            chunks_per_epoch: 16,
            batch_size: 4,
            pre_training,
            train_path: None,
            valid_path: None,
            shuffle: false,
        },
        optimizer: Default::default(),
        scheduler: SchedulerConfig {
            warmup_steps: 2,
            ..SchedulerConfig::default()
        },
        runtime: RuntimeConfig {
            use_amp: false,
            grad_accum_split: 2,
            ..RuntimeConfig::default()
        },
    }
}

pub fn trainer(config: &TrainingConfig, model: ToyModel) -> Trainer<ToyModel> {
    let (train, valid) = if config.data.pre_training {
        (pre_training_dataset(16), pre_training_dataset(8))
    } else {
        (supervised_dataset(16), supervised_dataset(8))
    };
    Trainer::new(
        config,
        model,
        Device::Cpu,
        loader(train, config.data.batch_size),
        loader(valid, config.data.batch_size),
    )
    .expect("trainer")
    .with_validator(Validator::with_metric(
        DType::F32,
        Box::new(AlignmentAccuracy::new(config.runtime.min_coverage)),
    ))
}

pub fn read_csv(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).expect("csv");
    let header = reader
        .headers()
        .expect("header")
        .iter()
        .map(str::to_string)
        .collect();
    let rows = reader
        .records()
        .map(|record| record.expect("row").iter().map(str::to_string).collect())
        .collect();
    (header, rows)
}
