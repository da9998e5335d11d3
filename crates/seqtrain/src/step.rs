use candle_core::{backprop::GradStore, DType, Tensor};

use crate::{
    batch::Batch,
    clip::GradientClipper,
    config::RuntimeConfig,
    error::{Result, TrainingError},
    loss::LossRecord,
    model::{compute_loss, Criterion, ForwardContext, ModelOutput, SequenceModel},
    optimizer::{scaler::GradientScaler, TrainerOptimizer},
};

/// What one optimizer step reports back to the epoch loop.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Per-key losses averaged over the sub-batches.
    pub losses: LossRecord,
    /// Gradient norm before clipping.
    pub grad_norm: f64,
    /// Loss scale in effect during the step.
    pub scale: f32,
}

/// Runs forward/backward over a batch split into equal sub-batches, then
/// unscales, clips and applies the accumulated gradients.
pub struct StepExecutor {
    split: usize,
    dtype: DType,
    scaler: GradientScaler,
    clipper: GradientClipper,
}

impl StepExecutor {
    pub fn new(
        split: usize,
        dtype: DType,
        scaler: GradientScaler,
        clipper: GradientClipper,
    ) -> Result<Self> {
        if split == 0 {
            return Err(TrainingError::initialization(
                "grad_accum_split must be greater than 0",
            ));
        }
        Ok(Self {
            split,
            dtype,
            scaler,
            clipper,
        })
    }

    pub fn from_config(runtime: &RuntimeConfig) -> Result<Self> {
        let scaler = GradientScaler::new(&runtime.loss_scale, runtime.use_amp);
        Self::new(
            runtime.grad_accum_split,
            runtime.compute_dtype(),
            scaler,
            GradientClipper::from_config(runtime),
        )
    }

    pub fn split(&self) -> usize {
        self.split
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn scaler(&self) -> &GradientScaler {
        &self.scaler
    }

    pub fn clipper(&self) -> &GradientClipper {
        &self.clipper
    }

    pub fn step<M>(
        &mut self,
        model: &M,
        criterion: Option<&dyn Criterion>,
        optimizer: &mut TrainerOptimizer,
        batch: &Batch,
    ) -> Result<StepOutput>
    where
        M: SequenceModel + ?Sized,
    {
        let params = optimizer.parameter_tensors();
        let ctx = ForwardContext::train(self.dtype);
        let weight = 1.0 / self.split as f64;
        let scale = self.scaler.loss_scale();

        let mut losses = LossRecord::default();
        let mut accumulated: Option<GradStore> = None;
        for part in batch.split(self.split)? {
            let (output, targets, lengths) = forward(model, &part, &ctx)?;
            let resolved = compute_loss(model, criterion, &output, targets, lengths)?.resolve()?;
            losses.accumulate(&resolved.record, weight);

            let normalized = resolved.optimized.to_dtype(DType::F32)?.affine(weight, 0.0)?;
            let scaled = self.scaler.scale(&normalized)?;
            let grads = scaled.backward()?;
            match accumulated.as_mut() {
                Some(existing) => merge_gradients(existing, grads, &params)?,
                None => accumulated = Some(grads),
            }
        }

        let mut grads = accumulated
            .ok_or_else(|| TrainingError::runtime("step produced no gradients"))?;
        let found_inf = self.scaler.unscale_grads(&mut grads, &params)?;
        let grad_norm = self.clipper.clip(&mut grads, &params)?;

        if found_inf {
            tracing::debug!(scale, "non-finite gradients; skipping optimizer step");
            optimizer.zero_grad(&mut grads);
        } else {
            optimizer.step(&mut grads)?;
        }
        self.scaler.update(found_inf);

        Ok(StepOutput {
            losses,
            grad_norm,
            scale,
        })
    }
}

fn forward<'b, M>(
    model: &M,
    batch: &'b Batch,
    ctx: &ForwardContext,
) -> Result<(ModelOutput, Option<&'b Tensor>, Option<&'b Tensor>)>
where
    M: SequenceModel + ?Sized,
{
    match batch {
        Batch::Supervised {
            data,
            targets,
            lengths,
            extra,
        } => Ok((model.forward(data, extra, ctx)?, Some(targets), Some(lengths))),
        Batch::PreTraining { data, labels } => {
            Ok((model.forward_pretraining(data, labels, ctx)?, None, None))
        }
    }
}

/// Adds the parameter gradients of `incoming` into `accum`; gradients of
/// intermediate tensors are dropped.
fn merge_gradients(accum: &mut GradStore, mut incoming: GradStore, params: &[Tensor]) -> Result<()> {
    for tensor in params {
        if let Some(grad) = incoming.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{LearningRate, OptimizerConfig, OptimizerType},
        loss::LossOutput,
    };
    use candle_core::{Device, Var};

    /// `y = w * x` with mean squared error against the targets.
    struct Scalar {
        w: Var,
        alphabet: Vec<String>,
    }

    impl Scalar {
        fn new(w: f32) -> Self {
            Self {
                w: Var::new(&[w], &Device::Cpu).unwrap(),
                alphabet: vec!["N".into(), "A".into()],
            }
        }
    }

    impl SequenceModel for Scalar {
        fn forward(&self, input: &Tensor, _: &[Tensor], _: &ForwardContext) -> Result<ModelOutput> {
            Ok(ModelOutput::Scores(input.broadcast_mul(self.w.as_tensor())?))
        }

        fn loss(
            &self,
            output: &ModelOutput,
            targets: Option<&Tensor>,
            _: Option<&Tensor>,
        ) -> Result<LossOutput> {
            let targets = targets.ok_or_else(|| TrainingError::runtime("targets required"))?;
            let diff = output.scores()?.sub(&targets.to_dtype(DType::F32)?)?;
            Ok(LossOutput::Scalar(diff.sqr()?.mean_all()?))
        }

        fn decode(&self, _: &Tensor) -> Result<String> {
            Ok(String::new())
        }

        fn alphabet(&self) -> &[String] {
            &self.alphabet
        }

        fn parameters(&self) -> Vec<(String, Var)> {
            vec![("w".into(), self.w.clone())]
        }

        fn set_training(&mut self, _: bool) {}

        fn is_training(&self) -> bool {
            true
        }
    }

    fn sgd(model: &Scalar, lr: f64) -> TrainerOptimizer {
        let config = OptimizerConfig {
            algorithm: OptimizerType::Sgd,
            momentum: 0.0,
            weight_decay: 0.0,
            ..OptimizerConfig::default()
        };
        TrainerOptimizer::new(model.parameters(), &config, &LearningRate::Single(lr)).unwrap()
    }

    fn batch(values: &[f32], targets: &[f32]) -> Batch {
        let device = Device::Cpu;
        let n = values.len();
        Batch::supervised(
            Tensor::from_slice(values, (n, 1), &device).unwrap(),
            Tensor::from_slice(targets, (n, 1), &device).unwrap(),
            Tensor::ones(n, DType::I64, &device).unwrap(),
        )
    }

    fn executor(split: usize) -> StepExecutor {
        StepExecutor::new(
            split,
            DType::F32,
            GradientScaler::disabled(),
            GradientClipper::Fixed { max_norm: 1e9 },
        )
        .unwrap()
    }

    #[test]
    fn split_losses_average_to_the_full_batch_mean() {
        let model = Scalar::new(0.0);
        let mut optimizer = sgd(&model, 0.0);
        let targets: Vec<f32> = (1..=8).map(|v| v as f32).collect();
        let batch = batch(&[1.0; 8], &targets);

        let out = executor(4).step(&model, None, &mut optimizer, &batch).unwrap();
        let expected = targets.iter().map(|t| (t * t) as f64).sum::<f64>() / 8.0;
        assert!((out.losses.primary().unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn split_gradients_match_a_single_pass() {
        let targets: Vec<f32> = (1..=8).map(|v| v as f32).collect();
        let data: Vec<f32> = (0..8).map(|v| 0.5 + v as f32 * 0.25).collect();

        let whole = Scalar::new(0.5);
        let mut optimizer = sgd(&whole, 0.01);
        executor(1)
            .step(&whole, None, &mut optimizer, &batch(&data, &targets))
            .unwrap();

        let split = Scalar::new(0.5);
        let mut optimizer = sgd(&split, 0.01);
        let out = executor(4)
            .step(&split, None, &mut optimizer, &batch(&data, &targets))
            .unwrap();

        let a = whole.w.as_tensor().to_vec1::<f32>().unwrap()[0];
        let b = split.w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        assert!(out.grad_norm > 0.0);
    }

    #[test]
    fn indivisible_batch_fails_fast() {
        let model = Scalar::new(1.0);
        let mut optimizer = sgd(&model, 0.1);
        let err = executor(4)
            .step(&model, None, &mut optimizer, &batch(&[1.0; 6], &[1.0; 6]))
            .unwrap_err();
        assert!(matches!(err, TrainingError::InvalidBatch(_)));
    }

    #[test]
    fn overflow_skips_the_update_and_backs_off() {
        let model = Scalar::new(1.0);
        let mut optimizer = sgd(&model, 0.1);
        let mut executor = StepExecutor::new(
            1,
            DType::F32,
            GradientScaler::new(&Default::default(), true),
            GradientClipper::default(),
        )
        .unwrap();
        let before = executor.scaler().loss_scale();

        let out = executor
            .step(&model, None, &mut optimizer, &batch(&[f32::INFINITY], &[1.0]))
            .unwrap();
        assert_eq!(out.scale, before);
        assert_eq!(executor.scaler().loss_scale(), before * 0.5);
        assert_eq!(model.w.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
        assert_eq!(optimizer.steps_taken(), 0);
    }

    #[test]
    fn scaled_finite_step_matches_the_unscaled_update() {
        let targets: Vec<f32> = (1..=4).map(|v| v as f32).collect();
        let data = [0.5f32, 1.0, 1.5, 2.0];

        let plain = Scalar::new(0.5);
        let mut optimizer = sgd(&plain, 0.01);
        executor(2)
            .step(&plain, None, &mut optimizer, &batch(&data, &targets))
            .unwrap();

        let scaled = Scalar::new(0.5);
        let mut optimizer = sgd(&scaled, 0.01);
        let mut amp = StepExecutor::new(
            2,
            DType::F32,
            GradientScaler::new(&Default::default(), true),
            GradientClipper::Fixed { max_norm: 1e9 },
        )
        .unwrap();
        let out = amp
            .step(&scaled, None, &mut optimizer, &batch(&data, &targets))
            .unwrap();

        assert_eq!(out.scale, 65536.0);
        assert_eq!(amp.scaler().loss_scale(), 65536.0);
        assert_eq!(optimizer.steps_taken(), 1);
        let a = plain.w.as_tensor().to_vec1::<f32>().unwrap()[0];
        let b = scaled.w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        assert!(b != 0.5);
    }

    #[test]
    fn explicit_criterion_replaces_model_loss() {
        let model = Scalar::new(1.0);
        let mut optimizer = sgd(&model, 0.0);
        let criterion = |output: &ModelOutput,
                         _: Option<&Tensor>,
                         _: Option<&Tensor>|
         -> Result<LossOutput> {
            let scores = output.scores()?;
            Ok(LossOutput::Components(vec![
                ("loss".to_string(), scores.sum_all()?),
                ("total_loss".to_string(), scores.sum_all()?.affine(2.0, 0.0)?),
            ]))
        };
        let out = executor(2)
            .step(&model, Some(&criterion), &mut optimizer, &batch(&[1.0; 4], &[0.0; 4]))
            .unwrap();
        assert!((out.losses.primary().unwrap() - 2.0).abs() < 1e-6);
        assert!((out.losses.get("total_loss").unwrap() - 4.0).abs() < 1e-6);
    }
}
