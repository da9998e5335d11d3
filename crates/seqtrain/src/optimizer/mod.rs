use std::collections::HashMap;

pub mod scaler;

pub use scaler::GradientScaler;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{
    config::{LearningRate, OptimizerConfig, OptimizerType},
    error::{Result, TrainingError},
};

const EPS: f64 = 1e-12;
const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, Copy)]
struct Hyperparameters {
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    momentum: f64,
}

/// A set of parameters sharing a learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
    pub lr: f64,
    /// Rate the schedule multiplies; survives checkpoints.
    pub initial_lr: f64,
    pub weight_decay: f64,
}

/// AdamW, Adam or SGD over named candle variables, with fp32 master copies
/// for reduced-precision parameters.
#[derive(Debug)]
pub struct TrainerOptimizer {
    algorithm: OptimizerType,
    hyper: Hyperparameters,
    groups: Vec<ParamGroup>,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    group: usize,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: &OptimizerConfig,
        lr: &LearningRate,
    ) -> Result<Self> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut groups: Vec<ParamGroup> = config
            .param_groups
            .iter()
            .map(|group| ParamGroup {
                name: group.name.clone(),
                lr: 0.0,
                initial_lr: 0.0,
                weight_decay: group.weight_decay.unwrap_or(config.weight_decay),
            })
            .collect();

        let mut params = Vec::with_capacity(named_parameters.len());
        let mut default_group = None;
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }

            let group = match config
                .param_groups
                .iter()
                .position(|group| group.patterns.iter().any(|p| matches_pattern(&name, p)))
            {
                Some(index) => index,
                None => *default_group.get_or_insert_with(|| {
                    groups.push(ParamGroup {
                        name: DEFAULT_GROUP.to_string(),
                        lr: 0.0,
                        initial_lr: 0.0,
                        weight_decay: config.weight_decay,
                    });
                    groups.len() - 1
                }),
            };

            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();
            let first_moment = Tensor::zeros(shape.as_slice(), DType::F32, device)?;
            let second_moment = Tensor::zeros(shape.as_slice(), DType::F32, device)?;
            let master = if dtype != DType::F32 {
                Some(Var::from_tensor(&tensor.to_dtype(DType::F32)?)?)
            } else {
                None
            };
            let apply_weight_decay = !config
                .weight_decay_exclude
                .iter()
                .any(|pattern| matches_pattern(&name, pattern));

            params.push(ParameterSlot {
                name,
                group,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        for (index, group) in groups.iter().enumerate() {
            if !params.iter().any(|slot| slot.group == index) {
                tracing::warn!(group = %group.name, "parameter group matched no parameters");
            }
        }

        let rates = lr.for_groups(groups.len())?;
        for (group, rate) in groups.iter_mut().zip(rates) {
            group.lr = rate;
            group.initial_lr = rate;
        }

        Ok(Self {
            algorithm: config.algorithm,
            hyper: Hyperparameters {
                beta1: config.beta1,
                beta2: config.beta2,
                epsilon: config.epsilon,
                momentum: config.momentum,
            },
            groups,
            params,
            step: 0,
        })
    }

    pub fn algorithm(&self) -> OptimizerType {
        self.algorithm
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn learning_rates(&self) -> Vec<f64> {
        self.groups.iter().map(|group| group.lr).collect()
    }

    pub fn initial_learning_rates(&self) -> Vec<f64> {
        self.groups.iter().map(|group| group.initial_lr).collect()
    }

    pub fn set_learning_rates(&mut self, rates: &[f64]) -> Result<()> {
        if rates.len() != self.groups.len() {
            return Err(TrainingError::runtime(format!(
                "{} learning rates supplied for {} parameter groups",
                rates.len(),
                self.groups.len()
            )));
        }
        for (group, rate) in self.groups.iter_mut().zip(rates) {
            group.lr = *rate;
        }
        Ok(())
    }

    /// Replaces both the current and the initial rate of every group.
    pub fn override_learning_rates(&mut self, lr: &LearningRate) -> Result<()> {
        let rates = lr.for_groups(self.groups.len())?;
        for (group, rate) in self.groups.iter_mut().zip(rates) {
            group.lr = rate;
            group.initial_lr = rate;
        }
        Ok(())
    }

    /// Tensors whose gradients the optimizer consumes.
    pub fn parameter_tensors(&self) -> Vec<Tensor> {
        self.params
            .iter()
            .map(|slot| slot.param.as_tensor().clone())
            .collect()
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                processed.push((index, grad.to_dtype(DType::F32)?));
            }
        }
        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        for (index, grad) in processed {
            let group = &self.groups[self.params[index].group];
            let (lr, weight_decay) = (group.lr, group.weight_decay);
            let slot = &mut self.params[index];
            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot.param.as_tensor().to_dtype(DType::F32)?,
            };
            let decay = if slot.apply_weight_decay { weight_decay } else { 0.0 };

            let next = match self.algorithm {
                OptimizerType::AdamW => {
                    let decayed = if decay != 0.0 {
                        base.affine(1.0 - lr * decay, 0.0)?
                    } else {
                        base
                    };
                    let update = adam_update(slot, &grad, self.hyper, self.step, lr)?;
                    decayed.sub(&update)?
                }
                OptimizerType::Adam => {
                    let grad = with_l2(&grad, &base, decay)?;
                    let update = adam_update(slot, &grad, self.hyper, self.step, lr)?;
                    base.sub(&update)?
                }
                OptimizerType::Sgd => {
                    let grad = with_l2(&grad, &base, decay)?;
                    let velocity = if self.hyper.momentum > 0.0 {
                        let v = slot.first_moment.affine(self.hyper.momentum, 0.0)?.add(&grad)?;
                        slot.first_moment = v.clone();
                        v
                    } else {
                        grad
                    };
                    base.sub(&velocity.affine(lr, 0.0)?)?
                }
            };

            write_back(slot, next)?;
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = shape.iter().product();
            let master = match &slot.master {
                Some(master) => Some(flatten_to_vec(master.as_tensor(), numel)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                master,
            });
        }

        Ok(OptimizerState {
            algorithm: self.algorithm,
            step: self.step,
            groups: self.groups.clone(),
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        if state.algorithm != self.algorithm {
            return Err(TrainingError::runtime(format!(
                "optimizer state was written by {:?}, not {:?}",
                state.algorithm, self.algorithm
            )));
        }
        if state.groups.len() != self.groups.len() {
            return Err(TrainingError::runtime(format!(
                "optimizer state has {} parameter groups, optimizer has {}",
                state.groups.len(),
                self.groups.len()
            )));
        }

        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            let expected: usize = dims.iter().product();
            if dims != saved.shape
                || expected != saved.first_moment.len()
                || expected != saved.second_moment.len()
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.first_moment = Tensor::from_vec(saved.first_moment, dims.as_slice(), &device)?;
            slot.second_moment = Tensor::from_vec(saved.second_moment, dims.as_slice(), &device)?;

            match (&slot.master, saved.master) {
                (Some(_), Some(values)) => {
                    let tensor = Tensor::from_vec(values, dims.as_slice(), &device)?;
                    write_back(slot, tensor)?;
                }
                (Some(_), None) | (None, None) => {}
                (None, Some(_)) => {
                    tracing::debug!(parameter = %slot.name, "ignoring saved master weights");
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        self.step = state.step;
        self.groups = state.groups;
        Ok(())
    }
}

fn adam_update(
    slot: &mut ParameterSlot,
    grad: &Tensor,
    hyper: Hyperparameters,
    step: usize,
    lr: f64,
) -> Result<Tensor> {
    let bias_correction1 = 1.0 - hyper.beta1.powi(step as i32);
    let bias_correction2 = 1.0 - hyper.beta2.powi(step as i32);
    let scale_m = if bias_correction1.abs() < EPS { 1.0 } else { 1.0 / bias_correction1 };
    let scale_v = if bias_correction2.abs() < EPS { 1.0 } else { 1.0 / bias_correction2 };

    let new_m = slot
        .first_moment
        .affine(hyper.beta1, 0.0)?
        .add(&grad.affine(1.0 - hyper.beta1, 0.0)?)?;
    let new_v = slot
        .second_moment
        .affine(hyper.beta2, 0.0)?
        .add(&grad.sqr()?.affine(1.0 - hyper.beta2, 0.0)?)?;

    let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, hyper.epsilon)?;
    let update = new_m.affine(scale_m, 0.0)?.div(&denom)?.affine(lr, 0.0)?;

    slot.first_moment = new_m;
    slot.second_moment = new_v;
    Ok(update)
}

fn with_l2(grad: &Tensor, base: &Tensor, decay: f64) -> Result<Tensor> {
    if decay == 0.0 {
        return Ok(grad.clone());
    }
    Ok(grad.add(&base.affine(decay, 0.0)?)?)
}

fn write_back(slot: &ParameterSlot, next: Tensor) -> Result<()> {
    if let Some(master) = slot.master.as_ref() {
        master.set(&next)?;
    }
    let cast = if slot.dtype == DType::F32 {
        next
    } else {
        next.to_dtype(slot.dtype)?
    };
    slot.param.set(&cast)?;
    Ok(())
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    !pattern.is_empty() && name.contains(pattern)
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>> {
    let flat = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

/// Serializable optimizer snapshot written to `optim_<epoch>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub algorithm: OptimizerType,
    pub step: usize,
    pub groups: Vec<ParamGroup>,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}
