use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use candle_core::DType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TrainingError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.data.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Number of optimizer steps that make up one epoch.
    pub fn steps_per_epoch(&self) -> usize {
        self.data.chunks_per_epoch / self.data.batch_size.max(1)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.runtime.grad_accum_split == 0 {
            errors.push("runtime.grad_accum_split must be greater than 0".to_string());
        } else if self.data.batch_size % self.runtime.grad_accum_split != 0 {
            errors.push(format!(
                "data.batch_size ({}) must be divisible by runtime.grad_accum_split ({})",
                self.data.batch_size, self.runtime.grad_accum_split
            ));
        }

        if self.data.batch_size > 0 && self.data.chunks_per_epoch < self.data.batch_size {
            errors.push("data.chunks_per_epoch must be at least data.batch_size".to_string());
        }

        if self.runtime.save_optim_every == 0 {
            errors.push("runtime.save_optim_every must be greater than 0".to_string());
        }

        if !(0.0 < self.runtime.clip.quantile && self.runtime.clip.quantile < 1.0) {
            errors.push("runtime.clip.quantile must be in (0, 1)".to_string());
        }

        if self.runtime.clip.factor <= 0.0 {
            errors.push("runtime.clip.factor must be greater than 0".to_string());
        }

        if self.runtime.clip.buffer_size == 0 {
            errors.push("runtime.clip.buffer_size must be greater than 0".to_string());
        }

        if self.runtime.clip.max_norm <= 0.0 {
            errors.push("runtime.clip.max_norm must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.runtime.min_coverage) {
            errors.push("runtime.min_coverage must be in [0, 1]".to_string());
        }

        if self.optimizer.learning_rate.values().iter().any(|lr| *lr <= 0.0) {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        for group in &self.optimizer.param_groups {
            if group.patterns.is_empty() {
                errors.push(format!(
                    "optimizer.param_groups '{}' must list at least one pattern",
                    group.name
                ));
            }
        }

        if let LearningRate::PerGroup(rates) = &self.optimizer.learning_rate {
            let declared = self.optimizer.param_groups.len();
            if rates.len() != declared && rates.len() != declared + 1 {
                errors.push(format!(
                    "optimizer.learning_rate lists {} rates but {} parameter groups are declared",
                    rates.len(),
                    declared
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.scheduler.warmup_ratio) {
            errors.push("scheduler.warmup_ratio must be in [0, 1]".to_string());
        }

        if self.scheduler.end_ratio < 0.0 {
            errors.push("scheduler.end_ratio must be >= 0".to_string());
        }

        if self.scheduler.power <= 0.0 {
            errors.push("scheduler.power must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Returns a copy with every override applied, re-validated.
    pub fn with_overrides(&self, overrides: &[ConfigOverride]) -> Result<Self, TrainingError> {
        if overrides.is_empty() {
            return Ok(self.clone());
        }
        let mut value = serde_json::to_value(self)?;
        for item in overrides {
            item.apply(&mut value)?;
        }
        let config: TrainingConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub chunks_per_epoch: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub pre_training: bool,
    #[serde(default)]
    pub train_path: Option<PathBuf>,
    #[serde(default)]
    pub valid_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [self.train_path.as_mut(), self.valid_path.as_mut()]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

/// A single learning rate for every group, or one per group in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LearningRate {
    Single(f64),
    PerGroup(Vec<f64>),
}

impl LearningRate {
    pub fn values(&self) -> Vec<f64> {
        match self {
            LearningRate::Single(lr) => vec![*lr],
            LearningRate::PerGroup(rates) => rates.clone(),
        }
    }

    /// Expands to exactly `groups` rates.
    pub fn for_groups(&self, groups: usize) -> Result<Vec<f64>, TrainingError> {
        match self {
            LearningRate::Single(lr) => Ok(vec![*lr; groups]),
            LearningRate::PerGroup(rates) if rates.len() == groups => Ok(rates.clone()),
            LearningRate::PerGroup(rates) => Err(TrainingError::initialization(format!(
                "{} learning rates supplied for {} parameter groups",
                rates.len(),
                groups
            ))),
        }
    }
}

impl Default for LearningRate {
    fn default() -> Self {
        LearningRate::Single(default_learning_rate())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default)]
    pub learning_rate: LearningRate,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default)]
    pub weight_decay_exclude: Vec<String>,
    #[serde(default)]
    pub param_groups: Vec<ParamGroupConfig>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: LearningRate::default(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            momentum: default_momentum(),
            weight_decay_exclude: vec![],
            param_groups: vec![],
        }
    }
}

/// Parameters whose names contain any of `patterns` are optimized together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamGroupConfig {
    pub name: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub weight_decay: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    #[default]
    AdamW,
    Adam,
    Sgd,
}

impl FromStr for OptimizerType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adamw" => Ok(Self::AdamW),
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            other => Err(TrainingError::initialization(format!(
                "unknown optimizer '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: ScheduleStrategy,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
    #[serde(default = "default_end_ratio")]
    pub end_ratio: f64,
    #[serde(default = "default_power")]
    pub power: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: ScheduleStrategy::default(),
            warmup_steps: default_warmup_steps(),
            warmup_ratio: default_warmup_ratio(),
            end_ratio: default_end_ratio(),
            power: default_power(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStrategy {
    #[default]
    LinearWarmupCosineDecay,
    Constant,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub use_amp: bool,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub loss_scale: LossScaleSettings,
    #[serde(default)]
    pub restore_optim: bool,
    #[serde(default = "default_save_optim_every")]
    pub save_optim_every: usize,
    #[serde(default = "default_grad_accum_split")]
    pub grad_accum_split: usize,
    #[serde(default)]
    pub quantile_grad_clip: bool,
    #[serde(default)]
    pub clip: ClipConfig,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            use_amp: true,
            precision: Precision::default(),
            loss_scale: LossScaleSettings::default(),
            restore_optim: false,
            save_optim_every: default_save_optim_every(),
            grad_accum_split: default_grad_accum_split(),
            quantile_grad_clip: false,
            clip: ClipConfig::default(),
            device: DevicePreference::default(),
            min_coverage: default_min_coverage(),
            json_logs: false,
        }
    }
}

impl RuntimeConfig {
    /// Dtype used for forward computation.
    pub fn compute_dtype(&self) -> DType {
        if !self.use_amp {
            return DType::F32;
        }
        match self.precision {
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipConfig {
    #[serde(default = "default_clip_quantile")]
    pub quantile: f64,
    #[serde(default = "default_clip_factor")]
    pub factor: f64,
    #[serde(default = "default_clip_buffer")]
    pub buffer_size: usize,
    #[serde(default = "default_clip_max_norm")]
    pub max_norm: f64,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            quantile: default_clip_quantile(),
            factor: default_clip_factor(),
            buffer_size: default_clip_buffer(),
            max_norm: default_clip_max_norm(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossScaleSettings {
    #[serde(default = "default_initial_scale")]
    pub initial_scale: f32,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f32,
    #[serde(default = "default_growth_interval")]
    pub growth_interval: usize,
}

impl Default for LossScaleSettings {
    fn default() -> Self {
        Self {
            initial_scale: default_initial_scale(),
            growth_factor: default_growth_factor(),
            backoff_factor: default_backoff_factor(),
            growth_interval: default_growth_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp16,
    Bf16,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// `key.path=value` assignment applied on top of a loaded config.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((path, value)) if !path.trim().is_empty() => Ok(Self {
                path: path.trim().to_string(),
                value: value.trim().to_string(),
            }),
            Some(_) => Err(format!("override '{s}' has an empty key")),
            None => Err(format!("override '{s}' is not of the form key=value")),
        }
    }
}

impl ConfigOverride {
    /// Writes the value at the dotted path, creating intermediate tables.
    fn apply(&self, root: &mut Value) -> Result<(), TrainingError> {
        let segments: Vec<&str> = self.path.split('.').collect();
        if segments.iter().any(|segment| segment.trim().is_empty()) {
            return Err(TrainingError::ConfigFormat(format!(
                "override path '{}' has an empty segment",
                self.path
            )));
        }
        assign(root, &segments, override_value(&self.value)).map_err(|segment| {
            TrainingError::ConfigFormat(format!(
                "override '{}': '{segment}' is not a table",
                self.path
            ))
        })
    }
}

fn assign<'s>(node: &mut Value, segments: &[&'s str], value: Value) -> Result<(), &'s str> {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return Ok(());
    };
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    let table = node.as_object_mut().ok_or(*head)?;
    let child = table.entry(head.to_string()).or_insert(Value::Null);
    assign(child, rest, value)
}

/// JSON literals (numbers, booleans, arrays, tables) keep their type;
/// anything else is taken as a bare string.
fn override_value(raw: &str) -> Value {
    match raw.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    serde_json::from_str::<Value>(raw)
        .ok()
        .filter(|value| !value.is_string() && !value.is_null())
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    2e-3
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_momentum() -> f64 {
    0.9
}

fn default_warmup_steps() -> usize {
    500
}

fn default_warmup_ratio() -> f64 {
    0.1
}

fn default_end_ratio() -> f64 {
    0.01
}

fn default_power() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    25
}

fn default_save_optim_every() -> usize {
    10
}

fn default_grad_accum_split() -> usize {
    1
}

fn default_min_coverage() -> f64 {
    0.5
}

fn default_clip_quantile() -> f64 {
    0.5
}

fn default_clip_factor() -> f64 {
    2.0
}

fn default_clip_buffer() -> usize {
    100
}

fn default_clip_max_norm() -> f64 {
    2.0
}

fn default_initial_scale() -> f32 {
    2f32.powi(16)
}

fn default_growth_factor() -> f32 {
    2.0
}

fn default_backoff_factor() -> f32 {
    0.5
}

fn default_growth_interval() -> usize {
    2000
}
