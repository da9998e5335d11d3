use candle_core::{DType, Tensor};

use crate::error::{Result, TrainingError};

pub const PRIMARY_LOSS: &str = "loss";
pub const TOTAL_LOSS: &str = "total_loss";

/// What a criterion hands back: a bare scalar, or named components that
/// must include `loss` and may include `total_loss`.
#[derive(Debug, Clone)]
pub enum LossOutput {
    Scalar(Tensor),
    Components(Vec<(String, Tensor)>),
}

impl LossOutput {
    /// Picks the tensor to backpropagate and reads every component's value.
    pub fn resolve(self) -> Result<ResolvedLoss> {
        match self {
            LossOutput::Scalar(loss) => {
                let mut record = LossRecord::default();
                record.insert(PRIMARY_LOSS, scalar_value(&loss)?);
                Ok(ResolvedLoss {
                    optimized: loss,
                    record,
                })
            }
            LossOutput::Components(components) => {
                let mut record = LossRecord::default();
                let mut primary = None;
                let mut total = None;
                for (name, tensor) in components {
                    record.insert(&name, scalar_value(&tensor)?);
                    match name.as_str() {
                        PRIMARY_LOSS => primary = Some(tensor),
                        TOTAL_LOSS => total = Some(tensor),
                        _ => {}
                    }
                }
                let primary = primary.ok_or_else(|| {
                    TrainingError::runtime("loss components are missing the `loss` entry")
                })?;
                Ok(ResolvedLoss {
                    optimized: total.unwrap_or(primary),
                    record,
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedLoss {
    pub optimized: Tensor,
    pub record: LossRecord,
}

/// Named loss values in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossRecord {
    entries: Vec<(String, f64)>,
}

impl LossRecord {
    pub fn insert(&mut self, name: &str, value: f64) {
        match self.entries.iter_mut().find(|(key, _)| key == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    pub fn primary(&self) -> Option<f64> {
        self.get(PRIMARY_LOSS)
    }

    /// Adds `weight * value` of every entry in `other`.
    pub fn accumulate(&mut self, other: &LossRecord, weight: f64) {
        for (name, value) in &other.entries {
            let current = self.get(name).unwrap_or(0.0);
            self.insert(name, current + value * weight);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, f64)> for LossRecord {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        let mut record = LossRecord::default();
        for (name, value) in iter {
            record.insert(&name, value);
        }
        record
    }
}

pub(crate) fn scalar_value(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F64)?.sum_all()?.to_vec0::<f64>()?)
}
