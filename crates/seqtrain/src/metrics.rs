use crate::loss::LossRecord;

/// Smoothing weight given to each new loss value.
pub const LOSS_SMOOTHING: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// The first sample seeds the average.
    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// One moving average per loss key, in first-seen order.
#[derive(Debug, Clone)]
pub struct LossSmoother {
    alpha: f64,
    averages: Vec<(String, ExponentialMovingAverage)>,
}

impl Default for LossSmoother {
    fn default() -> Self {
        Self::new(LOSS_SMOOTHING)
    }
}

impl LossSmoother {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            averages: Vec::new(),
        }
    }

    pub fn update(&mut self, record: &LossRecord) {
        for (name, value) in record.iter() {
            let position = self.averages.iter().position(|(key, _)| key == name);
            let index = match position {
                Some(index) => index,
                None => {
                    self.averages
                        .push((name.to_string(), ExponentialMovingAverage::new(self.alpha)));
                    self.averages.len() - 1
                }
            };
            self.averages[index].1.update(value);
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.averages
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, ema)| ema.value())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.averages
            .iter()
            .filter_map(|(key, ema)| ema.value().map(|value| (key.as_str(), value)))
    }
}

/// Mean and median over pooled per-example accuracies.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccuracySummary {
    pub mean: f64,
    pub median: f64,
}

pub fn summarize(values: &[f64]) -> AccuracySummary {
    if values.is_empty() {
        return AccuracySummary::default();
    }
    AccuracySummary {
        mean: mean(values),
        median: median(values),
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
