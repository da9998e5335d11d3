use candle_core::{backprop::GradStore, DType, Tensor};

use crate::{config::RuntimeConfig, error::Result};

const CLIP_EPS: f64 = 1e-6;
const SENTINEL_NORM: f64 = 1e6;

/// Fixed-capacity buffer that overwrites its oldest slot.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    values: Vec<f64>,
    cursor: usize,
}

impl RingBuffer {
    pub fn filled(capacity: usize, value: f64) -> Self {
        Self {
            values: vec![value; capacity.max(1)],
            cursor: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values[self.cursor] = value;
        self.cursor = (self.cursor + 1) % self.values.len();
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Quantile with linear interpolation between the closest ranks.
    pub fn quantile(&self, q: f64) -> f64 {
        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lower = position.floor() as usize;
        let upper = position.ceil() as usize;
        let fraction = position - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
    }
}

/// Clips against a multiple of a running quantile of recent gradient norms.
#[derive(Debug, Clone)]
pub struct QuantileClipper {
    buffer: RingBuffer,
    quantile: f64,
    factor: f64,
}

impl QuantileClipper {
    pub fn new(buffer_size: usize, quantile: f64, factor: f64) -> Self {
        Self {
            buffer: RingBuffer::filled(buffer_size, SENTINEL_NORM),
            quantile,
            factor,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.factor * self.buffer.quantile(self.quantile)
    }

    /// Records a finite norm. Non-finite norms leave the buffer untouched.
    pub fn observe(&mut self, norm: f64) -> bool {
        if norm.is_finite() {
            self.buffer.push(norm);
            true
        } else {
            false
        }
    }

    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }
}

impl Default for QuantileClipper {
    fn default() -> Self {
        Self::new(100, 0.5, 2.0)
    }
}

#[derive(Debug, Clone)]
pub enum GradientClipper {
    Fixed { max_norm: f64 },
    Quantile(QuantileClipper),
}

impl GradientClipper {
    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        let clip = &runtime.clip;
        if runtime.quantile_grad_clip {
            GradientClipper::Quantile(QuantileClipper::new(
                clip.buffer_size,
                clip.quantile,
                clip.factor,
            ))
        } else {
            GradientClipper::Fixed {
                max_norm: clip.max_norm,
            }
        }
    }

    pub fn threshold(&self) -> f64 {
        match self {
            GradientClipper::Fixed { max_norm } => *max_norm,
            GradientClipper::Quantile(clipper) => clipper.threshold(),
        }
    }

    /// Clips `grads` in place and returns the total norm measured before
    /// clipping.
    pub fn clip(&mut self, grads: &mut GradStore, params: &[Tensor]) -> Result<f64> {
        let max_norm = self.threshold();
        let norm = clip_grad_norm(grads, params, max_norm)?;
        if let GradientClipper::Quantile(clipper) = self {
            if !clipper.observe(norm) {
                tracing::debug!(norm, "non-finite gradient norm left out of clip history");
            }
        }
        Ok(norm)
    }
}

impl Default for GradientClipper {
    fn default() -> Self {
        GradientClipper::Fixed { max_norm: 2.0 }
    }
}

/// Global L2 norm over every parameter gradient present in `grads`.
pub fn grad_norm(grads: &GradStore, params: &[Tensor]) -> Result<f64> {
    let mut sum_squares = 0.0f64;
    for tensor in params {
        if let Some(grad) = grads.get(tensor) {
            let sq = grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_vec0::<f32>()? as f64;
            sum_squares += sq;
        }
    }
    Ok(sum_squares.sqrt())
}

pub fn clip_grad_norm(grads: &mut GradStore, params: &[Tensor], max_norm: f64) -> Result<f64> {
    let total_norm = grad_norm(grads, params)?;
    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + CLIP_EPS);
        for tensor in params {
            if let Some(grad) = grads.remove(tensor) {
                grads.insert(tensor, grad.affine(clip_coef, 0.0)?);
            }
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn quantile_interpolates_linearly() {
        let mut buffer = RingBuffer::filled(4, 0.0);
        for value in [4.0, 1.0, 3.0, 2.0] {
            buffer.push(value);
        }
        assert_eq!(buffer.cursor(), 0);
        assert_eq!(buffer.quantile(0.5), 2.5);
        assert_eq!(buffer.quantile(0.0), 1.0);
        assert_eq!(buffer.quantile(1.0), 4.0);
        assert!((buffer.quantile(0.25) - 1.75).abs() < 1e-12);
    }

    #[test]
    fn fresh_clipper_starts_from_sentinel() {
        let clipper = QuantileClipper::default();
        assert_eq!(clipper.threshold(), 2e6);
        assert_eq!(clipper.buffer().values().len(), 100);
    }

    #[test]
    fn threshold_is_twice_a_constant_history() {
        let mut clipper = QuantileClipper::default();
        for _ in 0..100 {
            clipper.observe(0.75);
        }
        assert_eq!(clipper.threshold(), 1.5);
    }

    #[test]
    fn non_finite_norms_do_not_advance_the_cursor() {
        let mut clipper = QuantileClipper::default();
        clipper.observe(3.0);
        let before = clipper.buffer().clone();

        assert!(!clipper.observe(f64::NAN));
        assert!(!clipper.observe(f64::INFINITY));

        assert_eq!(clipper.buffer().cursor(), before.cursor());
        assert_eq!(clipper.buffer().values(), before.values());
    }

    #[test]
    fn clip_scales_gradients_down_to_threshold() {
        let device = Device::Cpu;
        let w = Var::new(&[1f32, 1.0], &device).unwrap();
        let coeffs = Tensor::new(&[3f32, 4.0], &device).unwrap();
        let loss = w.as_tensor().mul(&coeffs).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let params = vec![w.as_tensor().clone()];

        let mut clipper = GradientClipper::Fixed { max_norm: 1.0 };
        let norm = clipper.clip(&mut grads, &params).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);

        let clipped = grad_norm(&grads, &params).unwrap();
        assert!((clipped - 1.0).abs() < 1e-5);
    }

    #[test]
    fn quantile_clipper_records_pre_clip_norm() {
        let device = Device::Cpu;
        let w = Var::new(&[2f32], &device).unwrap();
        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let params = vec![w.as_tensor().clone()];

        let mut clipper = GradientClipper::Quantile(QuantileClipper::new(3, 0.5, 2.0));
        let norm = clipper.clip(&mut grads, &params).unwrap();
        assert!((norm - 4.0).abs() < 1e-6);
        match &clipper {
            GradientClipper::Quantile(inner) => {
                assert_eq!(inner.buffer().cursor(), 1);
                assert!((inner.buffer().values()[0] - 4.0).abs() < 1e-6);
            }
            GradientClipper::Fixed { .. } => unreachable!(),
        }
    }
}
