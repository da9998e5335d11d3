use candle_core::{backprop::GradStore, DType, Tensor};

use crate::{config::LossScaleSettings, error::Result};

const MIN_SCALE: f32 = 1.0;
const MAX_SCALE: f32 = 16_777_216.0;

/// Dynamic loss scaling for reduced-precision steps.
///
/// The loss is multiplied by the current scale before backward and the
/// accumulated gradients are divided by it again before clipping. A step
/// with non-finite gradients halves the scale (by `backoff_factor`); every
/// `growth_interval` consecutive clean steps multiply it by `growth_factor`.
/// A disabled scaler keeps a scale of 1 and never changes it.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    enabled: bool,
    current: f32,
    clean_steps: usize,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
}

impl GradientScaler {
    pub fn new(settings: &LossScaleSettings, enabled: bool) -> Self {
        let current = if enabled {
            settings.initial_scale.clamp(MIN_SCALE, MAX_SCALE)
        } else {
            1.0
        };
        Self {
            enabled,
            current,
            clean_steps: 0,
            growth_factor: settings.growth_factor.max(1.0),
            backoff_factor: if settings.backoff_factor > 0.0 && settings.backoff_factor < 1.0 {
                settings.backoff_factor
            } else {
                0.5
            },
            growth_interval: settings.growth_interval.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&LossScaleSettings::default(), false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn loss_scale(&self) -> f32 {
        self.current
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.current as f64, 0.0)?)
    }

    /// Divides every parameter gradient in `grads` by the current scale.
    /// Returns `true` when any of them holds a NaN or infinity.
    pub fn unscale_grads(&self, grads: &mut GradStore, params: &[Tensor]) -> Result<bool> {
        let inverse = 1.0 / self.current as f64;
        let mut found_inf = false;
        for param in params {
            let Some(grad) = grads.remove(param) else {
                continue;
            };
            let grad = if self.enabled {
                grad.affine(inverse, 0.0)?
            } else {
                grad
            };
            found_inf = found_inf || !all_finite(&grad)?;
            grads.insert(param, grad);
        }
        Ok(found_inf)
    }

    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.current = (self.current * self.backoff_factor).max(MIN_SCALE);
            self.clean_steps = 0;
            return;
        }
        self.clean_steps += 1;
        if self.clean_steps == self.growth_interval {
            self.current = (self.current * self.growth_factor).min(MAX_SCALE);
            self.clean_steps = 0;
        }
    }
}

/// `false` if the tensor holds a NaN or infinity.
pub fn all_finite(tensor: &Tensor) -> Result<bool> {
    if tensor.elem_count() == 0 {
        return Ok(true);
    }
    let total = tensor
        .to_dtype(DType::F32)?
        .abs()?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(total.is_finite())
}
