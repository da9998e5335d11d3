use std::f64::consts::PI;

use crate::{
    config::{ScheduleStrategy, SchedulerConfig},
    error::{Result, TrainingError},
};

/// Per-step learning-rate policy over every parameter group.
pub trait LRScheduler: Send {
    /// Advances one optimizer step.
    fn step(&mut self);
    /// Rates to use for the next optimizer step, one per group.
    fn last_lr(&self) -> &[f64];
}

/// Builds a scheduler that continues from `last_epoch` completed epochs.
pub trait SchedulerFactory {
    fn build(
        &self,
        base_lrs: Vec<f64>,
        steps_per_epoch: usize,
        epochs: usize,
        last_epoch: usize,
    ) -> Result<Box<dyn LRScheduler>>;
}

/// Multiplier curve over training progress `t` in `[0, 1]`.
#[derive(Debug, Clone)]
pub enum Curve {
    Constant,
    Linear { from: f64, to: f64 },
    Cosine { from: f64, to: f64 },
    Polynomial { from: f64, to: f64, power: f64 },
    /// `knots` split `[0, 1]`; piece `i` sees its own interval rescaled to `[0, 1]`.
    Piecewise { knots: Vec<f64>, pieces: Vec<Curve> },
}

impl Curve {
    pub fn eval(&self, t: f64) -> f64 {
        match self {
            Curve::Constant => 1.0,
            Curve::Linear { from, to } => from + (to - from) * t,
            Curve::Cosine { from, to } => to + 0.5 * (from - to) * ((t * PI).cos() + 1.0),
            Curve::Polynomial { from, to, power } => {
                to + (from - to) * (1.0 - t).max(0.0).powf(*power)
            }
            Curve::Piecewise { knots, pieces } => {
                let index = knots.iter().take_while(|knot| **knot < t).count();
                let start = if index == 0 { 0.0 } else { knots[index - 1] };
                let end = if index == knots.len() { 1.0 } else { knots[index] };
                let span = end - start;
                let local = if span > 0.0 { (t - start) / span } else { 0.0 };
                pieces[index].eval(local)
            }
        }
    }

    /// Prefixes a linear ramp from `ratio * f(0)` to `f(0)` over the first
    /// `warmup_steps` of `total_steps`.
    pub fn with_warmup(self, warmup_steps: usize, total_steps: usize, ratio: f64) -> Curve {
        if warmup_steps == 0 || total_steps == 0 {
            return self;
        }
        let peak = self.eval(0.0);
        Curve::Piecewise {
            knots: vec![warmup_steps as f64 / total_steps as f64],
            pieces: vec![
                Curve::Linear {
                    from: ratio * peak,
                    to: peak,
                },
                self,
            ],
        }
    }
}

/// Multiplies each group's base rate by `curve((step + start_step) / total_steps)`.
#[derive(Debug, Clone)]
pub struct FuncScheduler {
    curve: Curve,
    base_lrs: Vec<f64>,
    total_steps: usize,
    start_step: usize,
    step: usize,
    current: Vec<f64>,
}

impl FuncScheduler {
    pub fn new(
        curve: Curve,
        base_lrs: Vec<f64>,
        total_steps: usize,
        start_step: usize,
    ) -> Result<Self> {
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        if base_lrs.is_empty() {
            return Err(TrainingError::initialization(
                "scheduler requires at least one parameter group",
            ));
        }
        let mut scheduler = Self {
            curve,
            base_lrs,
            total_steps,
            start_step,
            step: 0,
            current: Vec::new(),
        };
        scheduler.current = scheduler.rates_at(0);
        Ok(scheduler)
    }

    fn rates_at(&self, step: usize) -> Vec<f64> {
        let t = (step + self.start_step) as f64 / self.total_steps as f64;
        let factor = self.curve.eval(t);
        self.base_lrs.iter().map(|lr| lr * factor).collect()
    }
}

impl LRScheduler for FuncScheduler {
    fn step(&mut self) {
        self.step = self.step.saturating_add(1);
        self.current = self.rates_at(self.step);
    }

    fn last_lr(&self) -> &[f64] {
        &self.current
    }
}

impl SchedulerConfig {
    pub fn curve(&self) -> Curve {
        match self.strategy {
            ScheduleStrategy::LinearWarmupCosineDecay => Curve::Cosine {
                from: 1.0,
                to: self.end_ratio,
            },
            ScheduleStrategy::Constant => Curve::Constant,
            ScheduleStrategy::Polynomial => Curve::Polynomial {
                from: 1.0,
                to: self.end_ratio,
                power: self.power,
            },
        }
    }
}

impl SchedulerFactory for SchedulerConfig {
    fn build(
        &self,
        base_lrs: Vec<f64>,
        steps_per_epoch: usize,
        epochs: usize,
        last_epoch: usize,
    ) -> Result<Box<dyn LRScheduler>> {
        let total_steps = epochs * steps_per_epoch;
        let curve = self
            .curve()
            .with_warmup(self.warmup_steps, total_steps, self.warmup_ratio);
        Ok(Box::new(FuncScheduler::new(
            curve,
            base_lrs,
            total_steps,
            last_epoch * steps_per_epoch,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(warmup_steps: usize) -> SchedulerConfig {
        SchedulerConfig {
            warmup_steps,
            ..SchedulerConfig::default()
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn warmup_ramps_from_ratio_to_peak() {
        let mut scheduler = cosine(10).build(vec![1.0], 10, 10, 0).unwrap();
        assert!(close(scheduler.last_lr()[0], 0.1));
        for _ in 0..5 {
            scheduler.step();
        }
        assert!(close(scheduler.last_lr()[0], 0.55));
        for _ in 0..5 {
            scheduler.step();
        }
        assert!(close(scheduler.last_lr()[0], 1.0));
    }

    #[test]
    fn cosine_decays_to_end_ratio() {
        let mut scheduler = cosine(0).build(vec![2.0, 1.0], 4, 5, 0).unwrap();
        assert!(close(scheduler.last_lr()[0], 2.0));
        assert!(close(scheduler.last_lr()[1], 1.0));
        for _ in 0..10 {
            scheduler.step();
        }
        let mid = 0.01 + 0.5 * 0.99;
        assert!(close(scheduler.last_lr()[1], mid));
        for _ in 0..10 {
            scheduler.step();
        }
        assert!(close(scheduler.last_lr()[0], 0.02));
    }

    #[test]
    fn resumed_schedule_continues_the_curve() {
        let steps_per_epoch = 7;
        let mut fresh = cosine(5).build(vec![1e-3], steps_per_epoch, 6, 0).unwrap();
        for _ in 0..3 * steps_per_epoch {
            fresh.step();
        }
        let resumed = cosine(5).build(vec![1e-3], steps_per_epoch, 6, 3).unwrap();
        assert!(close(fresh.last_lr()[0], resumed.last_lr()[0]));
    }

    #[test]
    fn polynomial_reaches_end_ratio() {
        let config = SchedulerConfig {
            strategy: ScheduleStrategy::Polynomial,
            warmup_steps: 0,
            power: 2.0,
            ..SchedulerConfig::default()
        };
        let curve = config.curve();
        assert!(close(curve.eval(0.0), 1.0));
        assert!(close(curve.eval(0.5), 0.01 + 0.99 * 0.25));
        assert!(close(curve.eval(1.0), 0.01));
    }

    #[test]
    fn zero_total_steps_is_rejected() {
        assert!(cosine(0).build(vec![1.0], 0, 3, 0).is_err());
    }
}
