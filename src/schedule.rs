//! Learning-rate schedules for the co-design loop.

use burn_optim::LearningRate;

use crate::{Error, Result};

/// Steps of the decay schedule between halvings.
pub const STEP_SIZE: usize = 25;
/// Multiplicative decay applied every [`STEP_SIZE`] steps.
pub const GAMMA: f64 = 0.5;

/// A learning-rate schedule advanced once per optimizer step.
pub trait LrSchedule {
    /// Rate for the next optimizer step.
    fn current_lr(&self) -> LearningRate;
    /// Advance past one optimizer step and return the new rate.
    fn step(&mut self) -> LearningRate;
}

/// Fixed rate.
#[derive(Debug, Clone, Copy)]
pub struct Constant(pub LearningRate);

impl LrSchedule for Constant {
    fn current_lr(&self) -> LearningRate {
        self.0
    }

    fn step(&mut self) -> LearningRate {
        self.0
    }
}

/// `lr(k) = base_lr · gamma^floor(k / step_size)` for optimizer step `k` (0-based).
#[derive(Debug, Clone)]
pub struct StepDecay {
    base_lr: LearningRate,
    step_size: usize,
    gamma: f64,
    steps: usize,
}

impl StepDecay {
    pub fn new(base_lr: LearningRate, step_size: usize, gamma: f64) -> Result<Self> {
        if !base_lr.is_finite() || base_lr <= 0.0 {
            return Err(Error::Domain(format!("learning rate must be positive, got {base_lr}")));
        }
        if step_size == 0 {
            return Err(Error::Domain("step_size must be >= 1".into()));
        }
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(Error::Domain(format!("gamma must be positive, got {gamma}")));
        }
        Ok(Self {
            base_lr,
            step_size,
            gamma,
            steps: 0,
        })
    }
}

impl LrSchedule for StepDecay {
    fn current_lr(&self) -> LearningRate {
        let epochs = (self.steps / self.step_size) as i32;
        self.base_lr * self.gamma.powi(epochs)
    }

    fn step(&mut self) -> LearningRate {
        self.steps += 1;
        self.current_lr()
    }
}

/// `StepDecay(STEP_SIZE, GAMMA)` when `use_scheduler`, otherwise a constant rate.
pub fn from_run(lr: LearningRate, use_scheduler: bool) -> Result<Box<dyn LrSchedule>> {
    if use_scheduler {
        Ok(Box::new(StepDecay::new(lr, STEP_SIZE, GAMMA)?))
    } else {
        Ok(Box::new(Constant(lr)))
    }
}
