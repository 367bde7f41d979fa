//! Learning-rate schedules as pure functions of the global step.
//!
//! A constant learning rate is the degenerate constant-function case, so
//! the trainer never branches on "constant or schedule".

use crate::{
    config::{ScheduleConfig, ScheduleKind},
    TrainingError,
};

pub trait LearningRateSchedule: Send + Sync {
    fn learning_rate(&self, step: u64) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantSchedule {
    learning_rate: f64,
}

impl ConstantSchedule {
    pub fn new(learning_rate: f64) -> Result<Self, TrainingError> {
        if learning_rate <= 0.0 {
            return Err(TrainingError::initialization(
                "schedule requires learning rate > 0",
            ));
        }
        Ok(Self { learning_rate })
    }
}

impl LearningRateSchedule for ConstantSchedule {
    fn learning_rate(&self, _step: u64) -> f64 {
        self.learning_rate
    }
}

/// The warmup-then-inverse-square-root schedule:
/// `scale * min(step^-0.5, step * warmup^-1.5)`.
#[derive(Debug, Clone, Copy)]
pub struct TransformerSchedule {
    scale: f64,
    warmup_steps: u64,
}

impl TransformerSchedule {
    pub fn new(scale: f64, warmup_steps: u64) -> Result<Self, TrainingError> {
        if scale <= 0.0 {
            return Err(TrainingError::initialization(
                "schedule requires scale > 0",
            ));
        }
        if warmup_steps == 0 {
            return Err(TrainingError::initialization(
                "schedule requires warmup_steps > 0",
            ));
        }
        Ok(Self {
            scale,
            warmup_steps,
        })
    }
}

impl LearningRateSchedule for TransformerSchedule {
    fn learning_rate(&self, step: u64) -> f64 {
        let step = step.max(1) as f64;
        let warmup = self.warmup_steps as f64;
        self.scale * (step.powf(-0.5)).min(step * warmup.powf(-1.5))
    }
}

/// Builds the schedule configured for a run. `hidden_size` feeds the
/// default warmup scale of `hidden_size^-0.5`.
pub fn build_schedule(
    config: &ScheduleConfig,
    base_learning_rate: f64,
    hidden_size: usize,
) -> Result<Box<dyn LearningRateSchedule>, TrainingError> {
    match config.strategy {
        ScheduleKind::Constant => Ok(Box::new(ConstantSchedule::new(base_learning_rate)?)),
        ScheduleKind::TransformerWarmup => {
            let scale = config
                .scale
                .unwrap_or_else(|| (hidden_size.max(1) as f64).powf(-0.5));
            Ok(Box::new(TransformerSchedule::new(
                scale,
                config.warmup_steps,
            )?))
        }
    }
}
