use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{
    config::{OptimizerConfig, OptimizerType},
    TrainingError,
};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub enum Algorithm {
    Sgd,
    Adam { beta1: f64, beta2: f64, epsilon: f64 },
}

impl From<&OptimizerConfig> for Algorithm {
    fn from(config: &OptimizerConfig) -> Self {
        match config.algorithm {
            OptimizerType::Sgd => Algorithm::Sgd,
            OptimizerType::Adam => Algorithm::Adam {
                beta1: config.beta1,
                beta2: config.beta2,
                epsilon: config.epsilon,
            },
        }
    }
}

/// Applies gradient updates to named parameter slots. The learning rate is
/// supplied per step by the caller's schedule; the optimizer holds no
/// schedule state of its own.
#[derive(Debug)]
pub struct TrainerOptimizer {
    algorithm: Algorithm,
    slots: Vec<ParameterSlot>,
    step: u64,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Option<Tensor>,
    second_moment: Option<Tensor>,
}

/// Gradient norms observed while applying one update.
#[derive(Debug, Clone, Default)]
pub struct GradientReport {
    pub global_norm: f64,
    pub per_parameter: Vec<(String, f64)>,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        algorithm: Algorithm,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let needs_moments = matches!(algorithm, Algorithm::Adam { .. });
        let mut slots = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let (first_moment, second_moment) = if needs_moments {
                let shape = tensor.dims().to_vec();
                let device = tensor.device();
                (
                    Some(
                        Tensor::zeros(shape.as_slice(), DType::F32, device)
                            .map_err(to_runtime_error)?,
                    ),
                    Some(
                        Tensor::zeros(shape.as_slice(), DType::F32, device)
                            .map_err(to_runtime_error)?,
                    ),
                )
            } else {
                (None, None)
            };
            slots.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            algorithm,
            slots,
            step: 0,
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.param.as_tensor().elem_count())
            .sum()
    }

    /// Consumes the gradients for every tracked parameter and applies one
    /// update with the given learning rate.
    pub fn step(
        &mut self,
        learning_rate: f64,
        grads: &mut GradStore,
    ) -> Result<GradientReport, TrainingError> {
        let mut processed = Vec::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm = tensor_l2_norm(&grad)?;
            processed.push((idx, grad, norm));
        }

        if processed.is_empty() {
            return Ok(GradientReport::default());
        }

        let global_norm = processed
            .iter()
            .map(|(_, _, norm)| norm * norm)
            .sum::<f64>()
            .sqrt();
        let per_parameter = processed
            .iter()
            .map(|(idx, _, norm)| (self.slots[*idx].name.clone(), *norm))
            .collect();

        self.step += 1;
        match self.algorithm {
            Algorithm::Sgd => self.step_sgd(learning_rate, processed)?,
            Algorithm::Adam {
                beta1,
                beta2,
                epsilon,
            } => self.step_adam(learning_rate, beta1, beta2, epsilon, processed)?,
        }

        Ok(GradientReport {
            global_norm,
            per_parameter,
        })
    }

    fn step_sgd(
        &mut self,
        learning_rate: f64,
        processed: Vec<(usize, Tensor, f64)>,
    ) -> Result<(), TrainingError> {
        for (idx, grad, _) in processed {
            let slot = &mut self.slots[idx];
            let update = grad.affine(learning_rate, 0.0).map_err(to_runtime_error)?;
            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    fn step_adam(
        &mut self,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        processed: Vec<(usize, Tensor, f64)>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (idx, grad, _) in processed {
            let slot = &mut self.slots[idx];
            let first = slot.first_moment.as_ref().ok_or_else(|| {
                TrainingError::runtime("adam slot is missing its first moment")
            })?;
            let second = slot.second_moment.as_ref().ok_or_else(|| {
                TrainingError::runtime("adam slot is missing its second moment")
            })?;

            let new_m = first
                .affine(beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad.affine(1.0 - beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let new_v = second
                .affine(beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad_sq.affine(1.0 - beta2, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
            slot.first_moment = Some(new_m);
            slot.second_moment = Some(new_v);
        }
        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.slots {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel: usize = shape.iter().product();
            let first_moment = slot
                .first_moment
                .as_ref()
                .map(|m| flatten_to_vec(m, numel))
                .transpose()?;
            let second_moment = slot
                .second_moment
                .as_ref()
                .map(|m| flatten_to_vec(m, numel))
                .transpose()?;
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment,
                second_moment,
            });
        }
        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let needs_moments = matches!(self.algorithm, Algorithm::Adam { .. });
        for slot in &mut self.slots {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;

            if slot.param.as_tensor().dims() != state.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected: usize = state.shape.iter().product();
            let device = slot.param.as_tensor().device().clone();

            match (needs_moments, state.first_moment, state.second_moment) {
                (true, Some(first), Some(second)) => {
                    if first.len() != expected || second.len() != expected {
                        return Err(TrainingError::runtime(format!(
                            "optimizer state size mismatch for '{}'",
                            slot.name
                        )));
                    }
                    slot.first_moment = Some(restore_tensor(first, &state.shape, &device)?);
                    slot.second_moment = Some(restore_tensor(second, &state.shape, &device)?);
                }
                (false, None, None) => {}
                _ => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state moment layout does not match the configured algorithm for '{}'",
                        slot.name
                    )));
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: u64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Option<Vec<f32>>,
    pub second_moment: Option<Vec<f32>>,
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn restore_tensor(
    values: Vec<f32>,
    shape: &[usize],
    device: &candle_core::Device,
) -> Result<Tensor, TrainingError> {
    let numel = values.len();
    Tensor::from_vec(values, numel, device)
        .map_err(to_runtime_error)?
        .reshape(shape)
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn single_param(value: f32) -> (String, Var) {
        let tensor = Tensor::from_vec(vec![value], 1, &Device::Cpu).unwrap();
        ("weight".to_string(), Var::from_tensor(&tensor).unwrap())
    }

    #[test]
    fn sgd_descends_a_quadratic() {
        let (name, var) = single_param(1.0);
        let mut optimizer =
            TrainerOptimizer::new(vec![(name, var.clone())], Algorithm::Sgd).unwrap();

        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let report = optimizer.step(0.1, &mut grads).unwrap();

        // d(x^2)/dx at x=1 is 2, so the value moves to 0.8.
        let value = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((value - 0.8).abs() < 1e-6);
        assert!((report.global_norm - 2.0).abs() < 1e-6);
        assert_eq!(report.per_parameter.len(), 1);
    }

    #[test]
    fn adam_state_round_trips() {
        let algorithm = Algorithm::Adam {
            beta1: 0.9,
            beta2: 0.98,
            epsilon: 1e-9,
        };
        let (name, var) = single_param(1.0);
        let mut optimizer =
            TrainerOptimizer::new(vec![(name.clone(), var.clone())], algorithm).unwrap();

        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(0.01, &mut grads).unwrap();

        let state = optimizer.state().unwrap();
        assert_eq!(state.step, 1);

        let (name2, var2) = single_param(1.0);
        assert_eq!(name2, name);
        let mut restored = TrainerOptimizer::new(vec![(name2, var2)], algorithm).unwrap();
        restored.load_state(state).unwrap();
    }

    #[test]
    fn load_state_rejects_unknown_parameters() {
        let (name, var) = single_param(1.0);
        let mut optimizer = TrainerOptimizer::new(vec![(name, var)], Algorithm::Sgd).unwrap();
        let state = OptimizerState {
            step: 3,
            parameters: vec![ParameterState {
                name: "other".to_string(),
                shape: vec![1],
                first_moment: None,
                second_moment: None,
            }],
        };
        assert!(optimizer.load_state(state).is_err());
    }
}
