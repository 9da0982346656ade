// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use std::collections::BTreeMap;

/// Name-ordered mapping from parameter names to tensors.
pub type StateDict = BTreeMap<String, Tensor>;

/// Trainable tensor with a Euclidean gradient accumulator.
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Parameter(name={},shape={:?},device={},has_grad={})",
            self.name,
            self.value.shape(),
            self.value.device(),
            self.gradient.is_some()
        )
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the currently accumulated gradient.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape().to_vec(),
                right: tensor.shape().to_vec(),
            });
        }
        tensor.ensure_device(self.value.device())
    }

    /// Accumulates a Euclidean gradient update.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => {
                self.gradient = Some(update.clone());
            }
        }
        Ok(())
    }

    /// Clears the cached gradient.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
    }

    /// Applies a plain gradient-descent step with the supplied learning rate
    /// and clears the accumulator. Non-finite gradients are refused.
    pub fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        if let Some(grad) = self.gradient.as_mut() {
            grad.ensure_finite("parameter_gradient")?;
            self.value.add_scaled(grad, -learning_rate)?;
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
        Ok(())
    }

    /// Clamps every accumulated gradient element into `[-limit, limit]`.
    pub fn clip_value(&mut self, limit: f32) -> PureResult<()> {
        if limit <= 0.0 || !limit.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "gradient_clip_limit",
            });
        }
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value = value.clamp(-limit, limit);
            }
        }
        Ok(())
    }

    /// Returns the squared L2 norm of the accumulated gradient.
    pub fn accumulators_norm_sq(&self) -> f64 {
        self.gradient
            .as_ref()
            .map(|grad| {
                grad.data()
                    .iter()
                    .map(|&value| {
                        let v = value as f64;
                        v * v
                    })
                    .sum::<f64>()
            })
            .unwrap_or(0.0)
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Parameter container. Forward and backward signatures differ between
/// layers, so the trait only covers what every owner of parameters shares:
/// enumeration, stepping and state dictionaries.
pub trait Module {
    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Applies every parameter update.
    fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Clamps every gradient element into `[-limit, limit]`.
    fn clip_gradients_value(&mut self, limit: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.clip_value(limit))
    }

    /// Total number of scalar parameters.
    fn parameter_count(&self) -> PureResult<usize> {
        let mut total = 0usize;
        self.visit_parameters(&mut |param| {
            total += param.value().numel();
            Ok(())
        })?;
        Ok(total)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<StateDict> {
        let mut state = StateDict::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &StateDict) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use op_tensor::Device;

    #[test]
    fn parameter_accumulates_and_steps() {
        let mut param = Parameter::new("coeffs", Tensor::from_slice(&[1.0, 2.0]).unwrap());
        let grad = Tensor::from_slice(&[0.5, -1.0]).unwrap();
        param.accumulate_euclidean(&grad).unwrap();
        param.accumulate_euclidean(&grad).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[1.0, -2.0]);
        param.apply_step(0.1).unwrap();
        let value = param.value().data();
        assert!((value[0] - 0.9).abs() < 1e-6);
        assert!((value[1] - 2.2).abs() < 1e-6);
        assert_eq!(param.accumulators_norm_sq(), 0.0);
    }

    #[test]
    fn parameter_rejects_foreign_device_updates() {
        let mut param = Parameter::new("z", Tensor::zeros(&[3]).unwrap());
        let grad = Tensor::zeros(&[3]).unwrap().to_device(Device::Cuda(0));
        assert!(matches!(
            param.accumulate_euclidean(&grad),
            Err(TensorError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn clip_value_bounds_gradient() {
        let mut param = Parameter::new("w", Tensor::zeros(&[3]).unwrap());
        param
            .accumulate_euclidean(&Tensor::from_slice(&[5.0, -0.05, -3.0]).unwrap())
            .unwrap();
        param.clip_value(0.1).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[0.1, -0.05, -0.1]);
        assert!(param.clip_value(0.0).is_err());
    }

    #[test]
    fn non_finite_gradient_blocks_step() {
        let mut param = Parameter::new("w", Tensor::zeros(&[2]).unwrap());
        param
            .accumulate_euclidean(&Tensor::from_slice(&[f32::NAN, 0.0]).unwrap())
            .unwrap();
        assert!(matches!(
            param.apply_step(0.1),
            Err(TensorError::NonFiniteValue { .. })
        ));
    }
}
