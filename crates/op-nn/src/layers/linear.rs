// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{Device, PureResult, Tensor, TensorError};

/// Fully-connected layer computing `input · weight + bias` on `(batch, in)`
/// tensors.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Creates a new linear layer with deterministic small parameters.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                shape: vec![input_dim, output_dim],
            });
        }
        let mut scale = 0.01f32;
        let weights = Tensor::from_fn(&[input_dim, output_dim], |_| {
            let value = scale;
            scale += 0.01;
            value
        })?;
        let bias = Tensor::zeros(&[1, output_dim])?;
        Self::from_parts(name, weights, bias)
    }

    /// Creates a layer whose weights are drawn from `N(0, std²)` and whose
    /// bias is filled with `bias_fill`.
    pub fn seeded(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        std: f32,
        bias_fill: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let weights = Tensor::random_normal(&[input_dim, output_dim], 0.0, std, seed)?;
        let bias = Tensor::full(&[1, output_dim], bias_fill)?;
        Self::from_parts(name, weights, bias)
    }

    fn from_parts(name: impl Into<String>, weight: Tensor, bias: Tensor) -> PureResult<Self> {
        let name = name.into();
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    /// Moves both parameters to `device`.
    pub fn to_device(mut self, device: Device) -> Self {
        let weight = self.weight.value().clone().to_device(device);
        let bias = self.bias.value().clone().to_device(device);
        *self.weight.value_mut() = weight;
        *self.bias.value_mut() = bias;
        self
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    pub fn input_dim(&self) -> usize {
        self.weight.value().shape()[0]
    }

    pub fn output_dim(&self) -> usize {
        self.weight.value().shape()[1]
    }

    pub fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.dims() != 2 || input.shape()[1] != self.input_dim() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: self.weight.value().shape().to_vec(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        let bias = self.bias.value().data();
        let cols = self.output_dim();
        for row in out.data_mut().chunks_mut(cols) {
            for (dst, b) in row.iter_mut().zip(bias.iter()) {
                *dst += b;
            }
        }
        Ok(out)
    }

    /// Accumulates batch-averaged parameter gradients and returns the gradient
    /// with respect to `input`.
    pub fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape()[0] != grad_output.shape()[0] {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: grad_output.shape().to_vec(),
            });
        }
        let grad_input = self.backward_input(grad_output)?;
        self.accumulate(input, grad_output)?;
        Ok(grad_input)
    }

    /// Gradient with respect to the input only; parameters are left untouched.
    pub fn backward_input(&self, grad_output: &Tensor) -> PureResult<Tensor> {
        let weight_t = self.weight.value().transpose()?;
        grad_output.matmul(&weight_t)
    }

    fn accumulate(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<()> {
        let batch = input.shape()[0] as f32;
        let grad_w = input
            .transpose()?
            .matmul(grad_output)?
            .scale(1.0 / batch);
        self.weight.accumulate_euclidean(&grad_w)?;

        let summed = grad_output.sum_axis0()?;
        let grad_b = Tensor::from_vec(&[1, summed.len()], summed)?
            .to_device(grad_output.device())
            .scale(1.0 / batch);
        self.bias.accumulate_euclidean(&grad_b)
    }
}

impl Module for Linear {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_forward_matches_manual() {
        let layer = Linear::new("fc", 3, 2).unwrap();
        let input = Tensor::from_vec(&[1, 3], vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        let expected = input.matmul(layer.weight.value()).unwrap();
        assert_eq!(output, expected);
    }

    #[test]
    fn linear_backward_moves_weights() {
        let mut layer = Linear::seeded("fc", 4, 3, 0.1, 0.0, Some(5)).unwrap();
        let input =
            Tensor::from_vec(&[2, 4], vec![0.1, 0.2, -0.3, 0.4, -0.5, 0.6, 0.7, -0.8]).unwrap();
        let output = layer.forward(&input).unwrap();
        let grad = output.scale(0.5);
        let grad_input = layer.backward(&input, &grad).unwrap();
        assert_eq!(grad_input.shape(), &[2, 4]);
        let before = layer.weight().value().clone();
        layer.apply_step(0.1).unwrap();
        assert_ne!(before, *layer.weight().value());
    }

    #[test]
    fn bias_gradient_is_batch_mean() {
        let mut layer = Linear::new("fc", 1, 1).unwrap();
        let input = Tensor::from_vec(&[2, 1], vec![1.0, 1.0]).unwrap();
        let grad = Tensor::from_vec(&[2, 1], vec![2.0, 4.0]).unwrap();
        layer.backward(&input, &grad).unwrap();
        assert_eq!(layer.bias().gradient().unwrap().data(), &[3.0]);
    }

    #[test]
    fn rejects_wrong_input_width() {
        let layer = Linear::new("fc", 3, 2).unwrap();
        let input = Tensor::zeros(&[1, 4]).unwrap();
        assert!(layer.forward(&input).is_err());
    }
}
