// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::nchw;
use crate::{PureResult, Tensor, TensorError};

/// Gradients of [`channel_affine`].
#[derive(Debug, Clone)]
pub struct AffineGrads {
    pub input: Tensor,
    pub scale: Tensor,
    pub shift: Tensor,
}

fn ensure_channel_vector(vector: &Tensor, channels: usize, input: &Tensor) -> PureResult<()> {
    if vector.numel() != channels {
        return Err(TensorError::ShapeMismatch {
            left: vector.shape().to_vec(),
            right: vec![channels],
        });
    }
    vector.ensure_device(input.device())
}

/// Per-channel `y = x · scale[c] + shift[c]`. This is inference-mode batch
/// normalisation once the running statistics are folded into the affine pair.
pub fn channel_affine(input: &Tensor, scale: &Tensor, shift: &Tensor) -> PureResult<Tensor> {
    let (_, channels, h, w) = nchw(input)?;
    ensure_channel_vector(scale, channels, input)?;
    ensure_channel_vector(shift, channels, input)?;
    let plane = h * w;
    let mut out = input.clone();
    for (idx, chunk) in out.data_mut().chunks_mut(plane).enumerate() {
        let c = idx % channels;
        let (s, b) = (scale.data()[c], shift.data()[c]);
        for value in chunk.iter_mut() {
            *value = *value * s + b;
        }
    }
    Ok(out)
}

pub fn channel_affine_backward(
    input: &Tensor,
    scale: &Tensor,
    grad_output: &Tensor,
) -> PureResult<AffineGrads> {
    let (_, channels, h, w) = nchw(input)?;
    ensure_channel_vector(scale, channels, input)?;
    input.ensure_compatible(grad_output)?;
    let plane = h * w;
    let mut grad_input = grad_output.clone();
    let mut grad_scale = vec![0.0f32; channels];
    let mut grad_shift = vec![0.0f32; channels];
    for (idx, (g_in, xs)) in grad_input
        .data_mut()
        .chunks_mut(plane)
        .zip(input.data().chunks(plane))
        .enumerate()
    {
        let c = idx % channels;
        let s = scale.data()[c];
        for (g, &x) in g_in.iter_mut().zip(xs.iter()) {
            grad_scale[c] += *g * x;
            grad_shift[c] += *g;
            *g *= s;
        }
    }
    Ok(AffineGrads {
        input: grad_input,
        scale: Tensor::from_vec(scale.shape(), grad_scale)?.to_device(input.device()),
        shift: Tensor::from_vec(scale.shape(), grad_shift)?.to_device(input.device()),
    })
}

pub fn relu(input: &Tensor) -> Tensor {
    input.map(|v| v.max(0.0))
}

/// Routes `grad_output` through the positions where the ReLU output was
/// positive.
pub fn relu_backward(output: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
    output.ensure_compatible(grad_output)?;
    let mut grad = grad_output.clone();
    for (g, &y) in grad.data_mut().iter_mut().zip(output.data()) {
        if y <= 0.0 {
            *g = 0.0;
        }
    }
    Ok(grad)
}
