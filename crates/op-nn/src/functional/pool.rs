// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{nchw, nchw_tensor};
use crate::{PureResult, Tensor, TensorError};

/// Averages each channel plane, producing `[N, C, 1, 1]`.
pub fn global_avg_pool(input: &Tensor) -> PureResult<Tensor> {
    let (n, c, h, w) = nchw(input)?;
    let plane = h * w;
    let data = input
        .data()
        .chunks(plane)
        .map(|chunk| chunk.iter().sum::<f32>() / plane as f32)
        .collect();
    nchw_tensor((n, c, 1, 1), data, input.device())
}

/// Spreads a `[N, C, 1, 1]` gradient evenly over an `input_hw` plane.
pub fn global_avg_pool_backward(
    grad_output: &Tensor,
    input_hw: (usize, usize),
) -> PureResult<Tensor> {
    let (n, c, gh, gw) = nchw(grad_output)?;
    if gh != 1 || gw != 1 {
        return Err(TensorError::ShapeMismatch {
            left: grad_output.shape().to_vec(),
            right: vec![n, c, 1, 1],
        });
    }
    let (h, w) = input_hw;
    let plane = h * w;
    let mut data = Vec::with_capacity(n * c * plane);
    for &g in grad_output.data() {
        data.extend(std::iter::repeat(g / plane as f32).take(plane));
    }
    nchw_tensor((n, c, h, w), data, grad_output.device())
}
