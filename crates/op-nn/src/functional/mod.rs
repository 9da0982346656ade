// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Stateless NCHW operators. Weights arrive as arguments and gradients are
//! returned as raw sums; callers decide where they accumulate.

pub mod conv;
pub mod norm;
pub mod pool;
pub mod resample;

pub use conv::{conv2d, conv2d_backward, Conv2dGrads, ConvGeometry};
pub use norm::{channel_affine, channel_affine_backward, relu, relu_backward, AffineGrads};
pub use pool::{global_avg_pool, global_avg_pool_backward};
pub use resample::{
    concat_channels, split_channels, upsample_bilinear, upsample_bilinear_backward,
};

use crate::{PureResult, Tensor, TensorError};

/// Splits a rank-4 shape into `(batch, channels, height, width)`.
pub fn nchw(tensor: &Tensor) -> PureResult<(usize, usize, usize, usize)> {
    match tensor.shape() {
        &[n, c, h, w] => Ok((n, c, h, w)),
        other => Err(TensorError::InvalidDimensions {
            shape: other.to_vec(),
        }),
    }
}

/// Builds an NCHW tensor on `device`.
pub(crate) fn nchw_tensor(
    shape: (usize, usize, usize, usize),
    data: Vec<f32>,
    device: crate::Device,
) -> PureResult<Tensor> {
    let (n, c, h, w) = shape;
    Ok(Tensor::from_vec(&[n, c, h, w], data)?.to_device(device))
}
