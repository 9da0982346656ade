// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{nchw, nchw_tensor};
use crate::{PureResult, Tensor, TensorError};

/// Source coordinate and interpolation weight for one output index under
/// align-corners sampling.
fn taps(out_len: usize, in_len: usize) -> Vec<(usize, usize, f32)> {
    let ratio = if out_len > 1 {
        (in_len - 1) as f32 / (out_len - 1) as f32
    } else {
        0.0
    };
    (0..out_len)
        .map(|o| {
            let src = o as f32 * ratio;
            let lo = (src.floor() as usize).min(in_len - 1);
            let hi = (lo + 1).min(in_len - 1);
            (lo, hi, src - lo as f32)
        })
        .collect()
}

/// Bilinear resize of `[N, C, H, W]` to `size` with corner pixels aligned.
pub fn upsample_bilinear(input: &Tensor, size: (usize, usize)) -> PureResult<Tensor> {
    let (n, c, h, w) = nchw(input)?;
    let (oh, ow) = size;
    if oh == 0 || ow == 0 {
        return Err(TensorError::InvalidDimensions {
            shape: vec![n, c, oh, ow],
        });
    }
    if (oh, ow) == (h, w) {
        return Ok(input.clone());
    }
    let rows = taps(oh, h);
    let cols = taps(ow, w);
    let mut out = Vec::with_capacity(n * c * oh * ow);
    for plane in input.data().chunks(h * w) {
        for &(y0, y1, fy) in &rows {
            for &(x0, x1, fx) in &cols {
                let top = plane[y0 * w + x0] * (1.0 - fx) + plane[y0 * w + x1] * fx;
                let bottom = plane[y1 * w + x0] * (1.0 - fx) + plane[y1 * w + x1] * fx;
                out.push(top * (1.0 - fy) + bottom * fy);
            }
        }
    }
    nchw_tensor((n, c, oh, ow), out, input.device())
}

/// Adjoint of [`upsample_bilinear`]: scatters the output gradient back onto
/// the `input_hw` grid.
pub fn upsample_bilinear_backward(
    grad_output: &Tensor,
    input_hw: (usize, usize),
) -> PureResult<Tensor> {
    let (n, c, oh, ow) = nchw(grad_output)?;
    let (h, w) = input_hw;
    if (oh, ow) == (h, w) {
        return Ok(grad_output.clone());
    }
    let rows = taps(oh, h);
    let cols = taps(ow, w);
    let mut grad = vec![0.0f32; n * c * h * w];
    for (plane_in, plane_out) in grad
        .chunks_mut(h * w)
        .zip(grad_output.data().chunks(oh * ow))
    {
        for (oy, &(y0, y1, fy)) in rows.iter().enumerate() {
            for (ox, &(x0, x1, fx)) in cols.iter().enumerate() {
                let g = plane_out[oy * ow + ox];
                plane_in[y0 * w + x0] += g * (1.0 - fy) * (1.0 - fx);
                plane_in[y0 * w + x1] += g * (1.0 - fy) * fx;
                plane_in[y1 * w + x0] += g * fy * (1.0 - fx);
                plane_in[y1 * w + x1] += g * fy * fx;
            }
        }
    }
    nchw_tensor((n, c, h, w), grad, grad_output.device())
}

/// Concatenates NCHW tensors along the channel axis.
pub fn concat_channels(parts: &[&Tensor]) -> PureResult<Tensor> {
    let first = parts
        .first()
        .ok_or(TensorError::EmptyInput("concat_channels"))?;
    let (n, _, h, w) = nchw(first)?;
    let mut channels = Vec::with_capacity(parts.len());
    for part in parts {
        let (pn, pc, ph, pw) = nchw(part)?;
        if (pn, ph, pw) != (n, h, w) {
            return Err(TensorError::ShapeMismatch {
                left: first.shape().to_vec(),
                right: part.shape().to_vec(),
            });
        }
        part.ensure_device(first.device())?;
        channels.push(pc);
    }
    let total: usize = channels.iter().sum();
    let plane = h * w;
    let mut data = Vec::with_capacity(n * total * plane);
    for b in 0..n {
        for (part, &pc) in parts.iter().zip(&channels) {
            data.extend_from_slice(&part.data()[b * pc * plane..(b + 1) * pc * plane]);
        }
    }
    nchw_tensor((n, total, h, w), data, first.device())
}

/// Inverse of [`concat_channels`].
pub fn split_channels(input: &Tensor, channels: &[usize]) -> PureResult<Vec<Tensor>> {
    let (n, c, h, w) = nchw(input)?;
    if channels.iter().sum::<usize>() != c {
        return Err(TensorError::ShapeMismatch {
            left: input.shape().to_vec(),
            right: channels.to_vec(),
        });
    }
    let plane = h * w;
    let mut parts: Vec<Vec<f32>> = channels
        .iter()
        .map(|&pc| Vec::with_capacity(n * pc * plane))
        .collect();
    for sample in input.data().chunks(c * plane) {
        let mut offset = 0;
        for (part, &pc) in parts.iter_mut().zip(channels) {
            part.extend_from_slice(&sample[offset * plane..(offset + pc) * plane]);
            offset += pc;
        }
    }
    parts
        .into_iter()
        .zip(channels)
        .map(|(data, &pc)| nchw_tensor((n, pc, h, w), data, input.device()))
        .collect()
}
