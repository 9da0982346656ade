// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{nchw, nchw_tensor};
use crate::{PureResult, Tensor, TensorError};

/// Stride, symmetric zero padding and dilation shared by both spatial axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvGeometry {
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
}

impl Default for ConvGeometry {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            dilation: 1,
        }
    }
}

impl ConvGeometry {
    pub fn new(stride: usize, padding: usize, dilation: usize) -> PureResult<Self> {
        if stride == 0 || dilation == 0 {
            return Err(TensorError::InvalidValue {
                label: "conv_geometry",
            });
        }
        Ok(Self {
            stride,
            padding,
            dilation,
        })
    }

    /// Unit stride with the padding that preserves spatial size for an odd
    /// `kernel`.
    pub fn same(kernel: usize, dilation: usize) -> Self {
        Self {
            stride: 1,
            padding: dilation.max(1) * kernel.saturating_sub(1) / 2,
            dilation: dilation.max(1),
        }
    }

    /// Strided variant of [`ConvGeometry::same`].
    pub fn strided(kernel: usize, stride: usize) -> Self {
        Self {
            stride: stride.max(1),
            padding: kernel.saturating_sub(1) / 2,
            dilation: 1,
        }
    }

    fn dilated_extent(&self, kernel: usize) -> usize {
        (kernel - 1) * self.dilation + 1
    }

    /// Output spatial size for an input of `input_hw` and a `kernel_hw` kernel.
    pub fn output_hw(
        &self,
        input_hw: (usize, usize),
        kernel_hw: (usize, usize),
    ) -> PureResult<(usize, usize)> {
        let (h, w) = input_hw;
        let eff_kh = self.dilated_extent(kernel_hw.0);
        let eff_kw = self.dilated_extent(kernel_hw.1);
        let padded_h = h + 2 * self.padding;
        let padded_w = w + 2 * self.padding;
        if padded_h < eff_kh || padded_w < eff_kw {
            return Err(TensorError::InvalidDimensions {
                shape: vec![padded_h, padded_w, eff_kh, eff_kw],
            });
        }
        Ok((
            (padded_h - eff_kh) / self.stride + 1,
            (padded_w - eff_kw) / self.stride + 1,
        ))
    }
}

/// Gradients produced by [`conv2d_backward`].
#[derive(Debug, Clone)]
pub struct Conv2dGrads {
    pub input: Tensor,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

struct Layout {
    batch: usize,
    in_channels: usize,
    input_hw: (usize, usize),
    out_channels: usize,
    kernel: (usize, usize),
    output_hw: (usize, usize),
    geometry: ConvGeometry,
}

impl Layout {
    fn resolve(input: &Tensor, weight: &Tensor, geometry: ConvGeometry) -> PureResult<Self> {
        let (batch, in_channels, h, w) = nchw(input)?;
        let (out_channels, weight_in, kh, kw) = nchw(weight)?;
        if weight_in != in_channels {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: weight.shape().to_vec(),
            });
        }
        weight.ensure_device(input.device())?;
        let output_hw = geometry.output_hw((h, w), (kh, kw))?;
        Ok(Self {
            batch,
            in_channels,
            input_hw: (h, w),
            out_channels,
            kernel: (kh, kw),
            output_hw,
            geometry,
        })
    }

    fn kernel_elems(&self) -> usize {
        self.in_channels * self.kernel.0 * self.kernel.1
    }

    fn rows(&self) -> usize {
        self.batch * self.output_hw.0 * self.output_hw.1
    }

    /// Maps a patch element back to an input coordinate, `None` inside padding.
    fn source(&self, oh: usize, ow: usize, kh: usize, kw: usize) -> Option<(usize, usize)> {
        let g = &self.geometry;
        let idx_h = (oh * g.stride + kh * g.dilation) as isize - g.padding as isize;
        let idx_w = (ow * g.stride + kw * g.dilation) as isize - g.padding as isize;
        let (h, w) = self.input_hw;
        if idx_h < 0 || idx_w < 0 || idx_h >= h as isize || idx_w >= w as isize {
            None
        } else {
            Some((idx_h as usize, idx_w as usize))
        }
    }

    fn im2col(&self, input: &Tensor) -> PureResult<Tensor> {
        let kernel_elems = self.kernel_elems();
        let (h, w) = self.input_hw;
        let (oh, ow) = self.output_hw;
        let sample = self.in_channels * h * w;
        let input_data = input.data();
        let mut columns = vec![0.0f32; self.rows() * kernel_elems];
        for b in 0..self.batch {
            let image = &input_data[b * sample..(b + 1) * sample];
            for oh_idx in 0..oh {
                for ow_idx in 0..ow {
                    let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                    let row = &mut columns[row_index * kernel_elems..(row_index + 1) * kernel_elems];
                    let mut col_idx = 0;
                    for ic in 0..self.in_channels {
                        let channel_offset = ic * h * w;
                        for kh in 0..self.kernel.0 {
                            for kw in 0..self.kernel.1 {
                                if let Some((ih, iw)) = self.source(oh_idx, ow_idx, kh, kw) {
                                    row[col_idx] = image[channel_offset + ih * w + iw];
                                }
                                col_idx += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(Tensor::from_vec(&[self.rows(), kernel_elems], columns)?.to_device(input.device()))
    }

    fn col2im(&self, cols: &Tensor) -> PureResult<Vec<f32>> {
        let kernel_elems = self.kernel_elems();
        let (h, w) = self.input_hw;
        let (oh, ow) = self.output_hw;
        let sample = self.in_channels * h * w;
        let cols_data = cols.data();
        let mut output = vec![0.0f32; self.batch * sample];
        for b in 0..self.batch {
            let grad_in = &mut output[b * sample..(b + 1) * sample];
            for oh_idx in 0..oh {
                for ow_idx in 0..ow {
                    let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                    let row = &cols_data[row_index * kernel_elems..(row_index + 1) * kernel_elems];
                    let mut col_idx = 0;
                    for ic in 0..self.in_channels {
                        let channel_offset = ic * h * w;
                        for kh in 0..self.kernel.0 {
                            for kw in 0..self.kernel.1 {
                                if let Some((ih, iw)) = self.source(oh_idx, ow_idx, kh, kw) {
                                    grad_in[channel_offset + ih * w + iw] += row[col_idx];
                                }
                                col_idx += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    /// `[N, O, OH, OW]` gradient → `[N·OH·OW, O]` matrix.
    fn grad_output_to_matrix(&self, grad_output: &Tensor) -> PureResult<Tensor> {
        let (oh, ow) = self.output_hw;
        let spatial = oh * ow;
        let grad = grad_output.data();
        let mut matrix = vec![0.0f32; self.rows() * self.out_channels];
        for b in 0..self.batch {
            for oc in 0..self.out_channels {
                let plane = &grad[(b * self.out_channels + oc) * spatial..][..spatial];
                for (pos, &value) in plane.iter().enumerate() {
                    matrix[(b * spatial + pos) * self.out_channels + oc] = value;
                }
            }
        }
        Ok(Tensor::from_vec(&[self.rows(), self.out_channels], matrix)?
            .to_device(grad_output.device()))
    }
}

/// 2-D convolution of `input [N, C, H, W]` with `weight [O, C, KH, KW]` and an
/// optional `bias [O]`.
pub fn conv2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    geometry: ConvGeometry,
) -> PureResult<Tensor> {
    let layout = Layout::resolve(input, weight, geometry)?;
    if let Some(bias) = bias {
        if bias.numel() != layout.out_channels {
            return Err(TensorError::ShapeMismatch {
                left: bias.shape().to_vec(),
                right: vec![layout.out_channels],
            });
        }
        bias.ensure_device(input.device())?;
    }
    let patches = layout.im2col(input)?;
    let kernel = weight.reshape(&[layout.out_channels, layout.kernel_elems()])?;
    let product = patches.matmul(&kernel.transpose()?)?;

    let (oh, ow) = layout.output_hw;
    let spatial = oh * ow;
    let rows = product.data();
    let mut out = vec![0.0f32; layout.batch * layout.out_channels * spatial];
    for b in 0..layout.batch {
        for pos in 0..spatial {
            let row = &rows[(b * spatial + pos) * layout.out_channels..][..layout.out_channels];
            for (oc, &value) in row.iter().enumerate() {
                let shift = bias.map(|bias| bias.data()[oc]).unwrap_or(0.0);
                out[(b * layout.out_channels + oc) * spatial + pos] = value + shift;
            }
        }
    }
    nchw_tensor(
        (layout.batch, layout.out_channels, oh, ow),
        out,
        input.device(),
    )
}

/// Gradients of [`conv2d`] with respect to its input, weight and (when
/// `with_bias`) bias.
pub fn conv2d_backward(
    input: &Tensor,
    weight: &Tensor,
    with_bias: bool,
    grad_output: &Tensor,
    geometry: ConvGeometry,
) -> PureResult<Conv2dGrads> {
    let layout = Layout::resolve(input, weight, geometry)?;
    let (oh, ow) = layout.output_hw;
    let expected = [layout.batch, layout.out_channels, oh, ow];
    if grad_output.shape() != expected {
        return Err(TensorError::ShapeMismatch {
            left: grad_output.shape().to_vec(),
            right: expected.to_vec(),
        });
    }
    let patches = layout.im2col(input)?;
    let grad_matrix = layout.grad_output_to_matrix(grad_output)?;
    let kernel = weight.reshape(&[layout.out_channels, layout.kernel_elems()])?;

    let grad_weight = grad_matrix
        .transpose()?
        .matmul(&patches)?
        .reshape(weight.shape())?;
    let bias = if with_bias {
        let sums = grad_matrix.sum_axis0()?;
        Some(Tensor::from_vec(&[layout.out_channels], sums)?.to_device(input.device()))
    } else {
        None
    };
    let grad_patches = grad_matrix.matmul(&kernel)?;
    let (h, w) = layout.input_hw;
    let grad_input = nchw_tensor(
        (layout.batch, layout.in_channels, h, w),
        layout.col2im(&grad_patches)?,
        input.device(),
    )?;
    Ok(Conv2dGrads {
        input: grad_input,
        weight: grad_weight,
        bias,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: &[usize], step: f32) -> Tensor {
        Tensor::from_fn(shape, |idx| (idx as f32 * step).sin()).unwrap()
    }

    #[test]
    fn identity_kernel_copies_input() {
        let input = ramp(&[1, 1, 3, 3], 0.7);
        let weight = Tensor::from_vec(&[1, 1, 1, 1], vec![1.0]).unwrap();
        let out = conv2d(&input, &weight, None, ConvGeometry::default()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn same_padding_preserves_size_under_dilation() {
        let input = ramp(&[2, 3, 7, 5], 0.3);
        let weight = ramp(&[4, 3, 3, 3], 0.11);
        let geometry = ConvGeometry::same(3, 2);
        let out = conv2d(&input, &weight, None, geometry).unwrap();
        assert_eq!(out.shape(), &[2, 4, 7, 5]);
        let strided = conv2d(&input, &weight, None, ConvGeometry::strided(3, 2)).unwrap();
        assert_eq!(strided.shape(), &[2, 4, 4, 3]);
    }

    #[test]
    fn bias_is_added_per_channel() {
        let input = Tensor::zeros(&[1, 1, 2, 2]).unwrap();
        let weight = Tensor::from_vec(&[2, 1, 1, 1], vec![1.0, 1.0]).unwrap();
        let bias = Tensor::from_slice(&[0.5, -1.0]).unwrap();
        let out = conv2d(&input, &weight, Some(&bias), ConvGeometry::default()).unwrap();
        assert_eq!(out.data(), &[0.5, 0.5, 0.5, 0.5, -1.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let input = ramp(&[1, 2, 4, 4], 0.37);
        let weight = ramp(&[3, 2, 3, 3], 0.19);
        let bias = Tensor::from_slice(&[0.1, -0.2, 0.3]).unwrap();
        let geometry = ConvGeometry::same(3, 1);
        let out = conv2d(&input, &weight, Some(&bias), geometry).unwrap();
        // loss = Σ out · probe
        let probe = ramp(out.shape(), 0.53);
        let grads = conv2d_backward(&input, &weight, true, &probe, geometry).unwrap();

        let loss = |input: &Tensor, weight: &Tensor| {
            conv2d(input, weight, Some(&bias), geometry)
                .unwrap()
                .dot(&probe)
                .unwrap()
        };
        let eps = 1e-2;
        for idx in [0usize, 7, 20, 41] {
            let mut plus = weight.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = weight.clone();
            minus.data_mut()[idx] -= eps;
            let numeric = (loss(&input, &plus) - loss(&input, &minus)) / (2.0 * eps);
            assert!((numeric - grads.weight.data()[idx]).abs() < 1e-2);
        }
        for idx in [0usize, 5, 17, 31] {
            let mut plus = input.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = input.clone();
            minus.data_mut()[idx] -= eps;
            let numeric = (loss(&plus, &weight) - loss(&minus, &weight)) / (2.0 * eps);
            assert!((numeric - grads.input.data()[idx]).abs() < 1e-2);
        }
        let bias_grad = grads.bias.unwrap();
        let per_channel: f32 = probe.data()[..16].iter().sum();
        assert!((bias_grad.data()[0] - per_channel).abs() < 1e-4);
    }

    #[test]
    fn rejects_channel_mismatch() {
        let input = Tensor::zeros(&[1, 2, 3, 3]).unwrap();
        let weight = Tensor::zeros(&[1, 3, 1, 1]).unwrap();
        assert!(conv2d(&input, &weight, None, ConvGeometry::default()).is_err());
    }
}
