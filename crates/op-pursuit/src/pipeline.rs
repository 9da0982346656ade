// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::backbone::Backbone;
use crate::error::{ensure_device, PursuitError, PursuitResult};
use crate::head::{DeeplabHead, HeadTrace, HeadWeights};
use op_nn::functional::{nchw, upsample_bilinear, upsample_bilinear_backward};
use op_nn::StateDict;
use op_tensor::{Device, Tensor};

/// Frozen backbone → supplied-weight head → align-corners upsample to the
/// input size.
pub struct SegmentationPipeline {
    backbone: Box<dyn Backbone>,
    head: DeeplabHead,
    device: Device,
}

/// Activations of one [`SegmentationPipeline::run`].
#[derive(Clone, Debug)]
pub struct PipelineTrace {
    head: HeadTrace,
    logits_hw: (usize, usize),
}

impl SegmentationPipeline {
    pub fn new(backbone: Box<dyn Backbone>, head: DeeplabHead, device: Device) -> PursuitResult<Self> {
        ensure_device(device, backbone.device())?;
        let config = head.config();
        if backbone.out_channels() != config.in_channels
            || backbone.low_level_channels() != config.low_level_channels
        {
            return Err(PursuitError::Invalid(format!(
                "backbone emits ({}, {}) channels but the head expects ({}, {})",
                backbone.out_channels(),
                backbone.low_level_channels(),
                config.in_channels,
                config.low_level_channels
            )));
        }
        Ok(Self {
            backbone,
            head,
            device,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn head(&self) -> &DeeplabHead {
        &self.head
    }

    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    /// Logits at the input resolution.
    pub fn run(&self, image: &Tensor, weights: &HeadWeights) -> PursuitResult<(Tensor, PipelineTrace)> {
        ensure_device(self.device, image.device())?;
        for tensor in weights.as_map().values() {
            ensure_device(self.device, tensor.device())?;
        }
        let (_, _, h, w) = nchw(image)?;
        let features = self.backbone.forward(image)?;
        let (logits, head) = self.head.forward(&features, weights)?;
        let (_, _, lh, lw) = nchw(&logits)?;
        let upsampled = upsample_bilinear(&logits, (h, w))?;
        Ok((
            upsampled,
            PipelineTrace {
                head,
                logits_hw: (lh, lw),
            },
        ))
    }

    /// Gradients of the head weights given `dL/dlogits` at input resolution.
    pub fn backprop(
        &self,
        trace: &PipelineTrace,
        weights: &HeadWeights,
        grad_logits: &Tensor,
    ) -> PursuitResult<StateDict> {
        ensure_device(self.device, grad_logits.device())?;
        grad_logits.ensure_finite("logit gradient")?;
        let grad = upsample_bilinear_backward(grad_logits, trace.logits_hw)?;
        self.head.backward(&trace.head, weights, &grad)
    }
}
