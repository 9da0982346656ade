// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! ASPP + decoder segmentation head whose weights are supplied per call.
//!
//! Batch norm is always applied in its folded form: every `{block}.bn` site
//! is read as `affine_scale` / `affine_shift`, which both combination paths
//! produce.

use crate::backbone::BackboneFeatures;
use crate::error::{PursuitError, PursuitResult};
use crate::spec::HeadConfig;
use op_nn::functional::{
    channel_affine, channel_affine_backward, concat_channels, conv2d, conv2d_backward,
    global_avg_pool, nchw, relu, relu_backward, split_channels,
    upsample_bilinear, upsample_bilinear_backward, ConvGeometry,
};
use op_nn::StateDict;
use op_tensor::Tensor;

pub const CLASSIFIER_WEIGHT: &str = "decoder.classifier.weight";
pub const CLASSIFIER_BIAS: &str = "decoder.classifier.bias";

/// Tensors consumed by [`DeeplabHead::forward`], keyed by parameter name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeadWeights(StateDict);

impl HeadWeights {
    pub fn new(map: StateDict) -> Self {
        Self(map)
    }

    pub fn get(&self, name: &str) -> PursuitResult<&Tensor> {
        self.0.get(name).ok_or_else(|| PursuitError::MissingParameter {
            name: name.to_string(),
        })
    }

    pub fn as_map(&self) -> &StateDict {
        &self.0
    }

    pub fn into_inner(self) -> StateDict {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<StateDict> for HeadWeights {
    fn from(map: StateDict) -> Self {
        Self(map)
    }
}

/// conv → folded bn → relu.
#[derive(Clone, Debug)]
struct Block {
    prefix: String,
    geometry: ConvGeometry,
}

impl Block {
    fn new(prefix: impl Into<String>, geometry: ConvGeometry) -> Self {
        Self {
            prefix: prefix.into(),
            geometry,
        }
    }

    fn weight_key(&self) -> String {
        format!("{}.conv.weight", self.prefix)
    }

    fn scale_key(&self) -> String {
        format!("{}.bn.affine_scale", self.prefix)
    }

    fn shift_key(&self) -> String {
        format!("{}.bn.affine_shift", self.prefix)
    }

    fn forward(&self, weights: &HeadWeights, input: &Tensor) -> PursuitResult<BlockTrace> {
        let conv = conv2d(input, weights.get(&self.weight_key())?, None, self.geometry)?;
        let affine = channel_affine(
            &conv,
            weights.get(&self.scale_key())?,
            weights.get(&self.shift_key())?,
        )?;
        Ok(BlockTrace {
            input: input.clone(),
            output: relu(&affine),
            conv,
        })
    }

    fn backward(
        &self,
        weights: &HeadWeights,
        trace: &BlockTrace,
        grad_output: &Tensor,
        grads: &mut StateDict,
    ) -> PursuitResult<Tensor> {
        let grad_affine = relu_backward(&trace.output, grad_output)?;
        let affine = channel_affine_backward(
            &trace.conv,
            weights.get(&self.scale_key())?,
            &grad_affine,
        )?;
        accumulate(grads, self.scale_key(), affine.scale)?;
        accumulate(grads, self.shift_key(), affine.shift)?;
        let conv = conv2d_backward(
            &trace.input,
            weights.get(&self.weight_key())?,
            false,
            &affine.input,
            self.geometry,
        )?;
        accumulate(grads, self.weight_key(), conv.weight)?;
        Ok(conv.input)
    }
}

#[derive(Clone, Debug)]
struct BlockTrace {
    input: Tensor,
    conv: Tensor,
    output: Tensor,
}

/// Intermediate activations kept for [`DeeplabHead::backward`].
#[derive(Clone, Debug)]
pub struct HeadTrace {
    branches: Vec<BlockTrace>,
    pool: BlockTrace,
    project: BlockTrace,
    reduce: BlockTrace,
    fuse: [BlockTrace; 2],
    high_hw: (usize, usize),
}

fn accumulate(grads: &mut StateDict, name: String, grad: Tensor) -> PursuitResult<()> {
    match grads.get_mut(&name) {
        Some(existing) => existing.add_scaled(&grad, 1.0)?,
        None => {
            grads.insert(name, grad);
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct DeeplabHead {
    config: HeadConfig,
    branches: Vec<Block>,
    pool: Block,
    project: Block,
    reduce: Block,
    fuse: [Block; 2],
}

impl DeeplabHead {
    pub fn new(config: HeadConfig) -> PursuitResult<Self> {
        config.validate()?;
        let branches = config
            .aspp_rates
            .iter()
            .enumerate()
            .map(|(i, &rate)| {
                let kernel = HeadConfig::branch_kernel(rate);
                Block::new(
                    format!("aspp.branches.{i}"),
                    ConvGeometry::same(kernel, if kernel == 1 { 1 } else { rate }),
                )
            })
            .collect();
        Ok(Self {
            branches,
            pool: Block::new("aspp.pool", ConvGeometry::default()),
            project: Block::new("aspp.project", ConvGeometry::default()),
            reduce: Block::new("decoder.reduce", ConvGeometry::default()),
            fuse: [
                Block::new("decoder.fuse.0", ConvGeometry::same(3, 1)),
                Block::new("decoder.fuse.1", ConvGeometry::same(3, 1)),
            ],
            config,
        })
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.branches
            .iter()
            .chain([&self.pool, &self.project, &self.reduce])
            .chain(self.fuse.iter())
    }

    /// Every name [`DeeplabHead::forward`] reads, in a stable order.
    pub fn required_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .blocks()
            .flat_map(|block| [block.weight_key(), block.scale_key(), block.shift_key()])
            .collect();
        names.push(CLASSIFIER_WEIGHT.to_string());
        names.push(CLASSIFIER_BIAS.to_string());
        names
    }

    fn check_features(&self, features: &BackboneFeatures) -> PursuitResult<()> {
        let (_, high_c, _, _) = nchw(&features.high)?;
        let (_, low_c, _, _) = nchw(&features.low)?;
        if high_c != self.config.in_channels || low_c != self.config.low_level_channels {
            return Err(PursuitError::ShapeMismatch {
                name: "backbone features".into(),
                expected: vec![self.config.in_channels, self.config.low_level_channels],
                got: vec![high_c, low_c],
            });
        }
        features.low.ensure_device(features.high.device())?;
        Ok(())
    }

    /// Logits at low-level resolution plus the trace needed for backward.
    pub fn forward(
        &self,
        features: &BackboneFeatures,
        weights: &HeadWeights,
    ) -> PursuitResult<(Tensor, HeadTrace)> {
        self.check_features(features)?;
        let high = &features.high;
        let (_, _, h, w) = nchw(high)?;
        let (_, _, low_h, low_w) = nchw(&features.low)?;

        let branches = self
            .branches
            .iter()
            .map(|block| block.forward(weights, high))
            .collect::<PursuitResult<Vec<_>>>()?;
        let pool = self.pool.forward(weights, &global_avg_pool(high)?)?;
        let pool_up = upsample_bilinear(&pool.output, (h, w))?;
        let mut parts: Vec<&Tensor> = branches.iter().map(|trace| &trace.output).collect();
        parts.push(&pool_up);
        let project = self.project.forward(weights, &concat_channels(&parts)?)?;

        let reduce = self.reduce.forward(weights, &features.low)?;
        let aspp_up = upsample_bilinear(&project.output, (low_h, low_w))?;
        let fused_in = concat_channels(&[&aspp_up, &reduce.output])?;
        let fuse0 = self.fuse[0].forward(weights, &fused_in)?;
        let fuse1 = self.fuse[1].forward(weights, &fuse0.output)?;
        let logits = conv2d(
            &fuse1.output,
            weights.get(CLASSIFIER_WEIGHT)?,
            Some(weights.get(CLASSIFIER_BIAS)?),
            ConvGeometry::default(),
        )?;
        Ok((
            logits,
            HeadTrace {
                branches,
                pool,
                project,
                reduce,
                fuse: [fuse0, fuse1],
                high_hw: (h, w),
            },
        ))
    }

    /// Gradients of every weight read by `forward`, keyed by the same names.
    pub fn backward(
        &self,
        trace: &HeadTrace,
        weights: &HeadWeights,
        grad_logits: &Tensor,
    ) -> PursuitResult<StateDict> {
        let mut grads = StateDict::new();
        let classifier = conv2d_backward(
            &trace.fuse[1].output,
            weights.get(CLASSIFIER_WEIGHT)?,
            true,
            grad_logits,
            ConvGeometry::default(),
        )?;
        accumulate(&mut grads, CLASSIFIER_WEIGHT.to_string(), classifier.weight)?;
        if let Some(bias) = classifier.bias {
            accumulate(&mut grads, CLASSIFIER_BIAS.to_string(), bias)?;
        }
        let g = self.fuse[1].backward(weights, &trace.fuse[1], &classifier.input, &mut grads)?;
        let g = self.fuse[0].backward(weights, &trace.fuse[0], &g, &mut grads)?;

        let a = self.config.aspp_channels;
        let r = self.config.low_level_reduced;
        let mut halves = split_channels(&g, &[a, r])?.into_iter();
        let (g_aspp_up, g_reduce) = match (halves.next(), halves.next()) {
            (Some(up), Some(reduce)) => (up, reduce),
            _ => return Err(PursuitError::Invalid("decoder split lost a part".into())),
        };
        self.reduce
            .backward(weights, &trace.reduce, &g_reduce, &mut grads)?;

        let g_project = upsample_bilinear_backward(&g_aspp_up, trace.high_hw)?;
        let g_concat = self
            .project
            .backward(weights, &trace.project, &g_project, &mut grads)?;
        let widths = vec![a; self.branches.len() + 1];
        let mut parts = split_channels(&g_concat, &widths)?;
        let g_pool_up = parts
            .pop()
            .ok_or_else(|| PursuitError::Invalid("aspp split lost the pooling part".into()))?;
        for ((block, branch), g_branch) in self.branches.iter().zip(&trace.branches).zip(&parts) {
            block.backward(weights, branch, g_branch, &mut grads)?;
        }
        let g_pool = upsample_bilinear_backward(&g_pool_up, (1, 1))?;
        // feature gradients stop here: the backbone is frozen
        self.pool.backward(weights, &trace.pool, &g_pool, &mut grads)?;
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchnorm::BatchNormLinearizer;
    use crate::generator::{Generator, GeneratorConfig};
    use crate::spec::ParameterSpec;
    use op_tensor::Device;
    use std::sync::Arc;

    fn config() -> HeadConfig {
        HeadConfig {
            in_channels: 3,
            low_level_channels: 2,
            aspp_channels: 2,
            aspp_rates: vec![1, 2],
            low_level_reduced: 2,
            decoder_channels: 2,
            num_classes: 1,
        }
    }

    fn weights(seed: u64) -> HeadWeights {
        let spec = Arc::new(ParameterSpec::deeplab_head(&config()).unwrap());
        let gen = Generator::new(
            spec,
            &GeneratorConfig {
                z_dim: 4,
                init_std: 1.0,
                seed: Some(seed),
            },
            Device::Cpu,
        )
        .unwrap();
        let z = Tensor::from_slice(&[0.5, -0.3, 0.8, 0.1]).unwrap();
        let raw = gen.decode(&z).unwrap();
        HeadWeights::new(BatchNormLinearizer::default().linearize_map(&raw).unwrap())
    }

    fn features() -> BackboneFeatures {
        BackboneFeatures {
            high: Tensor::from_fn(&[1, 3, 2, 2], |i| (i as f32 * 0.7).sin()).unwrap(),
            low: Tensor::from_fn(&[1, 2, 5, 5], |i| (i as f32 * 0.3).cos()).unwrap(),
        }
    }

    #[test]
    fn forward_produces_low_resolution_logits() {
        let head = DeeplabHead::new(config()).unwrap();
        let (logits, _) = head.forward(&features(), &weights(3)).unwrap();
        assert_eq!(logits.shape(), &[1, 1, 5, 5]);
        assert!(logits.is_finite());
        for name in head.required_names() {
            assert!(weights(3).get(&name).is_ok(), "{name}");
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let head = DeeplabHead::new(config()).unwrap();
        let feats = features();
        let base = weights(8);
        let (logits, trace) = head.forward(&feats, &base).unwrap();
        let probe = Tensor::from_fn(logits.shape(), |i| 0.2 + (i as f32 * 0.37).sin()).unwrap();
        let grads = head.backward(&trace, &base, &probe).unwrap();
        let objective = |weights: &HeadWeights| {
            head.forward(&feats, weights).unwrap().0.dot(&probe).unwrap()
        };
        let h = 1e-3;
        for name in [
            "decoder.classifier.bias",
            "decoder.fuse.1.bn.affine_scale",
            "decoder.reduce.conv.weight",
            "aspp.project.bn.affine_shift",
            "aspp.branches.1.conv.weight",
            "aspp.pool.conv.weight",
        ] {
            let analytic = grads[name].data()[0];
            let mut plus = base.clone().into_inner();
            plus.get_mut(name).unwrap().data_mut()[0] += h;
            let mut minus = base.clone().into_inner();
            minus.get_mut(name).unwrap().data_mut()[0] -= h;
            let numeric = (objective(&plus.into()) - objective(&minus.into())) / (2.0 * h);
            assert!(
                (numeric - analytic).abs() < 2e-2 * (1.0 + analytic.abs()),
                "{name}: numeric {numeric} analytic {analytic}"
            );
        }
    }

    #[test]
    fn missing_weight_is_reported_by_name() {
        let head = DeeplabHead::new(config()).unwrap();
        let mut map = weights(1).into_inner();
        map.remove("aspp.pool.bn.affine_scale");
        let err = head.forward(&features(), &map.into()).unwrap_err();
        assert!(matches!(err, PursuitError::MissingParameter { name } if name == "aspp.pool.bn.affine_scale"));
    }

    #[test]
    fn wrong_feature_channels_are_rejected() {
        let head = DeeplabHead::new(config()).unwrap();
        let mut feats = features();
        feats.high = Tensor::zeros(&[1, 4, 2, 2]).unwrap();
        assert!(head.forward(&feats, &weights(1)).is_err());
    }
}
