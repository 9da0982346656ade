// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Static layout of every tensor the segmentation head consumes.
//!
//! The generator emits exactly these tensors and the weight combiner checks
//! loaded bases against them. Names follow `{group}.{block}.{layer}.{field}`
//! so batch-norm sites are recognised by their shared prefix.

use crate::error::{PursuitError, PursuitResult};
use op_nn::StateDict;
use op_tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a named tensor is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamRole {
    ConvWeight,
    ConvBias,
    BnScale,
    BnShift,
    BnRunningMean,
    BnRunningVar,
}

impl ParamRole {
    pub fn is_batch_norm(self) -> bool {
        matches!(
            self,
            ParamRole::BnScale | ParamRole::BnShift | ParamRole::BnRunningMean | ParamRole::BnRunningVar
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub role: ParamRole,
}

impl ParamEntry {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, role: ParamRole) -> Self {
        Self {
            name: name.into(),
            shape,
            role,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Channel widths and dilation rates of the ASPP + decoder head.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Channels of the high-level (stride 16) backbone features.
    pub in_channels: usize,
    /// Channels of the low-level (stride 4) backbone features.
    pub low_level_channels: usize,
    pub aspp_channels: usize,
    /// One ASPP branch per rate; rate 1 is a 1x1 convolution.
    pub aspp_rates: Vec<usize>,
    pub low_level_reduced: usize,
    pub decoder_channels: usize,
    pub num_classes: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            in_channels: 64,
            low_level_channels: 24,
            aspp_channels: 32,
            aspp_rates: vec![1, 6, 12, 18],
            low_level_reduced: 12,
            decoder_channels: 32,
            num_classes: 1,
        }
    }
}

impl HeadConfig {
    pub fn validate(&self) -> PursuitResult<()> {
        let widths = [
            ("in_channels", self.in_channels),
            ("low_level_channels", self.low_level_channels),
            ("aspp_channels", self.aspp_channels),
            ("low_level_reduced", self.low_level_reduced),
            ("decoder_channels", self.decoder_channels),
            ("num_classes", self.num_classes),
        ];
        for (label, value) in widths {
            if value == 0 {
                return Err(PursuitError::Invalid(format!("head {label} must be positive")));
            }
        }
        if self.aspp_rates.is_empty() || self.aspp_rates.contains(&0) {
            return Err(PursuitError::Invalid(
                "head aspp_rates must be a non-empty list of positive rates".into(),
            ));
        }
        Ok(())
    }

    /// Kernel size used by the ASPP branch with the given dilation rate.
    pub fn branch_kernel(rate: usize) -> usize {
        if rate == 1 {
            1
        } else {
            3
        }
    }

    /// Channel count entering the ASPP projection.
    pub fn aspp_concat_channels(&self) -> usize {
        self.aspp_channels * (self.aspp_rates.len() + 1)
    }
}

/// Ordered, name-indexed collection of [`ParamEntry`] values.
#[derive(Clone, Debug)]
pub struct ParameterSpec {
    entries: Vec<ParamEntry>,
    index: HashMap<String, usize>,
}

impl ParameterSpec {
    pub fn new(entries: Vec<ParamEntry>) -> PursuitResult<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            if entry.shape.is_empty() || entry.shape.contains(&0) {
                return Err(PursuitError::Invalid(format!(
                    "parameter '{}' has degenerate shape {:?}",
                    entry.name, entry.shape
                )));
            }
            if index.insert(entry.name.clone(), position).is_some() {
                return Err(PursuitError::Invalid(format!(
                    "parameter '{}' declared twice",
                    entry.name
                )));
            }
        }
        Ok(Self { entries, index })
    }

    /// Layout of the ASPP + decoder head described by `config`.
    pub fn deeplab_head(config: &HeadConfig) -> PursuitResult<Self> {
        config.validate()?;
        let mut entries = Vec::new();
        let a = config.aspp_channels;
        for (i, &rate) in config.aspp_rates.iter().enumerate() {
            let k = HeadConfig::branch_kernel(rate);
            push_conv_bn(
                &mut entries,
                &format!("aspp.branches.{i}"),
                [a, config.in_channels, k, k],
            );
        }
        push_conv_bn(&mut entries, "aspp.pool", [a, config.in_channels, 1, 1]);
        push_conv_bn(
            &mut entries,
            "aspp.project",
            [a, config.aspp_concat_channels(), 1, 1],
        );
        let r = config.low_level_reduced;
        let d = config.decoder_channels;
        push_conv_bn(
            &mut entries,
            "decoder.reduce",
            [r, config.low_level_channels, 1, 1],
        );
        push_conv_bn(&mut entries, "decoder.fuse.0", [d, a + r, 3, 3]);
        push_conv_bn(&mut entries, "decoder.fuse.1", [d, d, 3, 3]);
        entries.push(ParamEntry::new(
            "decoder.classifier.weight",
            vec![config.num_classes, d, 1, 1],
            ParamRole::ConvWeight,
        ));
        entries.push(ParamEntry::new(
            "decoder.classifier.bias",
            vec![config.num_classes],
            ParamRole::ConvBias,
        ));
        Self::new(entries)
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParamEntry> {
        self.index.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    /// Total number of scalars across every entry.
    pub fn total_numel(&self) -> usize {
        self.entries.iter().map(ParamEntry::numel).sum()
    }

    /// Looks up `name`, failing with [`PursuitError::UnknownParameter`].
    pub fn require(&self, name: &str) -> PursuitResult<&ParamEntry> {
        self.get(name).ok_or_else(|| PursuitError::UnknownParameter {
            name: name.to_string(),
        })
    }

    /// Checks that `tensor` has the declared shape of `name`.
    pub fn check(&self, name: &str, tensor: &Tensor) -> PursuitResult<()> {
        let entry = self.require(name)?;
        if tensor.shape() != entry.shape.as_slice() {
            return Err(PursuitError::ShapeMismatch {
                name: name.to_string(),
                expected: entry.shape.clone(),
                got: tensor.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Checks that `weights` holds every declared tensor with the right shape.
    /// Names outside the layout are left to the caller.
    pub fn check_complete(&self, weights: &StateDict) -> PursuitResult<()> {
        for entry in &self.entries {
            let tensor = weights
                .get(&entry.name)
                .ok_or_else(|| PursuitError::MissingParameter {
                    name: entry.name.clone(),
                })?;
            self.check(&entry.name, tensor)?;
        }
        Ok(())
    }
}

fn push_conv_bn(entries: &mut Vec<ParamEntry>, prefix: &str, conv: [usize; 4]) {
    let channels = conv[0];
    entries.push(ParamEntry::new(
        format!("{prefix}.conv.weight"),
        conv.to_vec(),
        ParamRole::ConvWeight,
    ));
    for (field, role) in [
        ("weight", ParamRole::BnScale),
        ("bias", ParamRole::BnShift),
        ("running_mean", ParamRole::BnRunningMean),
        ("running_var", ParamRole::BnRunningVar),
    ] {
        entries.push(ParamEntry::new(
            format!("{prefix}.bn.{field}"),
            vec![channels],
            role,
        ));
    }
}
