// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::checkpoint::{read_checkpoint, LoadReport, RenameTable};
use crate::error::{ensure_device, PursuitError, PursuitResult};
use op_config::determinism;
use op_nn::functional::{conv2d, relu, ConvGeometry};
use op_nn::{Module, Parameter, PureResult};
use op_tensor::{Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Feature maps handed to the segmentation head.
#[derive(Clone, Debug)]
pub struct BackboneFeatures {
    /// Output-stride-16 features feeding the ASPP block.
    pub high: Tensor,
    /// Output-stride-4 features feeding the decoder.
    pub low: Tensor,
}

/// Frozen feature extractor. Combiners never update it.
pub trait Backbone {
    fn forward(&self, image: &Tensor) -> PursuitResult<BackboneFeatures>;

    fn device(&self) -> Device;

    /// Channels of [`BackboneFeatures::high`].
    fn out_channels(&self) -> usize;

    /// Channels of [`BackboneFeatures::low`].
    fn low_level_channels(&self) -> usize;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvBackboneConfig {
    pub in_channels: usize,
    pub stem_channels: usize,
    pub low_level_channels: usize,
    pub mid_channels: usize,
    pub out_channels: usize,
}

impl Default for ConvBackboneConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            stem_channels: 16,
            low_level_channels: 24,
            mid_channels: 48,
            out_channels: 64,
        }
    }
}

struct Stage {
    weight: Parameter,
    bias: Parameter,
}

/// Four stride-2 3x3 convolutions with ReLU. The second stage output is the
/// low-level map, the fourth the high-level one.
pub struct ConvBackbone {
    stages: Vec<Stage>,
    config: ConvBackboneConfig,
    device: Device,
}

const LOW_LEVEL_STAGE: usize = 1;

impl ConvBackbone {
    pub fn new(config: ConvBackboneConfig, seed: Option<u64>, device: Device) -> PursuitResult<Self> {
        let widths = [
            config.in_channels,
            config.stem_channels,
            config.low_level_channels,
            config.mid_channels,
            config.out_channels,
        ];
        if widths.contains(&0) {
            return Err(PursuitError::Invalid(
                "backbone channel widths must be positive".into(),
            ));
        }
        let mut seeds = determinism::rng_from_optional(seed, "op-pursuit/backbone");
        let mut stages = Vec::with_capacity(4);
        for (idx, pair) in widths.windows(2).enumerate() {
            let (cin, cout) = (pair[0], pair[1]);
            let std = (2.0 / (cin * 9) as f32).sqrt();
            let weight = Tensor::random_normal(&[cout, cin, 3, 3], 0.0, std, Some(seeds.gen()))?
                .to_device(device);
            let bias = Tensor::zeros(&[cout])?.to_device(device);
            stages.push(Stage {
                weight: Parameter::new(format!("stages.{idx}::weight"), weight),
                bias: Parameter::new(format!("stages.{idx}::bias"), bias),
            });
        }
        Ok(Self {
            stages,
            config,
            device,
        })
    }

    pub fn config(&self) -> &ConvBackboneConfig {
        &self.config
    }

    /// Loads weights through the backbone rename table.
    pub fn load_checkpoint(
        &mut self,
        path: impl AsRef<Path>,
        table: &RenameTable,
    ) -> PursuitResult<LoadReport> {
        let state = read_checkpoint(path)?;
        let device = self.device;
        table.restore(self, state, device)
    }
}

impl Backbone for ConvBackbone {
    fn forward(&self, image: &Tensor) -> PursuitResult<BackboneFeatures> {
        ensure_device(self.device, image.device())?;
        let geometry = ConvGeometry::strided(3, 2);
        let mut x = image.clone();
        let mut low = None;
        for (idx, stage) in self.stages.iter().enumerate() {
            x = relu(&conv2d(
                &x,
                stage.weight.value(),
                Some(stage.bias.value()),
                geometry,
            )?);
            if idx == LOW_LEVEL_STAGE {
                low = Some(x.clone());
            }
        }
        let low = low.ok_or_else(|| PursuitError::Invalid("backbone has no low-level stage".into()))?;
        Ok(BackboneFeatures { high: x, low })
    }

    fn device(&self) -> Device {
        self.device
    }

    fn out_channels(&self) -> usize {
        self.config.out_channels
    }

    fn low_level_channels(&self) -> usize {
        self.config.low_level_channels
    }
}

impl Module for ConvBackbone {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &self.stages {
            visitor(&stage.weight)?;
            visitor(&stage.bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &mut self.stages {
            visitor(&mut stage.weight)?;
            visitor(&mut stage.bias)?;
        }
        Ok(())
    }
}
