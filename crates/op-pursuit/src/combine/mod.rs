// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Expressing a new object as a linear combination of library bases.
//!
//! A [`Combiner`] owns the trainable coefficient vector and the frozen
//! backbone/head plumbing; a [`CombinationStrategy`] decides where the
//! blending happens. [`LatentStrategy`] blends codes and decodes once,
//! [`WeightStrategy`] blends already decoded tensors.

pub mod latent;
pub mod weight;

pub use latent::LatentStrategy;
pub use weight::WeightStrategy;

use crate::error::{ensure_finite, PursuitError, PursuitResult};
use crate::head::HeadWeights;
use crate::library::BasisRecord;
use crate::pipeline::{PipelineTrace, SegmentationPipeline};
use op_nn::{Parameter, PureResult, StateDict};
use op_tensor::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub type LatentCombiner = Combiner<LatentStrategy>;
pub type WeightCombiner = Combiner<WeightStrategy>;

/// Head weights produced from one coefficient vector.
#[derive(Clone, Debug)]
pub struct Blend {
    pub weights: HeadWeights,
    /// Blended code, when the strategy can form one.
    pub latent: Option<Tensor>,
    /// Decoded tensors before batch-norm folding (latent path only).
    pub(crate) raw: Option<StateDict>,
}

/// Where bases are combined.
pub trait CombinationStrategy {
    fn base_num(&self) -> usize;

    fn device(&self) -> Device;

    /// Head weights for `coefficients`.
    fn blend(&self, coefficients: &Tensor) -> PursuitResult<Blend>;

    /// `dL/dcoefficients` given gradients on the blended head weights.
    fn backward(
        &mut self,
        coefficients: &Tensor,
        blend: &Blend,
        grads: &StateDict,
    ) -> PursuitResult<Tensor>;

    /// What [`Combiner::save_basis`] persists for this blend.
    fn export(&self, blend: &Blend) -> PursuitResult<BasisRecord>;
}

/// Fails unless `coefficients` has one entry per basis.
pub(crate) fn check_coefficients(base_num: usize, coefficients: &Tensor) -> PursuitResult<()> {
    if base_num == 0 {
        return Err(PursuitError::EmptyLibrary {
            location: "<combiner>".into(),
        });
    }
    if coefficients.numel() != base_num {
        return Err(PursuitError::CoefficientMismatch {
            bases: base_num,
            coefficients: coefficients.numel(),
        });
    }
    Ok(())
}

/// Starting point of the coefficient vector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CoefficientInit {
    /// Every coefficient `1/sqrt(base_num)`.
    #[default]
    Balanced,
    /// Independent standard normal draws.
    Random { seed: Option<u64> },
    Explicit { values: Vec<f32> },
}

impl CoefficientInit {
    pub fn materialize(&self, base_num: usize, device: Device) -> PursuitResult<Tensor> {
        if base_num == 0 {
            return Err(PursuitError::EmptyLibrary {
                location: "<combiner>".into(),
            });
        }
        let values = match self {
            CoefficientInit::Balanced => {
                Tensor::full(&[base_num], 1.0 / (base_num as f32).sqrt())?
            }
            CoefficientInit::Random { seed } => Tensor::random_normal(&[base_num], 0.0, 1.0, *seed)?,
            CoefficientInit::Explicit { values } => {
                let tensor = Tensor::from_vec(&[values.len()], values.clone())?;
                check_coefficients(base_num, &tensor)?;
                tensor
            }
        };
        Ok(values.to_device(device))
    }
}

/// Result of [`Combiner::forward`]; hand it back to [`Combiner::backward`].
#[derive(Clone, Debug)]
pub struct Prediction {
    pub logits: Tensor,
    pub latent: Option<Tensor>,
    pub(crate) blend: Blend,
    pub(crate) trace: PipelineTrace,
    /// Code-table row used by a joint network.
    pub(crate) identity: Option<usize>,
}

impl Prediction {
    pub fn blend(&self) -> &Blend {
        &self.blend
    }

    pub fn identity(&self) -> Option<usize> {
        self.identity
    }
}

/// Coefficient vector + strategy + frozen segmentation plumbing.
pub struct Combiner<S: CombinationStrategy> {
    strategy: S,
    pipeline: SegmentationPipeline,
    coefficients: Parameter,
}

impl<S: CombinationStrategy> Combiner<S> {
    pub fn new(
        strategy: S,
        pipeline: SegmentationPipeline,
        init: &CoefficientInit,
    ) -> PursuitResult<Self> {
        if strategy.device() != pipeline.device() {
            return Err(PursuitError::DeviceMismatch {
                expected: pipeline.device(),
                got: strategy.device(),
            });
        }
        let values = init.materialize(strategy.base_num(), pipeline.device())?;
        info!(
            bases = strategy.base_num(),
            coefficients = ?values.data(),
            "combiner initialised"
        );
        Ok(Self {
            strategy,
            pipeline,
            coefficients: Parameter::new("coeffs", values),
        })
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn pipeline(&self) -> &SegmentationPipeline {
        &self.pipeline
    }

    pub fn base_num(&self) -> usize {
        self.strategy.base_num()
    }

    pub fn coefficients(&self) -> &Tensor {
        self.coefficients.value()
    }

    pub fn coefficient_gradient(&self) -> Option<&Tensor> {
        self.coefficients.gradient()
    }

    pub fn set_coefficients(&mut self, values: &Tensor) -> PursuitResult<()> {
        check_coefficients(self.base_num(), values)?;
        let reshaped = values.reshape(&[self.base_num()])?;
        self.coefficients.load_value(&reshaped)?;
        Ok(())
    }

    pub fn forward(&self, image: &Tensor) -> PursuitResult<Prediction> {
        let blend = self.strategy.blend(self.coefficients.value())?;
        let (logits, trace) = self.pipeline.run(image, &blend.weights)?;
        Ok(Prediction {
            logits,
            latent: blend.latent.clone(),
            blend,
            trace,
            identity: None,
        })
    }

    /// Accumulates `dL/dcoefficients` for the given prediction.
    pub fn backward(&mut self, prediction: &Prediction, grad_logits: &Tensor) -> PursuitResult<()> {
        let grads = self
            .pipeline
            .backprop(&prediction.trace, &prediction.blend.weights, grad_logits)?;
        let grad = self
            .strategy
            .backward(self.coefficients.value(), &prediction.blend, &grads)?;
        ensure_finite("coefficient gradient", grad.squared_l2_norm())?;
        self.coefficients.accumulate_euclidean(&grad)?;
        Ok(())
    }

    /// Visits exactly the trainable set: the coefficient vector.
    pub fn visit_trainable_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PursuitResult<()> {
        visitor(&mut self.coefficients)?;
        Ok(())
    }

    pub fn visit_trainable(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PursuitResult<()> {
        visitor(&self.coefficients)?;
        Ok(())
    }

    pub fn apply_step(&mut self, learning_rate: f32) -> PursuitResult<()> {
        self.visit_trainable_mut(&mut |param| param.apply_step(learning_rate))
    }

    pub fn zero_grad(&mut self) -> PursuitResult<()> {
        self.visit_trainable_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    pub fn clip_gradients_value(&mut self, limit: f32) -> PursuitResult<()> {
        self.visit_trainable_mut(&mut |param| param.clip_value(limit))
    }

    /// Writes the current blend as a basis record, with the coefficients that
    /// produced it.
    pub fn save_basis(&self, path: impl AsRef<Path>) -> PursuitResult<()> {
        let blend = self.strategy.blend(self.coefficients.value())?;
        let record = self
            .strategy
            .export(&blend)?
            .with_coefficients(self.coefficients.value());
        record.write(path.as_ref())?;
        info!(path = %path.as_ref().display(), "basis saved");
        Ok(())
    }

    /// Restores the coefficients stored by [`Combiner::save_basis`].
    pub fn load_basis(&mut self, path: impl AsRef<Path>) -> PursuitResult<()> {
        let path = path.as_ref();
        let record = BasisRecord::read(path)?;
        let coefficients = record
            .coefficient_tensor(self.pipeline.device())?
            .ok_or_else(|| PursuitError::corrupt(path, "record holds no coefficients"))?;
        self.set_coefficients(&coefficients)
    }
}
