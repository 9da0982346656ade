// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Generator pretraining over several objects at once.
//!
//! Every object owns one row of a `[obj_num, z_dim]` code table. Both the
//! table and the generator train; attach a
//! [`ReplayRegularizer`](crate::replay::ReplayRegularizer) through
//! [`JointNet::generator_mut`] to keep earlier bases stable.

use crate::batchnorm::BatchNormLinearizer;
use crate::combine::latent::{decode_head, latent_gradient};
use crate::combine::{Blend, Prediction};
use crate::error::{ensure_device, ensure_finite, PursuitError, PursuitResult};
use crate::generator::Generator;
use crate::library::BasisArchive;
use crate::pipeline::SegmentationPipeline;
use op_nn::{Module, Parameter, PureResult};
use op_tensor::Tensor;
use std::path::Path;
use tracing::info;

pub struct JointNet {
    generator: Generator,
    linearizer: BatchNormLinearizer,
    pipeline: SegmentationPipeline,
    codes: Parameter,
    codes_frozen: bool,
}

impl JointNet {
    /// Draws the code table from a standard normal.
    pub fn new(
        mut generator: Generator,
        pipeline: SegmentationPipeline,
        obj_num: usize,
        seed: Option<u64>,
    ) -> PursuitResult<Self> {
        if obj_num == 0 {
            return Err(PursuitError::Invalid("joint network needs at least one object".into()));
        }
        ensure_device(pipeline.device(), generator.device())?;
        generator.unfreeze();
        let codes = Tensor::random_normal(&[obj_num, generator.z_dim()], 0.0, 1.0, seed)?
            .to_device(generator.device());
        info!(obj_num, z_dim = generator.z_dim(), "joint network initialised");
        Ok(Self {
            generator,
            linearizer: BatchNormLinearizer::default(),
            pipeline,
            codes: Parameter::new("codes", codes),
            codes_frozen: false,
        })
    }

    pub fn obj_num(&self) -> usize {
        self.codes.value().shape()[0]
    }

    pub fn codes(&self) -> &Tensor {
        self.codes.value()
    }

    pub fn codes_frozen(&self) -> bool {
        self.codes_frozen
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn generator_mut(&mut self) -> &mut Generator {
        &mut self.generator
    }

    /// Pins object `i` to the `i`-th unit vector and stops code updates.
    pub fn freeze_codes_one_hot(&mut self) -> PursuitResult<()> {
        let (obj_num, z_dim) = (self.obj_num(), self.generator.z_dim());
        if obj_num > z_dim {
            return Err(PursuitError::Invalid(format!(
                "{obj_num} one-hot codes do not fit in z_dim {z_dim}"
            )));
        }
        let one_hot = Tensor::from_fn(&[obj_num, z_dim], |idx| {
            if idx / z_dim == idx % z_dim {
                1.0
            } else {
                0.0
            }
        })?
        .to_device(self.generator.device());
        self.codes.load_value(&one_hot)?;
        self.codes.zero_gradient();
        self.codes_frozen = true;
        Ok(())
    }

    fn code(&self, identity: usize) -> PursuitResult<Tensor> {
        if identity >= self.obj_num() {
            return Err(PursuitError::Invalid(format!(
                "object {identity} is outside the {} trained codes",
                self.obj_num()
            )));
        }
        Ok(self.codes.value().select(identity)?)
    }

    /// Logits for object `identity`; the prediction carries the code used.
    pub fn forward(&self, image: &Tensor, identity: usize) -> PursuitResult<Prediction> {
        let z = self.code(identity)?;
        let (weights, raw) = decode_head(&self.generator, &self.linearizer, &z)?;
        let blend = Blend {
            weights,
            latent: Some(z),
            raw: Some(raw),
        };
        let (logits, trace) = self.pipeline.run(image, &blend.weights)?;
        Ok(Prediction {
            logits,
            latent: blend.latent.clone(),
            blend,
            trace,
            identity: Some(identity),
        })
    }

    /// Accumulates generator gradients and, unless frozen, the gradient of
    /// the code-table row `prediction` was decoded from.
    pub fn backward(&mut self, prediction: &Prediction, grad_logits: &Tensor) -> PursuitResult<()> {
        let identity = prediction.identity.ok_or_else(|| {
            PursuitError::Invalid("prediction was not produced by a joint network".into())
        })?;
        self.code(identity)?;
        let grads = self
            .pipeline
            .backprop(&prediction.trace, &prediction.blend.weights, grad_logits)?;
        let (Some(z), Some(raw)) = (&prediction.blend.latent, &prediction.blend.raw) else {
            return Err(PursuitError::Invalid(
                "prediction was not produced by a joint network".into(),
            ));
        };
        let grad_z = latent_gradient(&mut self.generator, &self.linearizer, z, raw, &grads)?;
        ensure_finite("latent gradient", grad_z.squared_l2_norm())?;
        if self.codes_frozen {
            return Ok(());
        }
        let z_dim = self.generator.z_dim();
        let mut table = Tensor::zeros(self.codes.value().shape())?.to_device(self.generator.device());
        table.data_mut()[identity * z_dim..(identity + 1) * z_dim].copy_from_slice(grad_z.data());
        self.codes.accumulate_euclidean(&table)?;
        Ok(())
    }

    /// Visits the code table (unless frozen) and every generator parameter.
    pub fn visit_trainable_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PursuitResult<()> {
        if !self.codes_frozen {
            visitor(&mut self.codes)?;
        }
        self.generator.visit_parameters_mut(visitor)?;
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

    /// Stores the code table as a basis archive.
    pub fn write_archive(&self, path: impl AsRef<Path>) -> PursuitResult<()> {
        let rows = (0..self.obj_num())
            .map(|row| self.codes.value().select(row))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&Tensor> = rows.iter().collect();
        BasisArchive::from_codes(&refs)?.write(path.as_ref())?;
        info!(path = %path.as_ref().display(), codes = rows.len(), "code table archived");
        Ok(())
    }
}
