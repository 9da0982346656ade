// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::batchnorm::BatchNormLinearizer;
use crate::combine::latent::{decode_head, latent_gradient};
use crate::combine::{Blend, Prediction};
use crate::error::{ensure_device, ensure_finite, PursuitError, PursuitResult};
use crate::generator::Generator;
use crate::library::BasisRecord;
use crate::pipeline::SegmentationPipeline;
use op_nn::{Parameter, PureResult};
use op_tensor::Tensor;
use std::path::Path;
use tracing::info;

/// One object fitted directly in latent space: a trainable code decoded by a
/// frozen generator.
pub struct ObjectNet {
    generator: Generator,
    linearizer: BatchNormLinearizer,
    pipeline: SegmentationPipeline,
    z: Parameter,
}

impl ObjectNet {
    pub fn new(
        mut generator: Generator,
        pipeline: SegmentationPipeline,
        z: Tensor,
    ) -> PursuitResult<Self> {
        ensure_device(pipeline.device(), generator.device())?;
        let z = generator.latent_row(&z)?.reshape(&[generator.z_dim()])?;
        generator.freeze();
        info!(z_dim = generator.z_dim(), "object network initialised");
        Ok(Self {
            generator,
            linearizer: BatchNormLinearizer::default(),
            pipeline,
            z: Parameter::new("z", z),
        })
    }

    /// Starts from a standard normal code.
    pub fn random(
        generator: Generator,
        pipeline: SegmentationPipeline,
        seed: Option<u64>,
    ) -> PursuitResult<Self> {
        let z = Tensor::random_normal(&[generator.z_dim()], 0.0, 1.0, seed)?
            .to_device(generator.device());
        Self::new(generator, pipeline, z)
    }

    pub fn z(&self) -> &Tensor {
        self.z.value()
    }

    pub fn z_gradient(&self) -> Option<&Tensor> {
        self.z.gradient()
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    fn blend(&self) -> PursuitResult<Blend> {
        let z = self.z.value().clone();
        let (weights, raw) = decode_head(&self.generator, &self.linearizer, &z)?;
        Ok(Blend {
            weights,
            latent: Some(z),
            raw: Some(raw),
        })
    }

    pub fn forward(&self, image: &Tensor) -> PursuitResult<Prediction> {
        let blend = self.blend()?;
        let (logits, trace) = self.pipeline.run(image, &blend.weights)?;
        Ok(Prediction {
            logits,
            latent: blend.latent.clone(),
            blend,
            trace,
            identity: None,
        })
    }

    pub fn backward(&mut self, prediction: &Prediction, grad_logits: &Tensor) -> PursuitResult<()> {
        let grads = self
            .pipeline
            .backprop(&prediction.trace, &prediction.blend.weights, grad_logits)?;
        let (Some(z), Some(raw)) = (&prediction.blend.latent, &prediction.blend.raw) else {
            return Err(PursuitError::Invalid(
                "prediction was not produced by an object network".into(),
            ));
        };
        let grad = latent_gradient(&mut self.generator, &self.linearizer, z, raw, &grads)?;
        ensure_finite("latent gradient", grad.squared_l2_norm())?;
        self.z.accumulate_euclidean(&grad)?;
        Ok(())
    }

    /// Visits the latent code, the only trainable tensor.
    pub fn visit_trainable_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PursuitResult<()> {
        visitor(&mut self.z)?;
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

    /// Writes the code together with the weights it decodes to.
    pub fn save_basis(&self, path: impl AsRef<Path>) -> PursuitResult<()> {
        let raw = self.generator.decode(self.z.value())?;
        BasisRecord::new(self.z.value(), Some(&raw)).write(path.as_ref())?;
        info!(path = %path.as_ref().display(), "object basis saved");
        Ok(())
    }

    /// Restores the code written by [`ObjectNet::save_basis`].
    pub fn load_basis(&mut self, path: impl AsRef<Path>) -> PursuitResult<()> {
        let record = BasisRecord::read(path)?;
        let z = record.z_tensor(self.generator.device())?;
        let z = self.generator.latent_row(&z)?.reshape(&[self.generator.z_dim()])?;
        self.z.load_value(&z)?;
        Ok(())
    }
}
