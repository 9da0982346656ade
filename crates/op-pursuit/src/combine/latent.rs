// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{check_coefficients, Blend, CombinationStrategy};
use crate::batchnorm::BatchNormLinearizer;
use crate::error::{ensure_device, PursuitError, PursuitResult};
use crate::generator::Generator;
use crate::head::HeadWeights;
use crate::library::{BasisLibrary, BasisRecord};
use op_nn::StateDict;
use op_tensor::{Device, Tensor};
use std::path::Path;
use tracing::info;

/// Decodes `z` and folds every batch-norm site into its affine pair.
pub(crate) fn decode_head(
    generator: &Generator,
    linearizer: &BatchNormLinearizer,
    z: &Tensor,
) -> PursuitResult<(HeadWeights, StateDict)> {
    let raw = generator.decode(z)?;
    let weights = linearizer.linearize_map(&raw)?;
    Ok((HeadWeights::new(weights), raw))
}

/// `dL/dz` given head gradients for weights decoded from `z`.
pub(crate) fn latent_gradient(
    generator: &mut Generator,
    linearizer: &BatchNormLinearizer,
    z: &Tensor,
    raw: &StateDict,
    grads: &StateDict,
) -> PursuitResult<Tensor> {
    let decoded_grads = linearizer.backprop_map(raw, grads)?;
    generator.backward(z, &decoded_grads)
}

/// Blends latent codes, then decodes once per forward.
#[derive(Debug)]
pub struct LatentStrategy {
    generator: Generator,
    library: BasisLibrary,
    linearizer: BatchNormLinearizer,
}

impl LatentStrategy {
    /// Takes ownership of a snapshot of `library`; the generator is frozen.
    pub fn new(mut generator: Generator, library: BasisLibrary) -> PursuitResult<Self> {
        if library.is_empty() {
            return Err(PursuitError::EmptyLibrary {
                location: library.location().to_string(),
            });
        }
        if library.z_dim() != generator.z_dim() {
            return Err(PursuitError::LatentDimension {
                expected: generator.z_dim(),
                got: library.z_dim(),
            });
        }
        ensure_device(generator.device(), library.device())?;
        generator.freeze();
        info!(
            bases = library.len(),
            z_dim = generator.z_dim(),
            source = library.location(),
            "latent strategy ready"
        );
        Ok(Self {
            generator,
            library,
            linearizer: BatchNormLinearizer::default(),
        })
    }

    /// Opens a basis directory or archive at `path` for `generator`.
    pub fn open(path: impl AsRef<Path>, generator: Generator) -> PursuitResult<Self> {
        let library = BasisLibrary::open(path, generator.z_dim(), generator.device())?;
        Self::new(generator, library)
    }

    pub fn with_linearizer(mut self, linearizer: BatchNormLinearizer) -> Self {
        self.linearizer = linearizer;
        self
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn library(&self) -> &BasisLibrary {
        &self.library
    }

    /// `Σ coeffᵢ · zᵢ`.
    pub fn blended_code(&self, coefficients: &Tensor) -> PursuitResult<Tensor> {
        check_coefficients(self.library.len(), coefficients)?;
        Ok(Tensor::linear_combination(
            &self.library.codes(),
            coefficients.data(),
        )?)
    }
}

impl CombinationStrategy for LatentStrategy {
    fn base_num(&self) -> usize {
        self.library.len()
    }

    fn device(&self) -> Device {
        self.generator.device()
    }

    fn blend(&self, coefficients: &Tensor) -> PursuitResult<Blend> {
        let z = self.blended_code(coefficients)?;
        let (weights, raw) = decode_head(&self.generator, &self.linearizer, &z)?;
        Ok(Blend {
            weights,
            latent: Some(z),
            raw: Some(raw),
        })
    }

    fn backward(
        &mut self,
        coefficients: &Tensor,
        blend: &Blend,
        grads: &StateDict,
    ) -> PursuitResult<Tensor> {
        check_coefficients(self.library.len(), coefficients)?;
        let (Some(z), Some(raw)) = (&blend.latent, &blend.raw) else {
            return Err(PursuitError::Invalid(
                "latent backward needs the blended code and its decoded tensors".into(),
            ));
        };
        let grad_z = latent_gradient(&mut self.generator, &self.linearizer, z, raw, grads)?;
        let values = self
            .library
            .codes()
            .into_iter()
            .map(|code| grad_z.dot(code))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Tensor::from_vec(&[values.len()], values)?.to_device(self.device()))
    }

    fn export(&self, blend: &Blend) -> PursuitResult<BasisRecord> {
        let z = blend
            .latent
            .as_ref()
            .ok_or_else(|| PursuitError::Invalid("latent blend carries no code".into()))?;
        Ok(BasisRecord::new(z, blend.raw.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratorConfig;
    use crate::library::BasisEntry;
    use crate::spec::{HeadConfig, ParameterSpec};
    use std::sync::Arc;

    fn generator(z_dim: usize) -> Generator {
        let spec = Arc::new(ParameterSpec::deeplab_head(&HeadConfig::default()).unwrap());
        let config = GeneratorConfig {
            z_dim,
            seed: Some(3),
            ..GeneratorConfig::default()
        };
        Generator::new(spec, &config, Device::Cpu).unwrap()
    }

    fn library(z_dim: usize, n: usize) -> BasisLibrary {
        let entries = (0..n)
            .map(|i| {
                let z = Tensor::random_normal(&[z_dim], 0.0, 1.0, Some(10 + i as u64)).unwrap();
                BasisEntry::new(format!("{i}"), z, None)
            })
            .collect();
        BasisLibrary::from_entries(entries, z_dim, Device::Cpu).unwrap()
    }

    #[test]
    fn one_hot_coefficients_reproduce_the_basis() {
        let strategy = LatentStrategy::new(generator(4), library(4, 3)).unwrap();
        let coefficients = Tensor::from_vec(&[3], vec![1.0, 0.0, 0.0]).unwrap();
        let blend = strategy.blend(&coefficients).unwrap();
        let basis = strategy.library().get(0).unwrap().z().clone();
        assert_eq!(blend.latent.as_ref().unwrap(), &basis);
        let direct = strategy.generator().decode(&basis).unwrap();
        assert_eq!(blend.raw.as_ref().unwrap(), &direct);
    }

    #[test]
    fn generator_is_frozen_on_construction() {
        let strategy = LatentStrategy::new(generator(4), library(4, 2)).unwrap();
        assert!(strategy.generator().is_frozen());
    }

    #[test]
    fn code_length_must_match_generator() {
        let err = LatentStrategy::new(generator(5), library(4, 2)).unwrap_err();
        assert!(matches!(
            err,
            PursuitError::LatentDimension { expected: 5, got: 4 }
        ));
    }

    #[test]
    fn rejects_wrong_coefficient_count() {
        let strategy = LatentStrategy::new(generator(4), library(4, 3)).unwrap();
        let coefficients = Tensor::from_vec(&[2], vec![0.5, 0.5]).unwrap();
        assert!(matches!(
            strategy.blend(&coefficients),
            Err(PursuitError::CoefficientMismatch {
                bases: 3,
                coefficients: 2
            })
        ));
    }

    #[test]
    fn export_carries_code_and_weights() {
        let strategy = LatentStrategy::new(generator(4), library(4, 2)).unwrap();
        let coefficients = Tensor::from_vec(&[2], vec![0.3, 0.7]).unwrap();
        let blend = strategy.blend(&coefficients).unwrap();
        let record = strategy.export(&blend).unwrap();
        assert_eq!(record.z_tensor(Device::Cpu).unwrap(), blend.latent.unwrap());
        let weights = record.weight_map(Device::Cpu).unwrap().unwrap();
        assert_eq!(weights.len(), strategy.generator().spec().len());
    }
}
