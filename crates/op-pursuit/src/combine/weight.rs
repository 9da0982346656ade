// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Weight-space blending.
//!
//! Every basis is decoded (or read) once at construction, stripped down to the
//! head groups and batch-norm linearized. A forward pass is then a plain
//! per-tensor linear combination; the generator is never called again. Blending
//! folded affine pairs instead of raw running statistics is what keeps the
//! result a valid batch-norm layer.

use super::{check_coefficients, Blend, CombinationStrategy};
use crate::batchnorm::{detect_sites, BatchNormLinearizer, BnSite};
use crate::error::{ensure_device, PursuitError, PursuitResult};
use crate::generator::Generator;
use crate::head::HeadWeights;
use crate::library::{BasisEntry, BasisLibrary, BasisRecord};
use crate::spec::ParameterSpec;
use op_nn::StateDict;
use op_tensor::{Device, Tensor};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) const BACKBONE_PREFIX: &str = "backbone.";
const HEAD_PREFIXES: [&str; 2] = ["aspp.", "decoder."];

/// Keeps the head groups of `weights`. Backbone tensors are dropped, anything
/// else is rejected.
fn head_partition(weights: &StateDict) -> PursuitResult<StateDict> {
    let mut head = StateDict::new();
    let mut skipped = 0usize;
    for (name, tensor) in weights {
        if name.starts_with(BACKBONE_PREFIX) {
            skipped += 1;
        } else if HEAD_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            head.insert(name.clone(), tensor.clone());
        } else {
            warn!(name = %name, "basis holds a parameter outside every known group");
            return Err(PursuitError::UnexpectedParameter { name: name.clone() });
        }
    }
    if skipped > 0 {
        debug!(skipped, "ignored backbone tensors in basis");
    }
    Ok(head)
}

fn basis_weights(entry: &BasisEntry, generator: Option<&Generator>) -> PursuitResult<StateDict> {
    match (entry.weights(), generator) {
        (Some(weights), _) => Ok(weights.clone()),
        (None, Some(generator)) => generator.decode(entry.z()),
        (None, None) => Err(PursuitError::Invalid(format!(
            "basis '{}' stores no weights and no generator was supplied to decode it",
            entry.name()
        ))),
    }
}

fn same_layout(reference: &StateDict, other: &StateDict) -> PursuitResult<()> {
    for (name, tensor) in other {
        let expected = reference
            .get(name)
            .ok_or_else(|| PursuitError::UnknownParameter { name: name.clone() })?;
        if expected.shape() != tensor.shape() {
            return Err(PursuitError::ShapeMismatch {
                name: name.clone(),
                expected: expected.shape().to_vec(),
                got: tensor.shape().to_vec(),
            });
        }
    }
    if let Some(name) = reference.keys().find(|name| !other.contains_key(*name)) {
        return Err(PursuitError::MissingParameter { name: name.clone() });
    }
    Ok(())
}

/// Tensors mixed per forward pass: every linearized entry except the raw
/// quadruples its affine pairs were folded from.
fn mixed_names(basis: &StateDict) -> Vec<String> {
    let folded: BTreeSet<String> = detect_sites(basis.keys().map(String::as_str))
        .iter()
        .flat_map(BnSite::raw_keys)
        .collect();
    basis
        .keys()
        .filter(|name| !folded.contains(*name))
        .cloned()
        .collect()
}

/// Blends decoded head tensors directly.
#[derive(Debug)]
pub struct WeightStrategy {
    spec: Arc<ParameterSpec>,
    names: Vec<String>,
    bases: Vec<StateDict>,
    codes: Vec<Tensor>,
    linearizer: BatchNormLinearizer,
    device: Device,
}

impl WeightStrategy {
    /// Decodes or reads every basis of `library` once. `generator` is only
    /// consulted for entries that carry no stored weights.
    pub fn new(
        library: &BasisLibrary,
        spec: Arc<ParameterSpec>,
        generator: Option<&Generator>,
    ) -> PursuitResult<Self> {
        Self::with_linearizer(library, spec, generator, BatchNormLinearizer::default())
    }

    pub fn with_linearizer(
        library: &BasisLibrary,
        spec: Arc<ParameterSpec>,
        generator: Option<&Generator>,
        linearizer: BatchNormLinearizer,
    ) -> PursuitResult<Self> {
        if library.is_empty() {
            return Err(PursuitError::EmptyLibrary {
                location: library.location().to_string(),
            });
        }
        let device = library.device();
        if let Some(generator) = generator {
            ensure_device(device, generator.device())?;
        }
        let mut bases: Vec<StateDict> = Vec::with_capacity(library.len());
        for entry in library.entries() {
            let head = head_partition(&basis_weights(entry, generator)?)?;
            for (name, tensor) in &head {
                spec.check(name, tensor)?;
                ensure_device(device, tensor.device())?;
            }
            spec.check_complete(&head)?;
            let linearized = linearizer.linearize_map(&head)?;
            if let Some(reference) = bases.first() {
                same_layout(reference, &linearized)?;
            }
            bases.push(linearized);
        }
        let names = bases.first().map(mixed_names).unwrap_or_default();
        let codes = library.entries().iter().map(|entry| entry.z().clone()).collect();
        info!(
            bases = bases.len(),
            tensors = spec.len(),
            source = library.location(),
            "weight strategy ready"
        );
        Ok(Self {
            spec,
            names,
            bases,
            codes,
            linearizer,
            device,
        })
    }

    /// Opens a basis directory or archive and builds the strategy over it.
    pub fn open(
        path: impl AsRef<Path>,
        spec: Arc<ParameterSpec>,
        generator: Option<&Generator>,
        z_dim: usize,
        device: Device,
    ) -> PursuitResult<Self> {
        let library = BasisLibrary::open(path, z_dim, device)?;
        Self::new(&library, spec, generator)
    }

    pub fn spec(&self) -> &Arc<ParameterSpec> {
        &self.spec
    }

    /// Names mixed by [`CombinationStrategy::blend`].
    pub fn blended_names(&self) -> &[String] {
        &self.names
    }

    /// Linearized head tensors of basis `index`, raw quadruples included.
    pub fn basis(&self, index: usize) -> Option<&StateDict> {
        self.bases.get(index)
    }

    fn tensors(&self, name: &str) -> PursuitResult<Vec<&Tensor>> {
        self.bases
            .iter()
            .map(|basis| {
                basis.get(name).ok_or_else(|| PursuitError::MissingParameter {
                    name: name.to_string(),
                })
            })
            .collect()
    }
}

impl CombinationStrategy for WeightStrategy {
    fn base_num(&self) -> usize {
        self.bases.len()
    }

    fn device(&self) -> Device {
        self.device
    }

    fn blend(&self, coefficients: &Tensor) -> PursuitResult<Blend> {
        check_coefficients(self.bases.len(), coefficients)?;
        let coeffs = coefficients.data();
        let mut weights = StateDict::new();
        for name in &self.names {
            let blended = Tensor::linear_combination(&self.tensors(name)?, coeffs)?;
            weights.insert(name.clone(), blended);
        }
        let codes: Vec<&Tensor> = self.codes.iter().collect();
        let latent = Tensor::linear_combination(&codes, coeffs)?;
        Ok(Blend {
            weights: HeadWeights::new(weights),
            latent: Some(latent),
            raw: None,
        })
    }

    fn backward(
        &mut self,
        coefficients: &Tensor,
        _blend: &Blend,
        grads: &StateDict,
    ) -> PursuitResult<Tensor> {
        check_coefficients(self.bases.len(), coefficients)?;
        let mut values = vec![0.0f32; self.bases.len()];
        for (name, grad) in grads {
            for (value, tensor) in values.iter_mut().zip(self.tensors(name)?) {
                *value += grad.dot(tensor)?;
            }
        }
        Ok(Tensor::from_vec(&[values.len()], values)?.to_device(self.device))
    }

    /// Folded pairs are written back as `(scale, shift, 0, 1 − ε)` quadruples.
    fn export(&self, blend: &Blend) -> PursuitResult<BasisRecord> {
        let weights = self.linearizer.delinearize_map(blend.weights.as_map())?;
        let z = blend
            .latent
            .as_ref()
            .ok_or_else(|| PursuitError::Invalid("weight blend carries no code".into()))?;
        Ok(BasisRecord::new(z, Some(&weights)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchnorm::is_affine_key;
    use crate::generator::GeneratorConfig;
    use crate::spec::HeadConfig;

    fn setup(n: usize) -> (Generator, BasisLibrary) {
        let spec = Arc::new(ParameterSpec::deeplab_head(&HeadConfig::default()).unwrap());
        let config = GeneratorConfig {
            z_dim: 4,
            seed: Some(8),
            ..GeneratorConfig::default()
        };
        let generator = Generator::new(spec, &config, Device::Cpu).unwrap();
        let entries = (0..n)
            .map(|i| {
                let z = Tensor::random_normal(&[4], 0.0, 1.0, Some(40 + i as u64)).unwrap();
                BasisEntry::new(format!("{i}"), z, None)
            })
            .collect();
        let library = BasisLibrary::from_entries(entries, 4, Device::Cpu).unwrap();
        (generator, library)
    }

    #[test]
    fn blend_is_linear_per_tensor() {
        let (generator, library) = setup(2);
        let strategy = WeightStrategy::new(&library, generator.spec().clone(), Some(&generator)).unwrap();
        let coefficients = Tensor::from_vec(&[2], vec![0.25, -1.5]).unwrap();
        let blend = strategy.blend(&coefficients).unwrap();
        let name = "decoder.classifier.weight";
        let expected = strategy
            .basis(0)
            .unwrap()
            .get(name)
            .unwrap()
            .scale(0.25)
            .add(&strategy.basis(1).unwrap().get(name).unwrap().scale(-1.5))
            .unwrap();
        let got = blend.weights.get(name).unwrap();
        assert!(got.max_abs_diff(&expected).unwrap() < 1e-6);
    }

    #[test]
    fn backbone_tensors_are_ignored() {
        let (generator, library) = setup(1);
        let entry = library.get(0).unwrap();
        let mut weights = generator.decode(entry.z()).unwrap();
        weights.insert("backbone.stem.weight".into(), Tensor::zeros(&[2, 2]).unwrap());
        let stored = BasisLibrary::from_entries(
            vec![BasisEntry::new("0", entry.z().clone(), Some(weights))],
            4,
            Device::Cpu,
        )
        .unwrap();
        let strategy = WeightStrategy::new(&stored, generator.spec().clone(), None).unwrap();
        assert!(strategy
            .basis(0)
            .unwrap()
            .keys()
            .all(|name| !name.starts_with("backbone.")));
    }

    #[test]
    fn unexpected_group_is_rejected() {
        let (generator, library) = setup(1);
        let entry = library.get(0).unwrap();
        let mut weights = generator.decode(entry.z()).unwrap();
        weights.insert("classifier.extra".into(), Tensor::zeros(&[1]).unwrap());
        let stored = BasisLibrary::from_entries(
            vec![BasisEntry::new("0", entry.z().clone(), Some(weights))],
            4,
            Device::Cpu,
        )
        .unwrap();
        let err = WeightStrategy::new(&stored, generator.spec().clone(), None).unwrap_err();
        assert!(matches!(err, PursuitError::UnexpectedParameter { name } if name == "classifier.extra"));
    }

    #[test]
    fn code_only_basis_needs_a_generator() {
        let (generator, library) = setup(2);
        assert!(WeightStrategy::new(&library, generator.spec().clone(), None).is_err());
    }

    #[test]
    fn backward_is_inner_product_with_each_basis() {
        let (generator, library) = setup(3);
        let mut strategy =
            WeightStrategy::new(&library, generator.spec().clone(), Some(&generator)).unwrap();
        let coefficients = Tensor::from_vec(&[3], vec![0.2, 0.3, 0.5]).unwrap();
        let blend = strategy.blend(&coefficients).unwrap();
        let name = "decoder.classifier.bias";
        let grad = Tensor::full(&[1], 2.0).unwrap();
        let mut grads = StateDict::new();
        grads.insert(name.to_string(), grad);
        let out = strategy.backward(&coefficients, &blend, &grads).unwrap();
        for i in 0..3 {
            let expected = 2.0 * strategy.basis(i).unwrap().get(name).unwrap().data()[0];
            assert!((out.data()[i] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn export_replaces_affine_pairs_with_quadruples() {
        let (generator, library) = setup(2);
        let strategy = WeightStrategy::new(&library, generator.spec().clone(), Some(&generator)).unwrap();
        let coefficients = Tensor::from_vec(&[2], vec![0.5, 0.5]).unwrap();
        let blend = strategy.blend(&coefficients).unwrap();
        let record = strategy.export(&blend).unwrap();
        let weights = record.weight_map(Device::Cpu).unwrap().unwrap();
        assert!(weights.keys().all(|name| !is_affine_key(name)));
        generator.spec().check_complete(&weights).unwrap();
        let mean = weights.get("aspp.project.bn.running_mean").unwrap();
        assert!(mean.data().iter().all(|&m| m == 0.0));
    }

    #[test]
    fn blend_mixes_affine_pairs_not_running_statistics() {
        let (generator, library) = setup(2);
        let strategy = WeightStrategy::new(&library, generator.spec().clone(), Some(&generator)).unwrap();
        assert!(strategy
            .blended_names()
            .iter()
            .all(|name| !name.ends_with(".running_mean") && !name.ends_with(".running_var")));
        let blend = strategy.blend(&Tensor::from_vec(&[2], vec![0.5, 0.5]).unwrap()).unwrap();
        let weights = blend.weights.as_map();
        assert!(weights.contains_key("aspp.project.bn.affine_scale"));
        assert!(!weights.contains_key("aspp.project.bn.running_var"));
        assert!(!weights.contains_key("aspp.project.bn.weight"));
        assert!(weights.contains_key("decoder.classifier.weight"));
        assert!(strategy
            .basis(0)
            .unwrap()
            .contains_key("aspp.project.bn.running_var"));
    }
}
