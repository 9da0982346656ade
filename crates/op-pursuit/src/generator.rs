// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Hypernetwork decoding a latent code into every tensor of the head.
//!
//! Each named output has its own linear map `z_dim → numel(shape)`; nothing
//! is shared between outputs. Running-variance outputs pass through softplus
//! so that decoded variances are always positive.

use crate::checkpoint::{read_checkpoint, LoadReport, RenameTable};
use crate::error::{ensure_device, PursuitError, PursuitResult};
use crate::spec::{ParamRole, ParameterSpec};
use op_config::determinism;
use op_nn::{Linear, Module, Parameter, PureResult, StateDict};
use op_tensor::{Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// `ln(e − 1)`: the pre-activation whose softplus is exactly one.
const SOFTPLUS_ONE: f32 = 0.541_324_8;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub z_dim: usize,
    /// Weight std before the `1/sqrt(z_dim)` fan-in scaling.
    pub init_std: f32,
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            z_dim: 100,
            init_std: 0.1,
            seed: None,
        }
    }
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn bias_fill(role: ParamRole) -> f32 {
    match role {
        ParamRole::BnScale => 1.0,
        ParamRole::BnRunningVar => SOFTPLUS_ONE,
        _ => 0.0,
    }
}

pub struct Generator {
    spec: Arc<ParameterSpec>,
    z_dim: usize,
    blocks: Vec<Linear>,
    frozen: bool,
    device: Device,
}

impl core::fmt::Debug for Generator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Generator")
            .field("z_dim", &self.z_dim)
            .field("outputs", &self.blocks.len())
            .field("frozen", &self.frozen)
            .field("device", &self.device)
            .finish()
    }
}

impl Generator {
    pub fn new(
        spec: Arc<ParameterSpec>,
        config: &GeneratorConfig,
        device: Device,
    ) -> PursuitResult<Self> {
        if config.z_dim == 0 {
            return Err(PursuitError::Invalid("generator z_dim must be positive".into()));
        }
        if spec.is_empty() {
            return Err(PursuitError::Invalid(
                "generator needs at least one output tensor".into(),
            ));
        }
        let std = config.init_std / (config.z_dim as f32).sqrt();
        let mut seeds = determinism::rng_from_optional(config.seed, "op-pursuit/generator");
        let mut blocks = Vec::with_capacity(spec.len());
        for entry in spec.entries() {
            let block = Linear::seeded(
                format!("blocks.{}", entry.name),
                config.z_dim,
                entry.numel(),
                std,
                bias_fill(entry.role),
                Some(seeds.gen()),
            )?;
            blocks.push(block.to_device(device));
        }
        info!(
            z_dim = config.z_dim,
            outputs = blocks.len(),
            scalars = spec.total_numel(),
            %device,
            "generator initialised"
        );
        Ok(Self {
            spec,
            z_dim: config.z_dim,
            blocks,
            frozen: false,
            device,
        })
    }

    pub fn spec(&self) -> &Arc<ParameterSpec> {
        &self.spec
    }

    pub fn z_dim(&self) -> usize {
        self.z_dim
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Stops gradient accumulation into every sub-generator.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    /// Validates `z` and returns it as a `[1, z_dim]` row.
    pub fn latent_row(&self, z: &Tensor) -> PursuitResult<Tensor> {
        if z.numel() != self.z_dim {
            return Err(PursuitError::LatentDimension {
                expected: self.z_dim,
                got: z.numel(),
            });
        }
        ensure_device(self.device, z.device())?;
        Ok(z.reshape(&[1, self.z_dim])?)
    }

    fn decode_index(&self, row: &Tensor, idx: usize) -> PursuitResult<Tensor> {
        let entry = &self.spec.entries()[idx];
        let mut out = self.blocks[idx].forward(row)?.reshape(&entry.shape)?;
        if entry.role == ParamRole::BnRunningVar {
            out = out.map(softplus);
        }
        Ok(out)
    }

    /// Decodes `z` into the full name → tensor mapping.
    pub fn decode(&self, z: &Tensor) -> PursuitResult<StateDict> {
        let row = self.latent_row(z)?;
        let mut out = StateDict::new();
        for (idx, entry) in self.spec.entries().iter().enumerate() {
            out.insert(entry.name.clone(), self.decode_index(&row, idx)?);
        }
        Ok(out)
    }

    /// Decodes only the requested names.
    pub fn decode_subset(&self, z: &Tensor, names: &[&str]) -> PursuitResult<StateDict> {
        let row = self.latent_row(z)?;
        let mut out = StateDict::new();
        for name in names {
            let idx = self
                .spec
                .position(name)
                .ok_or_else(|| PursuitError::UnknownParameter {
                    name: name.to_string(),
                })?;
            out.insert(name.to_string(), self.decode_index(&row, idx)?);
        }
        Ok(out)
    }

    /// Backpropagates gradients on decoded tensors. Returns `dL/dz` shaped
    /// like `z`; sub-generator gradients are accumulated unless frozen.
    pub fn backward(&mut self, z: &Tensor, grads: &StateDict) -> PursuitResult<Tensor> {
        let row = self.latent_row(z)?;
        let mut grad_z = Tensor::zeros(&[1, self.z_dim])?.to_device(self.device);
        for (name, grad) in grads {
            let idx = self
                .spec
                .position(name)
                .ok_or_else(|| PursuitError::UnknownParameter { name: name.clone() })?;
            self.spec.check(name, grad)?;
            let entry = &self.spec.entries()[idx];
            let mut grad_row = grad.reshape(&[1, entry.numel()])?;
            if entry.role == ParamRole::BnRunningVar {
                let pre = self.blocks[idx].forward(&row)?;
                for (g, &x) in grad_row.data_mut().iter_mut().zip(pre.data()) {
                    *g *= sigmoid(x);
                }
            }
            let grad_input = if self.frozen {
                self.blocks[idx].backward_input(&grad_row)?
            } else {
                self.blocks[idx].backward(&row, &grad_row)?
            };
            grad_z.add_scaled(&grad_input, 1.0)?;
        }
        Ok(grad_z.reshape(z.shape())?)
    }

    /// Restores sub-generator parameters from `state` through `table`.
    pub fn load_state(&mut self, state: StateDict, table: &RenameTable) -> PursuitResult<LoadReport> {
        let device = self.device;
        let report = table.restore(self, state, device)?;
        info!(
            loaded = report.loaded.len(),
            ignored = report.ignored.len(),
            "generator checkpoint applied"
        );
        Ok(report)
    }

    pub fn load_checkpoint(
        &mut self,
        path: impl AsRef<Path>,
        table: &RenameTable,
    ) -> PursuitResult<LoadReport> {
        let state = read_checkpoint(path)?;
        self.load_state(state, table)
    }
}

impl Module for Generator {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for block in &self.blocks {
            block.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for block in &mut self.blocks {
            block.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ParamEntry;

    fn small_spec() -> Arc<ParameterSpec> {
        Arc::new(
            ParameterSpec::new(vec![
                ParamEntry::new("head.conv.weight", vec![2, 1, 1, 1], ParamRole::ConvWeight),
                ParamEntry::new("head.bn.weight", vec![2], ParamRole::BnScale),
                ParamEntry::new("head.bn.running_var", vec![2], ParamRole::BnRunningVar),
            ])
            .unwrap(),
        )
    }

    fn generator() -> Generator {
        let config = GeneratorConfig {
            z_dim: 3,
            init_std: 0.5,
            seed: Some(11),
        };
        Generator::new(small_spec(), &config, Device::Cpu).unwrap()
    }

    #[test]
    fn decode_is_shape_exact_and_deterministic() {
        let gen = generator();
        let z = Tensor::from_slice(&[0.1, -0.2, 0.3]).unwrap();
        let first = gen.decode(&z).unwrap();
        assert_eq!(first["head.conv.weight"].shape(), &[2, 1, 1, 1]);
        assert_eq!(first, gen.decode(&z).unwrap());
        assert!(first["head.bn.running_var"].data().iter().all(|&v| v > 0.0));
        let zero = gen.decode(&Tensor::zeros(&[3]).unwrap()).unwrap();
        assert_eq!(zero["head.bn.weight"].data(), &[1.0, 1.0]);
        assert!((zero["head.bn.running_var"].data()[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_wrong_latent_length_and_unknown_names() {
        let gen = generator();
        let err = gen.decode(&Tensor::zeros(&[4]).unwrap()).unwrap_err();
        assert!(matches!(err, PursuitError::LatentDimension { expected: 3, got: 4 }));
        let z = Tensor::zeros(&[3]).unwrap();
        assert!(matches!(
            gen.decode_subset(&z, &["missing"]),
            Err(PursuitError::UnknownParameter { .. })
        ));
        assert_eq!(gen.decode_subset(&z, &["head.bn.weight"]).unwrap().len(), 1);
    }

    #[test]
    fn backward_matches_finite_differences_in_z() {
        let mut gen = generator();
        gen.freeze();
        let z = Tensor::from_slice(&[0.4, -0.1, 0.25]).unwrap();
        let probe: StateDict = gen
            .decode(&z)
            .unwrap()
            .into_iter()
            .map(|(name, t)| {
                let shape = t.shape().to_vec();
                (name, Tensor::from_fn(&shape, |i| 0.3 + i as f32 * 0.2).unwrap())
            })
            .collect();
        let objective = |gen: &Generator, z: &Tensor| -> f32 {
            let decoded = gen.decode(z).unwrap();
            probe
                .iter()
                .map(|(name, p)| decoded[name].dot(p).unwrap())
                .sum()
        };
        let grad = gen.backward(&z, &probe).unwrap();
        let h = 1e-2;
        for i in 0..3 {
            let mut plus = z.clone();
            plus.data_mut()[i] += h;
            let mut minus = z.clone();
            minus.data_mut()[i] -= h;
            let numeric = (objective(&gen, &plus) - objective(&gen, &minus)) / (2.0 * h);
            assert!((numeric - grad.data()[i]).abs() < 1e-3);
        }
        // frozen: nothing accumulated
        let mut norm = 0.0;
        gen.visit_parameters(&mut |p| {
            norm += p.accumulators_norm_sq();
            Ok(())
        })
        .unwrap();
        assert_eq!(norm, 0.0);
    }

    #[test]
    fn checkpoint_roundtrip_through_hypernet_prefix() {
        let gen = generator();
        let saved: StateDict = gen
            .state_dict()
            .unwrap()
            .into_iter()
            .map(|(name, t)| (format!("hypernet.{name}"), t))
            .collect();
        let mut other = Generator::new(
            small_spec(),
            &GeneratorConfig {
                z_dim: 3,
                init_std: 0.5,
                seed: Some(99),
            },
            Device::Cpu,
        )
        .unwrap();
        let report = other.load_state(saved, &RenameTable::generator()).unwrap();
        assert_eq!(report.loaded.len(), 6);
        assert!(report.ignored.is_empty());
        let z = Tensor::from_slice(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(gen.decode(&z).unwrap(), other.decode(&z).unwrap());
    }

    #[test]
    fn rejects_foreign_device_latent() {
        let gen = generator();
        let z = Tensor::zeros(&[3]).unwrap().to_device(Device::Cuda(0));
        assert!(matches!(
            gen.decode(&z),
            Err(PursuitError::DeviceMismatch { .. })
        ));
    }
}
