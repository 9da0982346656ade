// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Rehearsal penalty keeping a training generator close to the weights it
//! produced for previously learned bases.

use crate::combine::weight::BACKBONE_PREFIX;
use crate::error::{ensure_device, ensure_finite, PursuitError, PursuitResult};
use crate::generator::Generator;
use crate::library::{basis_files, BasisRecord};
use crate::spec::ParameterSpec;
use op_config::determinism;
use op_nn::StateDict;
use op_tensor::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::index;
use std::path::Path;
use tracing::{debug, info};

/// Libraries up to this size are replayed in full.
const FULL_REPLAY_LIMIT: usize = 10;
const REPLAY_FRACTION: f64 = 0.2;

/// Number of entries replayed out of `n`.
pub fn sample_size(n: usize) -> usize {
    if n > FULL_REPLAY_LIMIT {
        (n as f64 * REPLAY_FRACTION).floor() as usize
    } else {
        n
    }
}

#[derive(Clone, Debug)]
struct Memory {
    name: String,
    z: Tensor,
    weights: StateDict,
}

impl Memory {
    /// Stored tensors the generator has to reproduce. Backbone tensors are
    /// skipped; any other name outside `spec` is an error.
    fn targets(&self, spec: &ParameterSpec) -> PursuitResult<Vec<&str>> {
        let mut targets = Vec::with_capacity(self.weights.len());
        let mut skipped = 0usize;
        for name in self.weights.keys() {
            if spec.contains(name) {
                targets.push(name.as_str());
            } else if name.starts_with(BACKBONE_PREFIX) {
                skipped += 1;
            } else {
                return Err(PursuitError::UnknownParameter { name: name.clone() });
            }
        }
        if skipped > 0 {
            debug!(entry = %self.name, skipped, "ignored backbone tensors in replay entry");
        }
        Ok(targets)
    }
}

/// Outcome of one [`ReplayRegularizer::penalty`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayPenalty {
    /// Weighted sum over sampled entries.
    pub value: f32,
    /// Indices of the replayed entries.
    pub sampled: Vec<usize>,
}

pub struct ReplayRegularizer {
    memories: Vec<Memory>,
    z_dim: usize,
    device: Device,
    rng: StdRng,
}

impl core::fmt::Debug for ReplayRegularizer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplayRegularizer")
            .field("entries", &self.memories.len())
            .field("z_dim", &self.z_dim)
            .field("device", &self.device)
            .finish()
    }
}

impl ReplayRegularizer {
    /// Preloads every basis file of `dir`. Each file must store its
    /// ground-truth weights.
    pub fn from_dir(
        dir: impl AsRef<Path>,
        z_dim: usize,
        device: Device,
        seed: Option<u64>,
    ) -> PursuitResult<Self> {
        let dir = dir.as_ref();
        let mut memories = Vec::new();
        for file in basis_files(dir)? {
            let record = BasisRecord::read(&file)?;
            let z = record.z_tensor(device)?;
            if z.numel() != z_dim {
                return Err(PursuitError::LatentDimension {
                    expected: z_dim,
                    got: z.numel(),
                });
            }
            let weights = record
                .weight_map(device)?
                .ok_or_else(|| PursuitError::corrupt(&file, "replay entry stores no weights"))?;
            let name = file
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();
            memories.push(Memory { name, z, weights });
        }
        if memories.is_empty() {
            return Err(PursuitError::EmptyLibrary {
                location: dir.display().to_string(),
            });
        }
        info!(dir = %dir.display(), entries = memories.len(), "replay memory loaded");
        Ok(Self {
            memories,
            z_dim,
            device,
            rng: determinism::rng_from_optional(seed, "op-pursuit/replay"),
        })
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn sample_size(&self) -> usize {
        sample_size(self.memories.len())
    }

    fn sample(&mut self) -> Vec<usize> {
        let n = self.memories.len();
        let k = sample_size(n);
        if k == n {
            return (0..n).collect();
        }
        let mut picked = index::sample(&mut self.rng, n, k).into_vec();
        picked.sort_unstable();
        picked
    }

    /// `weight_coeff · Σ_entries Σ_params ‖decode(z) − gt‖₂` over a replay
    /// sample. Gradients accumulate into `generator`, which must be trainable.
    /// Every stored entry is checked against the generator layout first: a
    /// head tensor the generator cannot produce fails the call.
    pub fn penalty(
        &mut self,
        generator: &mut Generator,
        weight_coeff: f32,
    ) -> PursuitResult<ReplayPenalty> {
        if generator.is_frozen() {
            return Err(PursuitError::FrozenGenerator {
                operation: "replay penalty",
            });
        }
        if generator.z_dim() != self.z_dim {
            return Err(PursuitError::LatentDimension {
                expected: generator.z_dim(),
                got: self.z_dim,
            });
        }
        ensure_device(generator.device(), self.device)?;
        for memory in &self.memories {
            memory.targets(generator.spec())?;
        }
        let sampled = self.sample();
        info!(
            sampled = sampled.len(),
            total = self.memories.len(),
            "replaying bases"
        );
        let mut total = 0.0f32;
        for &idx in &sampled {
            let memory = &self.memories[idx];
            let names = memory.targets(generator.spec())?;
            let decoded = generator.decode_subset(&memory.z, &names)?;
            let mut grads = StateDict::new();
            let mut entry_loss = 0.0f32;
            for (name, output) in &decoded {
                let target = memory
                    .weights
                    .get(name)
                    .ok_or_else(|| PursuitError::MissingParameter { name: name.clone() })?;
                let diff = output.sub(target)?;
                let norm = diff.l2_norm();
                entry_loss += norm;
                if norm > 0.0 {
                    grads.insert(name.clone(), diff.scale(weight_coeff / norm));
                }
            }
            let entry_loss = ensure_finite("replay loss", weight_coeff * entry_loss)?;
            debug!(entry = %memory.name, loss = entry_loss, "replayed basis");
            generator.backward(&memory.z, &grads)?;
            total += entry_loss;
        }
        Ok(ReplayPenalty {
            value: total,
            sampled,
        })
    }
}
