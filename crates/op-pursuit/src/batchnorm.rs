// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Folding of inference-mode batch normalisation into a per-channel affine
//! pair. A normalised activation `γ (x − μ) / sqrt(σ² + ε) + β` is linear in
//! `x`, so the pair `(scale, shift)` is what can be blended across bases.

use crate::error::{PursuitError, PursuitResult};
use op_nn::StateDict;
use op_tensor::Tensor;
use std::collections::BTreeSet;

pub const EPSILON: f32 = 1e-5;

const WEIGHT: &str = "weight";
const BIAS: &str = "bias";
const RUNNING_MEAN: &str = "running_mean";
const RUNNING_VAR: &str = "running_var";
const AFFINE_SCALE: &str = "affine_scale";
const AFFINE_SHIFT: &str = "affine_shift";

/// A prefix under which all four batch-norm tensors are present.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BnSite {
    prefix: String,
}

impl BnSite {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, field: &str) -> String {
        format!("{}.{field}", self.prefix)
    }

    pub fn weight_key(&self) -> String {
        self.key(WEIGHT)
    }

    pub fn bias_key(&self) -> String {
        self.key(BIAS)
    }

    pub fn mean_key(&self) -> String {
        self.key(RUNNING_MEAN)
    }

    pub fn var_key(&self) -> String {
        self.key(RUNNING_VAR)
    }

    pub fn scale_key(&self) -> String {
        self.key(AFFINE_SCALE)
    }

    pub fn shift_key(&self) -> String {
        self.key(AFFINE_SHIFT)
    }

    pub fn raw_keys(&self) -> [String; 4] {
        [
            self.weight_key(),
            self.bias_key(),
            self.mean_key(),
            self.var_key(),
        ]
    }
}

/// Finds every complete batch-norm site among `names`, in sorted order.
/// Prefixes missing any of the four tensors are not sites.
pub fn detect_sites<'a, I>(names: I) -> Vec<BnSite>
where
    I: IntoIterator<Item = &'a str>,
{
    let names: BTreeSet<&str> = names.into_iter().collect();
    names
        .iter()
        .filter_map(|name| name.strip_suffix(".running_mean"))
        .map(|prefix| BnSite {
            prefix: prefix.to_string(),
        })
        .filter(|site| site.raw_keys().iter().all(|key| names.contains(key.as_str())))
        .collect()
}

/// Affine pair equivalent to one batch-norm site.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearizedBn {
    pub scale: Tensor,
    pub shift: Tensor,
}

/// Gradients of the raw quadruple.
#[derive(Clone, Debug, PartialEq)]
pub struct BnQuadGrads {
    pub weight: Tensor,
    pub bias: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchNormLinearizer {
    epsilon: f32,
}

impl Default for BatchNormLinearizer {
    fn default() -> Self {
        Self { epsilon: EPSILON }
    }
}

fn fetch<'a>(map: &'a StateDict, key: &str) -> PursuitResult<&'a Tensor> {
    map.get(key).ok_or_else(|| PursuitError::MissingParameter {
        name: key.to_string(),
    })
}

fn same_shape(site: &str, reference: &Tensor, other: &Tensor) -> PursuitResult<()> {
    if reference.shape() != other.shape() {
        return Err(PursuitError::ShapeMismatch {
            name: site.to_string(),
            expected: reference.shape().to_vec(),
            got: other.shape().to_vec(),
        });
    }
    Ok(())
}

impl BatchNormLinearizer {
    pub fn new(epsilon: f32) -> PursuitResult<Self> {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(PursuitError::Invalid(format!(
                "batch-norm epsilon must be positive and finite, got {epsilon}"
            )));
        }
        Ok(Self { epsilon })
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    fn inv_std(&self, var: f32) -> PursuitResult<f32> {
        let denom = var + self.epsilon;
        if denom.is_nan() || denom <= 0.0 {
            return Err(PursuitError::NonFinite {
                label: "batch-norm variance".into(),
                value: var,
            });
        }
        Ok(1.0 / denom.sqrt())
    }

    /// `scale = γ / sqrt(σ² + ε)`, `shift = β − μ · scale`.
    pub fn linearize(
        &self,
        weight: &Tensor,
        bias: &Tensor,
        mean: &Tensor,
        var: &Tensor,
    ) -> PursuitResult<LinearizedBn> {
        for other in [bias, mean, var] {
            same_shape("batch-norm quadruple", weight, other)?;
        }
        let mut scale = Vec::with_capacity(weight.numel());
        let mut shift = Vec::with_capacity(weight.numel());
        for (((&g, &b), &m), &v) in weight
            .data()
            .iter()
            .zip(bias.data())
            .zip(mean.data())
            .zip(var.data())
        {
            let s = g * self.inv_std(v)?;
            scale.push(s);
            shift.push(b - m * s);
        }
        let device = weight.device();
        Ok(LinearizedBn {
            scale: Tensor::from_vec(weight.shape(), scale)?.to_device(device),
            shift: Tensor::from_vec(weight.shape(), shift)?.to_device(device),
        })
    }

    /// Chain rule from `(d scale, d shift)` back to the quadruple.
    pub fn backprop(
        &self,
        weight: &Tensor,
        mean: &Tensor,
        var: &Tensor,
        grad_scale: &Tensor,
        grad_shift: &Tensor,
    ) -> PursuitResult<BnQuadGrads> {
        for other in [mean, var, grad_scale, grad_shift] {
            same_shape("batch-norm gradient", weight, other)?;
        }
        let n = weight.numel();
        let (mut d_weight, mut d_mean, mut d_var) =
            (Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n));
        for i in 0..n {
            let (g, m, v) = (weight.data()[i], mean.data()[i], var.data()[i]);
            let (gs, gb) = (grad_scale.data()[i], grad_shift.data()[i]);
            let r = self.inv_std(v)?;
            // total derivative w.r.t. scale once shift's dependence is folded in
            let through_scale = gs - gb * m;
            d_weight.push(through_scale * r);
            d_mean.push(-gb * g * r);
            d_var.push(through_scale * g * -0.5 * r * r * r);
        }
        let shape = weight.shape();
        let device = weight.device();
        Ok(BnQuadGrads {
            weight: Tensor::from_vec(shape, d_weight)?.to_device(device),
            bias: grad_shift.clone(),
            running_mean: Tensor::from_vec(shape, d_mean)?.to_device(device),
            running_var: Tensor::from_vec(shape, d_var)?.to_device(device),
        })
    }

    /// Quadruple `(scale, shift, 0, 1 − ε)` that normalises to the same affine
    /// pair.
    pub fn delinearize(&self, affine: &LinearizedBn) -> PursuitResult<[Tensor; 4]> {
        same_shape("affine pair", &affine.scale, &affine.shift)?;
        let shape = affine.scale.shape();
        let device = affine.scale.device();
        Ok([
            affine.scale.clone(),
            affine.shift.clone(),
            Tensor::zeros(shape)?.to_device(device),
            Tensor::full(shape, 1.0 - self.epsilon)?.to_device(device),
        ])
    }

    /// Adds `{prefix}.affine_scale` / `{prefix}.affine_shift` for every site
    /// in `weights`. Raw tensors are kept.
    pub fn linearize_map(&self, weights: &StateDict) -> PursuitResult<StateDict> {
        let mut out = weights.clone();
        for site in detect_sites(weights.keys().map(String::as_str)) {
            let affine = self.linearize(
                fetch(weights, &site.weight_key())?,
                fetch(weights, &site.bias_key())?,
                fetch(weights, &site.mean_key())?,
                fetch(weights, &site.var_key())?,
            )?;
            out.insert(site.scale_key(), affine.scale);
            out.insert(site.shift_key(), affine.shift);
        }
        Ok(out)
    }

    /// Converts gradients expressed on affine pairs into gradients on the raw
    /// quadruples of `raw`. Entries without an affine suffix pass through.
    pub fn backprop_map(&self, raw: &StateDict, grads: &StateDict) -> PursuitResult<StateDict> {
        let mut out = StateDict::new();
        for site in detect_sites(raw.keys().map(String::as_str)) {
            let (scale_key, shift_key) = (site.scale_key(), site.shift_key());
            let (grad_scale, grad_shift) = match (grads.get(&scale_key), grads.get(&shift_key)) {
                (None, None) => continue,
                (Some(gs), Some(gb)) => (gs.clone(), gb.clone()),
                (Some(gs), None) => (gs.clone(), Tensor::zeros(gs.shape())?.to_device(gs.device())),
                (None, Some(gb)) => (Tensor::zeros(gb.shape())?.to_device(gb.device()), gb.clone()),
            };
            let quad = self.backprop(
                fetch(raw, &site.weight_key())?,
                fetch(raw, &site.mean_key())?,
                fetch(raw, &site.var_key())?,
                &grad_scale,
                &grad_shift,
            )?;
            out.insert(site.weight_key(), quad.weight);
            out.insert(site.bias_key(), quad.bias);
            out.insert(site.mean_key(), quad.running_mean);
            out.insert(site.var_key(), quad.running_var);
        }
        for (name, grad) in grads {
            if is_affine_key(name) {
                continue;
            }
            match out.get_mut(name) {
                Some(existing) => existing.add_scaled(grad, 1.0)?,
                None => {
                    out.insert(name.clone(), grad.clone());
                }
            }
        }
        Ok(out)
    }

    /// Replaces every affine pair in `weights` by its equivalent quadruple and
    /// drops the derived entries.
    pub fn delinearize_map(&self, weights: &StateDict) -> PursuitResult<StateDict> {
        let mut out = StateDict::new();
        for (name, tensor) in weights {
            if let Some(prefix) = name.strip_suffix(".affine_scale") {
                let shift_key = format!("{prefix}.{AFFINE_SHIFT}");
                let affine = LinearizedBn {
                    scale: tensor.clone(),
                    shift: fetch(weights, &shift_key)?.clone(),
                };
                let [w, b, m, v] = self.delinearize(&affine)?;
                out.insert(format!("{prefix}.{WEIGHT}"), w);
                out.insert(format!("{prefix}.{BIAS}"), b);
                out.insert(format!("{prefix}.{RUNNING_MEAN}"), m);
                out.insert(format!("{prefix}.{RUNNING_VAR}"), v);
            }
        }
        for (name, tensor) in weights {
            if is_affine_key(name) {
                continue;
            }
            out.entry(name.clone()).or_insert_with(|| tensor.clone());
        }
        Ok(out)
    }
}

/// Names derived by [`BatchNormLinearizer::linearize_map`].
pub fn is_affine_key(name: &str) -> bool {
    [AFFINE_SCALE, AFFINE_SHIFT].iter().any(|field| {
        name.strip_suffix(field)
            .is_some_and(|prefix| prefix.ends_with('.'))
    })
}
