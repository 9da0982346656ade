// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor, TensorError};
use op_config::determinism;
use rand::seq::index;

/// Binary cross-entropy on raw logits with mean reduction. The optional
/// positive weight multiplies the loss of foreground pixels.
#[derive(Debug, Default, Clone, Copy)]
pub struct BceWithLogits {
    pos_weight: Option<f32>,
}

impl BceWithLogits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pos_weight(pos_weight: f32) -> PureResult<Self> {
        if !pos_weight.is_finite() || pos_weight <= 0.0 {
            return Err(TensorError::InvalidValue { label: "pos_weight" });
        }
        Ok(Self {
            pos_weight: Some(pos_weight),
        })
    }

    pub fn pos_weight(&self) -> Option<f32> {
        self.pos_weight
    }

    fn check(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
        prediction.ensure_compatible(target)
    }

    /// Per-element weight `1 + (p - 1)·y`.
    fn log_weight(&self, y: f32) -> f32 {
        match self.pos_weight {
            Some(p) => 1.0 + (p - 1.0) * y,
            None => 1.0,
        }
    }
}

/// `log(1 + exp(-x))` without overflow.
fn softplus_neg(x: f32) -> f32 {
    (-x).max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl Loss for BceWithLogits {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::check(prediction, target)?;
        let total: f32 = prediction
            .data()
            .iter()
            .zip(target.data())
            .map(|(&x, &y)| (1.0 - y) * x + self.log_weight(y) * softplus_neg(x))
            .sum();
        let value = total / prediction.numel() as f32;
        if !value.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "bce_with_logits",
                value,
            });
        }
        Ok(Tensor::scalar(value).to_device(prediction.device()))
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::check(prediction, target)?;
        let inv = 1.0 / prediction.numel() as f32;
        let data = prediction
            .data()
            .iter()
            .zip(target.data())
            .map(|(&x, &y)| ((1.0 - y) - self.log_weight(y) * sigmoid(-x)) * inv)
            .collect();
        Ok(Tensor::from_vec(prediction.shape(), data)?.to_device(prediction.device()))
    }
}

/// Mean background-to-foreground pixel ratio over at most `max_samples`
/// masks, drawn without replacement when more are available. Masks with no
/// foreground are skipped.
pub fn estimate_pos_weight(
    masks: &[Tensor],
    max_samples: usize,
    seed: Option<u64>,
) -> PureResult<f32> {
    if masks.is_empty() || max_samples == 0 {
        return Err(TensorError::EmptyInput("estimate_pos_weight"));
    }
    let picked: Vec<usize> = if masks.len() > max_samples {
        let mut rng = determinism::rng_from_optional(seed, "op-nn/loss/pos_weight");
        index::sample(&mut rng, masks.len(), max_samples).into_vec()
    } else {
        (0..masks.len()).collect()
    };
    let total_pixels = masks[0].numel();
    let ratios: Vec<f32> = picked
        .into_iter()
        .filter_map(|idx| {
            let positives = masks[idx].data().iter().filter(|&&v| v != 0.0).count();
            (positives > 0).then(|| (total_pixels - positives) as f32 / positives as f32)
        })
        .collect();
    if ratios.is_empty() {
        return Err(TensorError::EmptyInput("estimate_pos_weight"));
    }
    Ok(ratios.iter().sum::<f32>() / ratios.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bce_matches_closed_form() {
        let mut loss = BceWithLogits::new();
        let prediction = Tensor::from_slice(&[0.0, 2.0]).unwrap();
        let target = Tensor::from_slice(&[1.0, 0.0]).unwrap();
        let value = loss.forward(&prediction, &target).unwrap().data()[0];
        let expected = (2f32.ln() + (1.0 + 2f32.exp()).ln()) / 2.0;
        assert!((value - expected).abs() < 1e-5);

        let grad = loss.backward(&prediction, &target).unwrap();
        assert!((grad.data()[0] - (0.5 - 1.0) / 2.0).abs() < 1e-6);
        assert!((grad.data()[1] - sigmoid(2.0) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn pos_weight_scales_foreground_terms() {
        let prediction = Tensor::from_slice(&[-1.0]).unwrap();
        let target = Tensor::from_slice(&[1.0]).unwrap();
        let plain = BceWithLogits::new().forward(&prediction, &target).unwrap();
        let weighted = BceWithLogits::with_pos_weight(3.0)
            .unwrap()
            .forward(&prediction, &target)
            .unwrap();
        assert!((weighted.data()[0] - 3.0 * plain.data()[0]).abs() < 1e-5);
        assert!(BceWithLogits::with_pos_weight(0.0).is_err());
    }

    #[test]
    fn large_logits_stay_finite() {
        let mut loss = BceWithLogits::new();
        let prediction = Tensor::from_slice(&[500.0, -500.0]).unwrap();
        let target = Tensor::from_slice(&[0.0, 1.0]).unwrap();
        assert!(loss.forward(&prediction, &target).unwrap().is_finite());
        assert!(loss.backward(&prediction, &target).unwrap().is_finite());
    }

    #[test]
    fn pos_weight_estimate_skips_empty_masks() {
        let quarter = Tensor::from_vec(&[1, 2, 2], vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let half = Tensor::from_vec(&[1, 2, 2], vec![1.0, 1.0, 0.0, 0.0]).unwrap();
        let empty = Tensor::zeros(&[1, 2, 2]).unwrap();
        let weight = estimate_pos_weight(&[quarter, half, empty.clone()], 200, None).unwrap();
        assert!((weight - 2.0).abs() < 1e-6);
        assert!(estimate_pos_weight(&[empty], 200, None).is_err());
    }

    #[test]
    fn pos_weight_estimate_subsamples() {
        let masks: Vec<Tensor> = (0..10)
            .map(|_| Tensor::from_vec(&[4], vec![1.0, 0.0, 0.0, 0.0]).unwrap())
            .collect();
        let weight = estimate_pos_weight(&masks, 3, Some(9)).unwrap();
        assert!((weight - 3.0).abs() < 1e-6);
    }
}
