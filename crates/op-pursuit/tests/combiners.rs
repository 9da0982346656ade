// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::Path;
use std::sync::Arc;

use op_nn::{BceWithLogits, Loss};
use op_pursuit::{
    BasisRecord, BatchNormLinearizer, CoefficientInit, CombinationStrategy, Combiner,
    ConvBackbone, ConvBackboneConfig, DeeplabHead, ErrorKind, Generator, GeneratorConfig,
    HeadConfig, HeadWeights, LatentStrategy, ParameterSpec, PursuitError, SegmentationPipeline,
    WeightStrategy,
};
use op_tensor::{Device, Tensor};
use tempfile::tempdir;

const Z_DIM: usize = 4;

fn generator() -> Generator {
    let spec = Arc::new(ParameterSpec::deeplab_head(&HeadConfig::default()).unwrap());
    let config = GeneratorConfig {
        z_dim: Z_DIM,
        seed: Some(31),
        ..GeneratorConfig::default()
    };
    Generator::new(spec, &config, Device::Cpu).unwrap()
}

fn pipeline() -> SegmentationPipeline {
    let backbone = ConvBackbone::new(ConvBackboneConfig::default(), Some(7), Device::Cpu).unwrap();
    SegmentationPipeline::new(
        Box::new(backbone),
        DeeplabHead::new(HeadConfig::default()).unwrap(),
        Device::Cpu,
    )
    .unwrap()
}

/// Writes `n` basis files named `basis-{i}.json`, each with decoded weights.
fn write_bases(dir: &Path, n: usize) -> Vec<Tensor> {
    let generator = generator();
    (0..n)
        .map(|i| {
            let z = Tensor::random_normal(&[Z_DIM], 0.0, 1.0, Some(50 + i as u64)).unwrap();
            let weights = generator.decode(&z).unwrap();
            BasisRecord::new(&z, Some(&weights))
                .write(dir.join(format!("basis-{i}.json")))
                .unwrap();
            z
        })
        .collect()
}

fn image() -> Tensor {
    Tensor::random_uniform(&[1, 3, 32, 32], -1.0, 1.0, Some(9)).unwrap()
}

fn mask() -> Tensor {
    Tensor::from_fn(&[1, 1, 32, 32], |idx| if (idx % 32) < 16 { 1.0 } else { 0.0 }).unwrap()
}

fn explicit(values: &[f32]) -> CoefficientInit {
    CoefficientInit::Explicit {
        values: values.to_vec(),
    }
}

#[test]
fn one_hot_latent_blend_reproduces_first_basis() {
    let dir = tempdir().unwrap();
    let codes = write_bases(dir.path(), 3);
    let strategy = LatentStrategy::open(dir.path(), generator()).unwrap();
    let combiner = Combiner::new(strategy, pipeline(), &explicit(&[1.0, 0.0, 0.0])).unwrap();

    let prediction = combiner.forward(&image()).unwrap();
    assert_eq!(prediction.latent.as_ref().unwrap(), &codes[0]);

    let reference = generator();
    let weights = BatchNormLinearizer::default()
        .linearize_map(&reference.decode(&codes[0]).unwrap())
        .unwrap();
    let (expected, _) = pipeline().run(&image(), &HeadWeights::new(weights)).unwrap();
    assert_eq!(prediction.logits.shape(), &[1, 1, 32, 32]);
    assert!(prediction.logits.max_abs_diff(&expected).unwrap() < 1e-5);
}

#[test]
fn single_basis_weight_and_latent_paths_agree() {
    let dir = tempdir().unwrap();
    write_bases(dir.path(), 1);
    let latent = Combiner::new(
        LatentStrategy::open(dir.path(), generator()).unwrap(),
        pipeline(),
        &explicit(&[1.0]),
    )
    .unwrap();
    let spec = generator().spec().clone();
    let weight = Combiner::new(
        WeightStrategy::open(dir.path(), spec, None, Z_DIM, Device::Cpu).unwrap(),
        pipeline(),
        &explicit(&[1.0]),
    )
    .unwrap();

    let a = latent.forward(&image()).unwrap();
    let b = weight.forward(&image()).unwrap();
    assert!(a.logits.max_abs_diff(&b.logits).unwrap() < 1e-5);
    assert_eq!(a.latent, b.latent);
}

#[test]
fn coefficient_count_must_match_library() {
    let dir = tempdir().unwrap();
    write_bases(dir.path(), 3);
    let strategy = LatentStrategy::open(dir.path(), generator()).unwrap();
    let err = Combiner::new(strategy, pipeline(), &explicit(&[0.5, 0.5])).err().unwrap();
    assert!(matches!(
        err,
        PursuitError::CoefficientMismatch {
            bases: 3,
            coefficients: 2
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn weight_combiner_rejects_wrong_coefficient_count() {
    let dir = tempdir().unwrap();
    write_bases(dir.path(), 3);
    let spec = generator().spec().clone();
    let strategy = WeightStrategy::open(dir.path(), spec, None, Z_DIM, Device::Cpu).unwrap();
    let err = Combiner::new(strategy, pipeline(), &explicit(&[0.5, 0.5])).err().unwrap();
    assert!(matches!(
        err,
        PursuitError::CoefficientMismatch {
            bases: 3,
            coefficients: 2
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn bases_disagreeing_on_a_shape_are_rejected() {
    let dir = tempdir().unwrap();
    write_bases(dir.path(), 1);
    let z = Tensor::random_normal(&[Z_DIM], 0.0, 1.0, Some(90)).unwrap();
    let mut weights = generator().decode(&z).unwrap();
    weights.insert(
        "decoder.classifier.bias".into(),
        Tensor::from_vec(&[2], vec![0.1, 0.2]).unwrap(),
    );
    BasisRecord::new(&z, Some(&weights))
        .write(dir.path().join("basis-9.json"))
        .unwrap();

    let spec = generator().spec().clone();
    let err = WeightStrategy::open(dir.path(), spec, None, Z_DIM, Device::Cpu).unwrap_err();
    assert!(matches!(
        err,
        PursuitError::ShapeMismatch { ref name, .. } if name == "decoder.classifier.bias"
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn strategy_and_pipeline_must_share_a_device() {
    let dir = tempdir().unwrap();
    write_bases(dir.path(), 2);
    let spec = generator().spec().clone();
    let strategy = WeightStrategy::open(dir.path(), spec, None, Z_DIM, Device::Cuda(0)).unwrap();
    let err = Combiner::new(strategy, pipeline(), &CoefficientInit::Balanced)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        PursuitError::DeviceMismatch {
            expected: Device::Cpu,
            got: Device::Cuda(0)
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn empty_directory_fails_for_both_combiners() {
    let dir = tempdir().unwrap();
    let latent = LatentStrategy::open(dir.path(), generator()).unwrap_err();
    assert!(matches!(latent, PursuitError::EmptyLibrary { .. }));
    assert_eq!(latent.kind(), ErrorKind::Configuration);

    let spec = generator().spec().clone();
    let weight = WeightStrategy::open(dir.path(), spec, None, Z_DIM, Device::Cpu).unwrap_err();
    assert!(matches!(weight, PursuitError::EmptyLibrary { .. }));
}

#[test]
fn balanced_init_uses_inverse_sqrt() {
    let dir = tempdir().unwrap();
    write_bases(dir.path(), 4);
    let combiner = Combiner::new(
        LatentStrategy::open(dir.path(), generator()).unwrap(),
        pipeline(),
        &CoefficientInit::Balanced,
    )
    .unwrap();
    assert!(combiner.coefficients().data().iter().all(|&c| (c - 0.5).abs() < 1e-6));
}

fn loss_at<S: CombinationStrategy>(combiner: &Combiner<S>) -> f32 {
    let prediction = combiner.forward(&image()).unwrap();
    BceWithLogits::new()
        .forward(&prediction.logits, &mask())
        .unwrap()
        .data()[0]
}

fn check_coefficient_gradient<S: CombinationStrategy>(mut combiner: Combiner<S>) {
    let mut loss = BceWithLogits::new();
    let prediction = combiner.forward(&image()).unwrap();
    let grad_logits = loss.backward(&prediction.logits, &mask()).unwrap();
    combiner.backward(&prediction, &grad_logits).unwrap();
    let analytic = combiner.coefficient_gradient().unwrap().clone();

    let base = combiner.coefficients().clone();
    let h = 1e-2;
    for i in 0..base.numel() {
        let mut plus = base.clone();
        plus.data_mut()[i] += h;
        combiner.set_coefficients(&plus).unwrap();
        let up = loss_at(&combiner);
        let mut minus = base.clone();
        minus.data_mut()[i] -= h;
        combiner.set_coefficients(&minus).unwrap();
        let down = loss_at(&combiner);
        let numeric = (up - down) / (2.0 * h);
        let got = analytic.data()[i];
        assert!(
            (numeric - got).abs() <= 1e-2 * got.abs().max(1.0),
            "coefficient {i}: numeric {numeric} vs analytic {got}"
        );
    }
}

#[test]
fn latent_coefficient_gradient_matches_finite_differences() {
    let dir = tempdir().unwrap();
    write_bases(dir.path(), 2);
    let combiner = Combiner::new(
        LatentStrategy::open(dir.path(), generator()).unwrap(),
        pipeline(),
        &explicit(&[0.6, 0.4]),
    )
    .unwrap();
    check_coefficient_gradient(combiner);
}

#[test]
fn weight_coefficient_gradient_matches_finite_differences() {
    let dir = tempdir().unwrap();
    write_bases(dir.path(), 2);
    let spec = generator().spec().clone();
    let combiner = Combiner::new(
        WeightStrategy::open(dir.path(), spec, None, Z_DIM, Device::Cpu).unwrap(),
        pipeline(),
        &explicit(&[0.6, 0.4]),
    )
    .unwrap();
    check_coefficient_gradient(combiner);
}

#[test]
fn training_only_moves_coefficients() {
    let dir = tempdir().unwrap();
    write_bases(dir.path(), 2);
    let mut combiner = Combiner::new(
        LatentStrategy::open(dir.path(), generator()).unwrap(),
        pipeline(),
        &explicit(&[0.6, 0.4]),
    )
    .unwrap();
    let mut trainable = Vec::new();
    combiner
        .visit_trainable(&mut |param| {
            trainable.push(param.name().to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(trainable, vec!["coeffs".to_string()]);

    let before = combiner.coefficients().clone();
    let mut loss = BceWithLogits::new();
    let prediction = combiner.forward(&image()).unwrap();
    let grad = loss.backward(&prediction.logits, &mask()).unwrap();
    combiner.backward(&prediction, &grad).unwrap();
    combiner.clip_gradients_value(10.0).unwrap();
    combiner.apply_step(0.1).unwrap();
    combiner.zero_grad().unwrap();
    assert_ne!(combiner.coefficients(), &before);
    assert!(combiner.coefficient_gradient().map_or(true, |g| g.data().iter().all(|&v| v == 0.0)));
}

#[test]
fn saved_basis_restores_coefficients() {
    let dir = tempdir().unwrap();
    let bases = dir.path().join("bases");
    std::fs::create_dir_all(&bases).unwrap();
    write_bases(&bases, 3);
    let out = dir.path().join("Kettle.json");

    let source = Combiner::new(
        LatentStrategy::open(&bases, generator()).unwrap(),
        pipeline(),
        &explicit(&[0.2, -0.4, 1.1]),
    )
    .unwrap();
    source.save_basis(&out).unwrap();

    let record = BasisRecord::read(&out).unwrap();
    assert!(record.weights.is_some());
    assert_eq!(record.z.shape, vec![Z_DIM]);

    let mut target = Combiner::new(
        LatentStrategy::open(&bases, generator()).unwrap(),
        pipeline(),
        &CoefficientInit::Balanced,
    )
    .unwrap();
    target.load_basis(&out).unwrap();
    assert_eq!(target.coefficients(), source.coefficients());
}
