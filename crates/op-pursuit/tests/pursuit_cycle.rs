// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::sync::Arc;

use op_nn::{estimate_pos_weight, BceWithLogits, Loss};
use op_pursuit::{
    BasisLibrary, CoefficientInit, Combiner, ConvBackbone, ConvBackboneConfig, DeeplabHead,
    Generator, GeneratorConfig, HeadConfig, JointNet, LatentStrategy, ObjectNet, ParameterSpec,
    PursuitSettings, ReplayRegularizer, SegmentationPipeline, WeightStrategy,
};
use op_tensor::{Device, Tensor};
use tempfile::tempdir;

const Z_DIM: usize = 3;

fn head() -> HeadConfig {
    HeadConfig {
        in_channels: 4,
        low_level_channels: 3,
        aspp_channels: 2,
        aspp_rates: vec![1, 2],
        low_level_reduced: 2,
        decoder_channels: 2,
        num_classes: 1,
    }
}

fn generator() -> Generator {
    let spec = Arc::new(ParameterSpec::deeplab_head(&head()).unwrap());
    let config = GeneratorConfig {
        z_dim: Z_DIM,
        seed: Some(11),
        ..GeneratorConfig::default()
    };
    Generator::new(spec, &config, Device::Cpu).unwrap()
}

fn pipeline() -> SegmentationPipeline {
    let config = ConvBackboneConfig {
        in_channels: 3,
        stem_channels: 4,
        low_level_channels: 3,
        mid_channels: 4,
        out_channels: 4,
    };
    let backbone = ConvBackbone::new(config, Some(12), Device::Cpu).unwrap();
    SegmentationPipeline::new(Box::new(backbone), DeeplabHead::new(head()).unwrap(), Device::Cpu)
        .unwrap()
}

fn image(seed: u64) -> Tensor {
    Tensor::random_uniform(&[1, 3, 16, 16], 0.0, 1.0, Some(seed)).unwrap()
}

fn mask() -> Tensor {
    Tensor::from_fn(&[1, 1, 16, 16], |idx| if idx % 16 < 5 { 1.0 } else { 0.0 }).unwrap()
}

#[test]
fn pretrain_then_pursue_a_new_object() {
    let settings = PursuitSettings {
        seed: Some(21),
        ..PursuitSettings::default()
    };
    assert!(settings.install_seed_policy().is_pinned());

    let dir = tempdir().unwrap();
    let memory = dir.path().join("memory");
    let bases = dir.path().join("bases");
    std::fs::create_dir_all(&memory).unwrap();
    std::fs::create_dir_all(&bases).unwrap();

    let pos_weight = estimate_pos_weight(&[mask()], 4, Some(1)).unwrap();
    let mut loss = BceWithLogits::with_pos_weight(pos_weight).unwrap();

    // Joint pretraining over three objects.
    let mut joint = JointNet::new(generator(), pipeline(), 3, Some(13)).unwrap();
    for step in 0..3 {
        let identity = step % 3;
        let prediction = joint.forward(&image(step as u64), identity).unwrap();
        let grad = loss.backward(&prediction.logits, &mask()).unwrap();
        joint.backward(&prediction, &grad).unwrap();
        joint.clip_gradients_value(1.0).unwrap();
        joint.apply_step(0.01).unwrap();
    }
    let archive = dir.path().join("codes.bin");
    joint.write_archive(&archive).unwrap();

    // Fit one object in latent space and keep it as a basis with weights.
    let mut object = ObjectNet::random(generator(), pipeline(), Some(14)).unwrap();
    let prediction = object.forward(&image(5)).unwrap();
    let before = loss.forward(&prediction.logits, &mask()).unwrap().data()[0];
    let grad = loss.backward(&prediction.logits, &mask()).unwrap();
    object.backward(&prediction, &grad).unwrap();
    object.apply_step(0.05).unwrap();
    assert!(before.is_finite());
    object.save_basis(bases.join("a.json")).unwrap();
    object.save_basis(memory.join("a.json")).unwrap();

    // The replay memory keeps a training generator near the saved basis.
    let mut replay = ReplayRegularizer::from_dir(&memory, Z_DIM, Device::Cpu, Some(15)).unwrap();
    let penalty = replay.penalty(joint.generator_mut(), 0.1).unwrap();
    assert_eq!(penalty.sampled, vec![0]);
    assert!(penalty.value.is_finite());

    // Both combiners run over the archive and the directory.
    let library = BasisLibrary::open(&archive, Z_DIM, Device::Cpu).unwrap();
    assert_eq!(library.len(), 3);
    let latent = Combiner::new(
        LatentStrategy::new(generator(), library).unwrap(),
        pipeline(),
        &CoefficientInit::Random { seed: Some(16) },
    )
    .unwrap();
    assert_eq!(latent.forward(&image(6)).unwrap().logits.shape(), &[1, 1, 16, 16]);

    let directory = BasisLibrary::open(&bases, Z_DIM, Device::Cpu).unwrap();
    let weight = Combiner::new(
        WeightStrategy::new(&directory, generator().spec().clone(), None).unwrap(),
        pipeline(),
        &CoefficientInit::Balanced,
    )
    .unwrap();
    let prediction = weight.forward(&image(7)).unwrap();
    assert!(prediction.logits.is_finite());
    let saved = dir.path().join("blend.json");
    weight.save_basis(&saved).unwrap();
    let restored = BasisLibrary::from_dir(dir.path(), Z_DIM, Device::Cpu).unwrap();
    assert_eq!(restored.len(), 1);
}
