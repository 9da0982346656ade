// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Basis-combination and weight-synthesis engine for object pursuit.
//!
//! Objects live as codes in a shared latent space. A [`Generator`] decodes a
//! code into every tensor of an ASPP + decoder segmentation head, a
//! [`BasisLibrary`] keeps the codes learned so far, and a [`Combiner`]
//! expresses a new object as a linear combination of them, either in latent
//! space ([`LatentStrategy`]) or directly in weight space
//! ([`WeightStrategy`]). Weight-space blending relies on the
//! [`BatchNormLinearizer`] folding batch-norm statistics into affine pairs.
//! While the generator itself trains, a [`ReplayRegularizer`] keeps it close
//! to the weights it produced for earlier bases.

pub mod backbone;
pub mod batchnorm;
pub mod checkpoint;
pub mod codec;
pub mod combine;
pub mod error;
pub mod generator;
pub mod head;
pub mod joint;
pub mod library;
pub mod object;
pub mod pipeline;
pub mod replay;
pub mod settings;
pub mod spec;

pub use backbone::{Backbone, BackboneFeatures, ConvBackbone, ConvBackboneConfig};
pub use batchnorm::{BatchNormLinearizer, LinearizedBn};
pub use checkpoint::{LoadReport, RenameTable, UnknownKeyPolicy};
pub use codec::{ExclusionFilter, FlatWeights};
pub use combine::{
    Blend, CoefficientInit, CombinationStrategy, Combiner, LatentCombiner, LatentStrategy,
    Prediction, WeightCombiner, WeightStrategy,
};
pub use error::{ErrorKind, PursuitError, PursuitResult};
pub use generator::{Generator, GeneratorConfig};
pub use head::{DeeplabHead, HeadWeights};
pub use joint::JointNet;
pub use library::{BasisArchive, BasisEntry, BasisLibrary, BasisRecord};
pub use object::ObjectNet;
pub use pipeline::SegmentationPipeline;
pub use replay::{ReplayPenalty, ReplayRegularizer};
pub use settings::PursuitSettings;
pub use spec::{HeadConfig, ParamEntry, ParamRole, ParameterSpec};
