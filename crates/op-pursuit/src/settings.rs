// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Typed `[pursuit]` section of the layered configuration.
//!
//! ```toml
//! [pursuit]
//! device = "cpu"
//! seed = 7
//! basis_source = "bases"
//!
//! [pursuit.generator]
//! z_dim = 100
//!
//! [pursuit.coefficients]
//! kind = "balanced"
//! ```

use crate::backbone::{ConvBackbone, ConvBackboneConfig};
use crate::batchnorm::{BatchNormLinearizer, EPSILON};
use crate::checkpoint::RenameTable;
use crate::combine::{CoefficientInit, Combiner, LatentCombiner, LatentStrategy, WeightCombiner, WeightStrategy};
use crate::error::{PursuitError, PursuitResult};
use crate::generator::{Generator, GeneratorConfig};
use crate::head::DeeplabHead;
use crate::library::BasisLibrary;
use crate::pipeline::SegmentationPipeline;
use crate::replay::ReplayRegularizer;
use crate::spec::{HeadConfig, ParameterSpec};
use op_config::determinism::{self, SeedPolicy};
use op_config::layered::{ConfigLayering, LayeredConfig};
use op_tensor::Device;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const SECTION: &str = "pursuit";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// Directory of basis files carrying ground-truth weights.
    pub source: Option<PathBuf>,
    pub coefficient: f32,
    pub seed: Option<u64>,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            source: None,
            coefficient: 0.01,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PursuitSettings {
    pub device: String,
    /// Base seed for every component without its own seed.
    pub seed: Option<u64>,
    pub generator: GeneratorConfig,
    pub head: HeadConfig,
    pub backbone: ConvBackboneConfig,
    pub backbone_seed: Option<u64>,
    /// Basis directory or code archive.
    pub basis_source: Option<PathBuf>,
    pub generator_checkpoint: Option<PathBuf>,
    pub backbone_checkpoint: Option<PathBuf>,
    pub coefficients: CoefficientInit,
    pub bn_epsilon: f32,
    pub replay: ReplaySettings,
}

impl Default for PursuitSettings {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            seed: None,
            generator: GeneratorConfig::default(),
            head: HeadConfig::default(),
            backbone: ConvBackboneConfig::default(),
            backbone_seed: None,
            basis_source: None,
            generator_checkpoint: None,
            backbone_checkpoint: None,
            coefficients: CoefficientInit::default(),
            bn_epsilon: EPSILON,
            replay: ReplaySettings::default(),
        }
    }
}

impl PursuitSettings {
    /// Reads the `[pursuit]` section; a missing section yields the defaults.
    pub fn from_layered(config: &LayeredConfig) -> PursuitResult<Self> {
        let settings = config
            .section::<Self>(&[SECTION])
            .map_err(|err| PursuitError::Invalid(format!("[{SECTION}] section: {err}")))?
            .unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    /// Discovers the standard layers and reads the section from them.
    pub fn discover() -> PursuitResult<Self> {
        let config = LayeredConfig::load(ConfigLayering::discover())
            .map_err(|err| PursuitError::Invalid(err.to_string()))?;
        for event in config.events() {
            info!(?event, "configuration layer applied");
        }
        Self::from_layered(&config)
    }

    /// Pins unseeded draws to `seed` when set. `PURSUIT_SEED` or an earlier
    /// install wins over the file.
    pub fn install_seed_policy(&self) -> SeedPolicy {
        let active = match self.seed {
            Some(seed) => determinism::install(SeedPolicy::Pinned(seed)),
            None => determinism::policy(),
        };
        info!(?active, "seed policy");
        active
    }

    pub fn validate(&self) -> PursuitResult<()> {
        self.device()?;
        self.head.validate()?;
        if self.generator.z_dim == 0 {
            return Err(PursuitError::Invalid("z_dim must be positive".into()));
        }
        if self.backbone.out_channels != self.head.in_channels
            || self.backbone.low_level_channels != self.head.low_level_channels
        {
            return Err(PursuitError::Invalid(
                "backbone channel widths disagree with the head layout".into(),
            ));
        }
        if !(self.replay.coefficient.is_finite() && self.replay.coefficient >= 0.0) {
            return Err(PursuitError::Invalid(
                "replay coefficient must be finite and non-negative".into(),
            ));
        }
        BatchNormLinearizer::new(self.bn_epsilon)?;
        Ok(())
    }

    pub fn device(&self) -> PursuitResult<Device> {
        self.device
            .parse()
            .map_err(|err| PursuitError::Invalid(format!("device '{}': {err}", self.device)))
    }

    pub fn parameter_spec(&self) -> PursuitResult<Arc<ParameterSpec>> {
        Ok(Arc::new(ParameterSpec::deeplab_head(&self.head)?))
    }

    /// Generator with the configured checkpoint applied, if any.
    pub fn build_generator(&self) -> PursuitResult<Generator> {
        let mut generator = Generator::new(self.parameter_spec()?, &self.generator, self.device()?)?;
        if let Some(path) = &self.generator_checkpoint {
            generator.load_checkpoint(path, &RenameTable::generator())?;
        }
        Ok(generator)
    }

    pub fn build_pipeline(&self) -> PursuitResult<SegmentationPipeline> {
        let device = self.device()?;
        let mut backbone = ConvBackbone::new(self.backbone.clone(), self.backbone_seed, device)?;
        if let Some(path) = &self.backbone_checkpoint {
            backbone.load_checkpoint(path, &RenameTable::backbone())?;
        }
        SegmentationPipeline::new(Box::new(backbone), DeeplabHead::new(self.head.clone())?, device)
    }

    fn library(&self) -> PursuitResult<BasisLibrary> {
        let source = self
            .basis_source
            .as_ref()
            .ok_or_else(|| PursuitError::Invalid("basis_source is not configured".into()))?;
        BasisLibrary::open(source, self.generator.z_dim, self.device()?)
    }

    pub fn latent_combiner(&self) -> PursuitResult<LatentCombiner> {
        let strategy = LatentStrategy::new(self.build_generator()?, self.library()?)?
            .with_linearizer(BatchNormLinearizer::new(self.bn_epsilon)?);
        Combiner::new(strategy, self.build_pipeline()?, &self.coefficients)
    }

    pub fn weight_combiner(&self) -> PursuitResult<WeightCombiner> {
        let generator = self.build_generator()?;
        let strategy = WeightStrategy::with_linearizer(
            &self.library()?,
            generator.spec().clone(),
            Some(&generator),
            BatchNormLinearizer::new(self.bn_epsilon)?,
        )?;
        Combiner::new(strategy, self.build_pipeline()?, &self.coefficients)
    }

    pub fn replay(&self) -> PursuitResult<ReplayRegularizer> {
        let source = self
            .replay
            .source
            .as_ref()
            .ok_or_else(|| PursuitError::Invalid("replay.source is not configured".into()))?;
        ReplayRegularizer::from_dir(source, self.generator.z_dim, self.device()?, self.replay.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn section_overrides_defaults() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.toml");
        fs::write(
            &base,
            r#"
[pursuit]
device = "cpu"
seed = 5
basis_source = "bases"

[pursuit.generator]
z_dim = 8

[pursuit.coefficients]
kind = "random"
seed = 3
"#,
        )
        .unwrap();
        let config = LayeredConfig::load(ConfigLayering::default().with_base(&base)).unwrap();
        let settings = PursuitSettings::from_layered(&config).unwrap();
        assert_eq!(settings.generator.z_dim, 8);
        assert_eq!(settings.seed, Some(5));
        assert_eq!(settings.basis_source, Some(PathBuf::from("bases")));
        assert_eq!(settings.coefficients, CoefficientInit::Random { seed: Some(3) });
        assert_eq!(settings.head, HeadConfig::default());
    }

    #[test]
    fn unknown_device_is_rejected() {
        let settings = PursuitSettings {
            device: "tpu".into(),
            ..PursuitSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn mismatched_backbone_is_rejected() {
        let mut settings = PursuitSettings::default();
        settings.backbone.out_channels = 7;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn combiners_need_a_basis_source() {
        let settings = PursuitSettings::default();
        assert!(settings.latent_combiner().is_err());
    }
}
