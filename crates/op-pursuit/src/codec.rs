// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Conversions between weight mappings, flat vectors and code records.
//!
//! Flattening walks names in sorted order, so a [`FlatWeights`] layout is
//! reproducible across runs. Plain vectors are stored as bare JSON arrays
//! with the [`VECTOR_EXTENSION`] extension so they never collide with basis
//! files.

use crate::checkpoint::read_checkpoint;
use crate::error::{PursuitError, PursuitResult};
use crate::library::{basis_files, BasisRecord};
use op_nn::StateDict;
use op_tensor::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::info;

pub const VECTOR_EXTENSION: &str = "vec";

/// Names dropped before flattening.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionFilter {
    pub prefixes: Vec<String>,
    pub suffixes: Vec<String>,
}

impl ExclusionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffixes.push(suffix.into());
        self
    }

    /// Backbone tensors and batch-norm statistics.
    pub fn head_parameters() -> Self {
        Self::new()
            .with_prefix("backbone")
            .with_suffix("running_mean")
            .with_suffix("running_var")
            .with_suffix("num_batches_tracked")
    }

    pub fn excludes(&self, name: &str) -> bool {
        self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
            || self.suffixes.iter().any(|suffix| name.ends_with(suffix.as_str()))
    }
}

/// A weight mapping laid end to end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlatWeights {
    pub layout: Vec<(String, Vec<usize>)>,
    pub values: Vec<f32>,
}

impl FlatWeights {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub fn flatten(weights: &StateDict, filter: &ExclusionFilter) -> FlatWeights {
    let mut layout = Vec::new();
    let mut values = Vec::new();
    for (name, tensor) in weights {
        if filter.excludes(name) {
            continue;
        }
        layout.push((name.clone(), tensor.shape().to_vec()));
        values.extend_from_slice(tensor.data());
    }
    FlatWeights { layout, values }
}

pub fn unflatten(flat: &FlatWeights, device: Device) -> PursuitResult<StateDict> {
    let expected: usize = flat
        .layout
        .iter()
        .map(|(_, shape)| shape.iter().product::<usize>())
        .sum();
    if expected != flat.values.len() {
        return Err(PursuitError::ShapeMismatch {
            name: "flat weights".into(),
            expected: vec![expected],
            got: vec![flat.values.len()],
        });
    }
    let mut offset = 0;
    let mut out = StateDict::new();
    for (name, shape) in &flat.layout {
        let numel: usize = shape.iter().product();
        let tensor = Tensor::from_vec(shape, flat.values[offset..offset + numel].to_vec())?;
        out.insert(name.clone(), tensor.to_device(device));
        offset += numel;
    }
    Ok(out)
}

/// Single-key code record holding `values`.
pub fn wrap_code(values: &[f32]) -> PursuitResult<BasisRecord> {
    let z = Tensor::from_slice(values)?;
    Ok(BasisRecord::new(&z, None))
}

/// Code values of `record`. Only the code is read: stored weights and
/// coefficients are dropped, so `wrap_code(&unwrap_code(r))` reproduces `r`
/// only for code-only records.
pub fn unwrap_code(record: &BasisRecord) -> Vec<f32> {
    record.z.data.clone()
}

/// Flattens the checkpoint at `path`.
pub fn weight_vector(path: impl AsRef<Path>, filter: &ExclusionFilter) -> PursuitResult<FlatWeights> {
    Ok(flatten(&read_checkpoint(path)?, filter))
}

pub fn read_vector(path: impl AsRef<Path>) -> PursuitResult<Vec<f32>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| PursuitError::io(path, err))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| PursuitError::corrupt(path, err))
}

pub fn write_vector(path: impl AsRef<Path>, values: &[f32]) -> PursuitResult<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|err| PursuitError::io(path, err))?;
    serde_json::to_writer(BufWriter::new(file), values).map_err(|err| PursuitError::corrupt(path, err))
}

/// Writes the code of every basis file in `bases` to `out` as
/// `{stem}.vec`. Returns the written paths in basis order.
pub fn export_codes(bases: impl AsRef<Path>, out: impl AsRef<Path>) -> PursuitResult<Vec<PathBuf>> {
    let out = out.as_ref();
    std::fs::create_dir_all(out).map_err(|err| PursuitError::io(out, err))?;
    let mut written = Vec::new();
    for file in basis_files(bases)? {
        let record = BasisRecord::read(&file)?;
        let values = unwrap_code(&record);
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        info!(basis = %file.display(), norm, "exporting code");
        let stem = file
            .file_stem()
            .ok_or_else(|| PursuitError::corrupt(&file, "basis file has no stem"))?;
        let target = out.join(stem).with_extension(VECTOR_EXTENSION);
        write_vector(&target, &values)?;
        written.push(target);
    }
    Ok(written)
}

/// Reads a plain vector and writes it as a code record at `record`.
pub fn import_code(vector: impl AsRef<Path>, record: impl AsRef<Path>) -> PursuitResult<usize> {
    let values = read_vector(vector)?;
    wrap_code(&values)?.write(record)?;
    info!(len = values.len(), "code imported");
    Ok(values.len())
}
