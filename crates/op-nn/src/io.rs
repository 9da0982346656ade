// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, StateDict};
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Serialisable form of a tensor. Device placement is not persisted; callers
/// move restored tensors onto their configured device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl StoredTensor {
    pub fn from_tensor(tensor: &Tensor) -> StoredTensor {
        StoredTensor {
            shape: tensor.shape().to_vec(),
            data: tensor.data().to_vec(),
        }
    }

    pub fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(&self.shape, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: BTreeMap<String, StoredTensor>,
}

fn snapshot_from_state(state: &StateDict) -> ModuleSnapshot {
    let parameters = state
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect();
    ModuleSnapshot { parameters }
}

fn from_snapshot(snapshot: ModuleSnapshot) -> PureResult<StateDict> {
    let mut state = StateDict::new();
    for (name, tensor) in snapshot.parameters.into_iter() {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

pub fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

pub fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Writes any serialisable record as pretty JSON.
pub fn write_json<T: Serialize, P: AsRef<Path>>(record: &T, path: P) -> PureResult<()> {
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, record).map_err(serde_error)
}

/// Reads a JSON record.
pub fn read_json<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> PureResult<T> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(serde_error)
}

/// Writes any serialisable record with bincode.
pub fn write_bincode<T: Serialize, P: AsRef<Path>>(record: &T, path: P) -> PureResult<()> {
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, record).map_err(serde_error)
}

/// Reads a bincode record.
pub fn read_bincode<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> PureResult<T> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    bincode::deserialize_from(reader).map_err(serde_error)
}

pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_json(&module.state_dict()?, path)
}

pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let state = load_state_dict_json(path)?;
    module.load_state_dict(&state)
}

pub fn save_state_dict_json<P: AsRef<Path>>(state: &StateDict, path: P) -> PureResult<()> {
    write_json(&snapshot_from_state(state), path)
}

pub fn load_state_dict_json<P: AsRef<Path>>(path: P) -> PureResult<StateDict> {
    from_snapshot(read_json(path)?)
}

pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_bincode(&module.state_dict()?, path)
}

pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let state = load_state_dict_bincode(path)?;
    module.load_state_dict(&state)
}

pub fn save_state_dict_bincode<P: AsRef<Path>>(state: &StateDict, path: P) -> PureResult<()> {
    write_bincode(&snapshot_from_state(state), path)
}

pub fn load_state_dict_bincode<P: AsRef<Path>>(path: P) -> PureResult<StateDict> {
    from_snapshot(read_bincode(path)?)
}
