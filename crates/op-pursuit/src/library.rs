// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Ordered collection of learned object bases.
//!
//! Insertion order is acquisition order and doubles as the coefficient index
//! space of every combiner built over the library. A library is read from a
//! directory of `.json` basis files (sorted by file name) or from a single
//! bincode archive holding a `[n, z_dim]` code table.

use crate::error::{ensure_device, PursuitError, PursuitResult};
use op_nn::{StateDict, StoredTensor};
use op_tensor::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const BASIS_EXTENSION: &str = "json";

/// On-disk form of one basis: its code and, optionally, the weights it
/// decodes to. Saved combiners also record the coefficients that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasisRecord {
    pub z: StoredTensor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<BTreeMap<String, StoredTensor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coefficients: Option<StoredTensor>,
}

impl BasisRecord {
    pub fn new(z: &Tensor, weights: Option<&StateDict>) -> Self {
        Self {
            z: StoredTensor::from_tensor(z),
            weights: weights.map(|map| {
                map.iter()
                    .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
                    .collect()
            }),
            coefficients: None,
        }
    }

    pub fn with_coefficients(mut self, coefficients: &Tensor) -> Self {
        self.coefficients = Some(StoredTensor::from_tensor(coefficients));
        self
    }

    pub fn read(path: impl AsRef<Path>) -> PursuitResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| PursuitError::io(path, err))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| PursuitError::corrupt(path, err))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> PursuitResult<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|err| PursuitError::io(path, err))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|err| PursuitError::corrupt(path, err))
    }

    pub fn z_tensor(&self, device: Device) -> PursuitResult<Tensor> {
        Ok(self.z.clone().into_tensor()?.to_device(device))
    }

    pub fn weight_map(&self, device: Device) -> PursuitResult<Option<StateDict>> {
        let Some(weights) = &self.weights else {
            return Ok(None);
        };
        let mut map = StateDict::new();
        for (name, stored) in weights {
            map.insert(name.clone(), stored.clone().into_tensor()?.to_device(device));
        }
        Ok(Some(map))
    }

    pub fn coefficient_tensor(&self, device: Device) -> PursuitResult<Option<Tensor>> {
        self.coefficients
            .as_ref()
            .map(|stored| Ok(stored.clone().into_tensor()?.to_device(device)))
            .transpose()
    }
}

/// Bincode archive holding a batch of codes, one row per basis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasisArchive {
    pub z: StoredTensor,
}

impl BasisArchive {
    pub fn from_codes(codes: &[&Tensor]) -> PursuitResult<Self> {
        let rows: Vec<Tensor> = codes
            .iter()
            .map(|code| code.reshape(&[code.numel()]))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            z: StoredTensor::from_tensor(&Tensor::stack(&rows)?),
        })
    }

    pub fn read(path: impl AsRef<Path>) -> PursuitResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| PursuitError::io(path, err))?;
        bincode::deserialize_from(BufReader::new(file)).map_err(|err| PursuitError::corrupt(path, err))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> PursuitResult<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|err| PursuitError::io(path, err))?;
        bincode::serialize_into(BufWriter::new(file), self).map_err(|err| PursuitError::corrupt(path, err))
    }
}

/// One learned object: its latent code and optional decoded weights.
#[derive(Clone, Debug, PartialEq)]
pub struct BasisEntry {
    name: String,
    z: Tensor,
    weights: Option<StateDict>,
}

impl BasisEntry {
    pub fn new(name: impl Into<String>, z: Tensor, weights: Option<StateDict>) -> Self {
        Self {
            name: name.into(),
            z,
            weights,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn z(&self) -> &Tensor {
        &self.z
    }

    pub fn weights(&self) -> Option<&StateDict> {
        self.weights.as_ref()
    }

    pub fn to_record(&self) -> BasisRecord {
        BasisRecord::new(&self.z, self.weights.as_ref())
    }
}

/// Lists `*.json` files of `dir` sorted by file name.
pub fn basis_files(dir: impl AsRef<Path>) -> PursuitResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for item in fs::read_dir(dir).map_err(|err| PursuitError::io(dir, err))? {
        let path = item.map_err(|err| PursuitError::io(dir, err))?.path();
        if path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some(BASIS_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_string()
}

#[derive(Clone, Debug)]
pub struct BasisLibrary {
    entries: Vec<BasisEntry>,
    z_dim: usize,
    device: Device,
    location: String,
}

impl BasisLibrary {
    /// Builds a library from in-memory entries. Fails on an empty list or a
    /// code of the wrong length.
    pub fn from_entries(
        entries: Vec<BasisEntry>,
        z_dim: usize,
        device: Device,
    ) -> PursuitResult<Self> {
        let mut library = Self {
            entries: Vec::with_capacity(entries.len()),
            z_dim,
            device,
            location: "<memory>".to_string(),
        };
        for entry in entries {
            library.push(entry)?;
        }
        library.ensure_not_empty()?;
        Ok(library)
    }

    /// Loads every `.json` basis file of `dir`, in sorted file-name order.
    pub fn from_dir(dir: impl AsRef<Path>, z_dim: usize, device: Device) -> PursuitResult<Self> {
        let dir = dir.as_ref();
        let files = basis_files(dir)?;
        info!(dir = %dir.display(), files = files.len(), "discovered basis files");
        let mut library = Self {
            entries: Vec::with_capacity(files.len()),
            z_dim,
            device,
            location: dir.display().to_string(),
        };
        for file in &files {
            let record = BasisRecord::read(file)?;
            let entry = BasisEntry::new(
                file_stem(file),
                record.z_tensor(device)?,
                record.weight_map(device)?,
            );
            library.push(entry)?;
            debug!(file = %file.display(), "basis loaded");
        }
        library.ensure_not_empty()?;
        Ok(library)
    }

    /// Loads the `[n, z_dim]` code table of a bincode archive.
    pub fn from_archive(path: impl AsRef<Path>, z_dim: usize, device: Device) -> PursuitResult<Self> {
        let path = path.as_ref();
        let archive = BasisArchive::read(path)?;
        let table = archive.z.into_tensor()?;
        if table.dims() != 2 {
            return Err(PursuitError::corrupt(
                path,
                format!("code table must be rank 2, found shape {:?}", table.shape()),
            ));
        }
        let mut library = Self {
            entries: Vec::with_capacity(table.shape()[0]),
            z_dim,
            device,
            location: path.display().to_string(),
        };
        for row in 0..table.shape()[0] {
            let z = table.select(row)?.to_device(device);
            library.push(BasisEntry::new(format!("{row}"), z, None))?;
        }
        info!(archive = %path.display(), bases = library.len(), "loaded basis archive");
        library.ensure_not_empty()?;
        Ok(library)
    }

    /// Directory → [`BasisLibrary::from_dir`], file → archive.
    pub fn open(path: impl AsRef<Path>, z_dim: usize, device: Device) -> PursuitResult<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            Self::from_dir(path, z_dim, device)
        } else if path.is_file() {
            Self::from_archive(path, z_dim, device)
        } else {
            Err(PursuitError::io(
                path,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ))
        }
    }

    fn ensure_not_empty(&self) -> PursuitResult<()> {
        if self.entries.is_empty() {
            return Err(PursuitError::EmptyLibrary {
                location: self.location.clone(),
            });
        }
        Ok(())
    }

    /// Appends a basis; its code must have `z_dim` elements on the library's
    /// device.
    pub fn push(&mut self, entry: BasisEntry) -> PursuitResult<()> {
        if entry.z.numel() != self.z_dim {
            return Err(PursuitError::LatentDimension {
                expected: self.z_dim,
                got: entry.z.numel(),
            });
        }
        ensure_device(self.device, entry.z.device())?;
        if let Some(weights) = &entry.weights {
            for tensor in weights.values() {
                ensure_device(self.device, tensor.device())?;
            }
        }
        let z = entry.z.reshape(&[self.z_dim])?;
        self.entries.push(BasisEntry { z, ..entry });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn z_dim(&self) -> usize {
        self.z_dim
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn entries(&self) -> &[BasisEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&BasisEntry> {
        self.entries.get(index)
    }

    pub fn codes(&self) -> Vec<&Tensor> {
        self.entries.iter().map(|entry| &entry.z).collect()
    }

    /// Writes every code into one bincode archive.
    pub fn write_archive(&self, path: impl AsRef<Path>) -> PursuitResult<()> {
        BasisArchive::from_codes(&self.codes())?.write(path)
    }
}
