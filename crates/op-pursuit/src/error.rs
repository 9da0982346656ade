// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use op_tensor::{Device, TensorError};
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification used by callers deciding how to report a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Inputs, files or layouts disagree with what was configured.
    Configuration,
    /// Filesystem access or (de)serialisation failed.
    Io,
    /// A loss or gradient left the finite range.
    Numeric,
}

#[derive(Debug, Error)]
pub enum PursuitError {
    #[error("latent code has length {got}, expected {expected}")]
    LatentDimension { expected: usize, got: usize },
    #[error("parameter '{name}' is not part of the head layout")]
    UnknownParameter { name: String },
    #[error("parameter '{name}' is missing")]
    MissingParameter { name: String },
    #[error("parameter '{name}' has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("basis library at {location} holds no entries")]
    EmptyLibrary { location: String },
    #[error("{coefficients} coefficients supplied for {bases} bases")]
    CoefficientMismatch { bases: usize, coefficients: usize },
    #[error("parameter '{name}' belongs to neither the backbone, aspp nor decoder group")]
    UnexpectedParameter { name: String },
    #[error("tensor placed on {got} but {expected} was configured")]
    DeviceMismatch { expected: Device, got: Device },
    #[error("checkpoint key '{key}' is not recognised")]
    UnmappedKey { key: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("{operation} requires a trainable generator")]
    FrozenGenerator { operation: &'static str },
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?} is not a valid record: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("non-finite {label}: {value}")]
    NonFinite { label: String, value: f32 },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl PursuitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PursuitError::Io { .. } | PursuitError::Corrupt { .. } => ErrorKind::Io,
            PursuitError::NonFinite { .. } => ErrorKind::Numeric,
            PursuitError::Tensor(err) => match err {
                TensorError::NonFiniteValue { .. } => ErrorKind::Numeric,
                TensorError::IoError { .. } | TensorError::SerializationError { .. } => {
                    ErrorKind::Io
                }
                _ => ErrorKind::Configuration,
            },
            _ => ErrorKind::Configuration,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PursuitError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PursuitError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type PursuitResult<T> = Result<T, PursuitError>;

/// Fails with [`PursuitError::DeviceMismatch`] unless `got == expected`.
pub(crate) fn ensure_device(expected: Device, got: Device) -> PursuitResult<()> {
    if expected != got {
        return Err(PursuitError::DeviceMismatch { expected, got });
    }
    Ok(())
}

/// Rejects a non-finite scalar with a numeric error.
pub(crate) fn ensure_finite(label: &str, value: f32) -> PursuitResult<f32> {
    if !value.is_finite() {
        return Err(PursuitError::NonFinite {
            label: label.to_string(),
            value,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        let config = PursuitError::CoefficientMismatch {
            bases: 3,
            coefficients: 2,
        };
        assert_eq!(config.kind(), ErrorKind::Configuration);
        let io = PursuitError::io("x", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(io.kind(), ErrorKind::Io);
        let numeric: PursuitError = TensorError::NonFiniteValue {
            label: "loss",
            value: f32::NAN,
        }
        .into();
        assert_eq!(numeric.kind(), ErrorKind::Numeric);
        let device: PursuitError = TensorError::DeviceMismatch {
            expected: Device::Cpu,
            got: Device::Cuda(0),
        }
        .into();
        assert_eq!(device.kind(), ErrorKind::Configuration);
        assert!(ensure_finite("penalty", f32::INFINITY).is_err());
    }
}
