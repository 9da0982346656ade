// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Placement tag carried by every tensor.
///
/// All arithmetic runs on the host; the tag records which compute device a
/// tensor is assigned to so that a forward pass can refuse to mix placements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Wgpu(usize),
}

impl Device {
    /// Returns `true` for host placement.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Device::Wgpu(ordinal) => write!(f, "wgpu:{ordinal}"),
        }
    }
}

/// Error returned when a device string cannot be parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseDeviceError {
    raw: String,
}

impl fmt::Display for ParseDeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unrecognised device '{}'; expected cpu, cuda[:N] or wgpu[:N]",
            self.raw
        )
    }
}

impl std::error::Error for ParseDeviceError {}

impl FromStr for Device {
    type Err = ParseDeviceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim().to_ascii_lowercase();
        let (kind, ordinal) = match trimmed.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| ParseDeviceError {
                    raw: raw.to_string(),
                })?;
                (kind.to_string(), ordinal)
            }
            None => (trimmed.clone(), 0),
        };
        match kind.as_str() {
            "cpu" if !trimmed.contains(':') => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(ordinal)),
            "wgpu" => Ok(Device::Wgpu(ordinal)),
            _ => Err(ParseDeviceError {
                raw: raw.to_string(),
            }),
        }
    }
}
