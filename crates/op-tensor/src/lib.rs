// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// crates/op-tensor/src/lib.rs
pub mod device;
pub mod pure;

pub use device::Device;
pub use pure::{PureResult, Tensor, TensorError};
