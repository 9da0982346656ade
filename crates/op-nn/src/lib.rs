// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Neural building blocks for object pursuit.
//!
//! Layers own [`Parameter`]s and accumulate Euclidean gradients through an
//! explicit `backward`. The [`functional`] ops take their weights as
//! arguments instead, which is what lets a generator supply every tensor of a
//! segmentation head at call time.

pub mod functional;
pub mod io;
pub mod layers;
pub mod loss;
pub mod module;

pub use io::{
    load_bincode, load_json, load_state_dict_bincode, load_state_dict_json, save_bincode,
    save_json, save_state_dict_bincode, save_state_dict_json, StoredTensor,
};
pub use layers::linear::Linear;
pub use loss::{estimate_pos_weight, BceWithLogits, Loss};
pub use module::{Module, Parameter, StateDict};

pub use op_tensor::{Device, PureResult, Tensor, TensorError};
