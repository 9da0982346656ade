// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Flat name → tensor checkpoints and the prefix rename tables applied when
//! they are restored into a module.

use crate::error::{PursuitError, PursuitResult};
use op_nn::{io, Module, StateDict};
use op_tensor::{Device, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

/// What to do with a checkpoint key that no rule or parameter accounts for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownKeyPolicy {
    #[default]
    Warn,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRule {
    pub from: String,
    pub to: String,
}

/// Ordered prefix rewrites. The first rule whose `from` prefixes a key wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameTable {
    pub version: u32,
    pub rules: Vec<RenameRule>,
    #[serde(default)]
    pub policy: UnknownKeyPolicy,
}

/// Outcome of restoring a checkpoint into a module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub ignored: Vec<String>,
    /// Module parameters the checkpoint did not provide.
    pub untouched: Vec<String>,
}

impl RenameTable {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            rules: Vec::new(),
            policy: UnknownKeyPolicy::default(),
        }
    }

    pub fn with_rule(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rules.push(RenameRule {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn with_policy(mut self, policy: UnknownKeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Generator checkpoints: `hypernet.` is stripped, `blocks.` kept.
    pub fn generator() -> Self {
        Self::new(1)
            .with_rule("hypernet.", "")
            .with_rule("blocks.", "blocks.")
    }

    /// Backbone checkpoints: `backbone.` and `module.` are stripped.
    pub fn backbone() -> Self {
        Self::new(1).with_rule("backbone.", "").with_rule("module.", "")
    }

    /// Identity table that accepts every key as-is.
    pub fn passthrough() -> Self {
        Self::new(1).with_rule("", "")
    }

    pub fn rename(&self, key: &str) -> Option<String> {
        self.rules.iter().find_map(|rule| {
            key.strip_prefix(rule.from.as_str())
                .map(|rest| format!("{}{rest}", rule.to))
        })
    }

    fn unknown(&self, key: &str, reason: &str) -> PursuitResult<()> {
        match self.policy {
            UnknownKeyPolicy::Warn => {
                warn!(key, reason, "ignoring checkpoint key");
                Ok(())
            }
            UnknownKeyPolicy::Reject => Err(PursuitError::UnmappedKey {
                key: key.to_string(),
            }),
        }
    }

    /// Renames every key of `state`, dropping (or rejecting) those that match
    /// no rule. Returns the renamed dictionary and the dropped keys.
    pub fn apply(&self, state: StateDict) -> PursuitResult<(StateDict, Vec<String>)> {
        let mut mapped = StateDict::new();
        let mut ignored = Vec::new();
        for (key, tensor) in state {
            match self.rename(&key) {
                Some(renamed) => {
                    mapped.insert(renamed, tensor);
                }
                None => {
                    self.unknown(&key, "no rename rule")?;
                    ignored.push(key);
                }
            }
        }
        Ok((mapped, ignored))
    }

    /// Partially restores `module` from `state`: parameters present after
    /// renaming are assigned (shapes must match), parameters absent from the
    /// checkpoint keep their values, and leftover keys follow the policy.
    pub fn restore<M: Module + ?Sized>(
        &self,
        module: &mut M,
        state: StateDict,
        device: Device,
    ) -> PursuitResult<LoadReport> {
        let (mapped, mut ignored) = self.apply(state)?;
        let mut report = LoadReport::default();
        let mut consumed = BTreeSet::new();
        module.visit_parameters_mut(&mut |param| {
            match mapped.get(param.name()) {
                Some(tensor) => {
                    if tensor.shape() != param.value().shape() {
                        return Err(TensorError::ShapeMismatch {
                            left: param.value().shape().to_vec(),
                            right: tensor.shape().to_vec(),
                        });
                    }
                    param.load_value(&tensor.clone().to_device(device))?;
                    consumed.insert(param.name().to_string());
                    report.loaded.push(param.name().to_string());
                }
                None => report.untouched.push(param.name().to_string()),
            }
            Ok(())
        })?;
        for key in mapped.keys().filter(|key| !consumed.contains(*key)) {
            self.unknown(key, "no matching parameter")?;
            ignored.push(key.clone());
        }
        debug!(
            loaded = report.loaded.len(),
            ignored = ignored.len(),
            untouched = report.untouched.len(),
            "checkpoint restored"
        );
        report.ignored = ignored;
        Ok(report)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("json")
}

fn map_tensor_io(path: &Path, err: TensorError) -> PursuitError {
    match err {
        TensorError::IoError { message } => PursuitError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::Other, message),
        ),
        TensorError::SerializationError { message } => PursuitError::corrupt(path, message),
        other => other.into(),
    }
}

/// Reads a checkpoint; `.json` files are JSON, everything else bincode.
pub fn read_checkpoint(path: impl AsRef<Path>) -> PursuitResult<StateDict> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PursuitError::io(
            path,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ));
    }
    let state = if is_json(path) {
        io::load_state_dict_json(path)
    } else {
        io::load_state_dict_bincode(path)
    };
    state.map_err(|err| map_tensor_io(path, err))
}

pub fn write_checkpoint(path: impl AsRef<Path>, state: &StateDict) -> PursuitResult<()> {
    let path = path.as_ref();
    let written = if is_json(path) {
        io::save_state_dict_json(state, path)
    } else {
        io::save_state_dict_bincode(state, path)
    };
    written.map_err(|err| map_tensor_io(path, err))
}

/// Parameter names and shapes, in name order.
pub fn describe(state: &StateDict) -> Vec<(String, Vec<usize>)> {
    state
        .iter()
        .map(|(name, tensor)| (name.clone(), tensor.shape().to_vec()))
        .collect()
}
