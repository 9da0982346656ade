// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense row-major tensors with an arbitrary number of axes.
//!
//! Every tensor carries a [`Device`] tag. Binary operators refuse to combine
//! tensors placed on different devices instead of silently moving data.

use crate::device::Device;
use core::fmt;
use op_config::determinism;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use std::error::Error;

/// Result alias used throughout the pure tensor stack.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an empty or zero-sized shape.
    InvalidDimensions { shape: Vec<usize> },
    /// Data provided to a constructor does not match the tensor volume.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    /// Two tensors touching the same computation live on different devices.
    DeviceMismatch { expected: Device, got: Device },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when (de)serialising tensors.
    SerializationError { message: String },
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    NonFiniteValue { label: &'static str, value: f32 },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { shape } => {
                write!(
                    f,
                    "invalid tensor dimensions {shape:?}; every axis must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::DeviceMismatch { expected, got } => {
                write!(f, "device mismatch: expected {expected}, got {got}")
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "parameter '{name}' was not present in the state dict")
            }
            TensorError::IoError { message } => write!(f, "i/o error: {message}"),
            TensorError::SerializationError { message } => {
                write!(f, "serialization error: {message}")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "{label} produced a non-finite value ({value})")
            }
            TensorError::InvalidValue { label } => write!(f, "invalid value for {label}"),
        }
    }
}

impl Error for TensorError {}

fn volume(shape: &[usize]) -> PureResult<usize> {
    if shape.is_empty() || shape.iter().any(|&axis| axis == 0) {
        return Err(TensorError::InvalidDimensions {
            shape: shape.to_vec(),
        });
    }
    Ok(shape.iter().product())
}

/// Dense `f32` tensor stored in row-major order.
#[derive(Clone, Debug)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
    device: Device,
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.device == other.device && self.data == other.data
    }
}

impl Tensor {
    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    /// Create a host tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> PureResult<Self> {
        Self::full(shape, 0.0)
    }

    /// Create a host tensor where every element equals `value`.
    pub fn full(shape: &[usize], value: f32) -> PureResult<Self> {
        let len = volume(shape)?;
        Ok(Self {
            data: vec![value; len],
            shape: shape.to_vec(),
            device: Device::Cpu,
        })
    }

    /// Create a host tensor from raw data. The provided vector must match the
    /// volume of `shape`.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> PureResult<Self> {
        let expected = volume(shape)?;
        if data.len() != expected {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
            device: Device::Cpu,
        })
    }

    /// One-dimensional tensor holding a copy of `values`.
    pub fn from_slice(values: &[f32]) -> PureResult<Self> {
        Self::from_vec(&[values.len()], values.to_vec())
    }

    /// Single-element tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            data: vec![value],
            shape: vec![1],
            device: Device::Cpu,
        }
    }

    /// Construct a tensor by applying a generator function to each flat index.
    pub fn from_fn<F>(shape: &[usize], mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize) -> f32,
    {
        let len = volume(shape)?;
        let data = (0..len).map(&mut f).collect();
        Ok(Self {
            data,
            shape: shape.to_vec(),
            device: Device::Cpu,
        })
    }

    /// Sample every element from `N(mean, std²)`.
    pub fn random_normal(shape: &[usize], mean: f32, std: f32, seed: Option<u64>) -> PureResult<Self> {
        if std <= 0.0 || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let len = volume(shape)?;
        let mut rng = Self::seedable_rng(seed, "op-tensor/tensor/normal");
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            let sample: f64 = StandardNormal.sample(&mut rng);
            data.push(mean + std * sample as f32);
        }
        Self::from_vec(shape, data)
    }

    /// Sample every element uniformly from `[low, high)`.
    pub fn random_uniform(shape: &[usize], low: f32, high: f32, seed: Option<u64>) -> PureResult<Self> {
        if low >= high || !low.is_finite() || !high.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let len = volume(shape)?;
        let mut rng = Self::seedable_rng(seed, "op-tensor/tensor/uniform");
        let dist = Uniform::new(low, high);
        let data = (0..len).map(|_| dist.sample(&mut rng)).collect();
        Self::from_vec(shape, data)
    }

    /// Stacks equally shaped tensors along a new leading axis.
    pub fn stack(tensors: &[Tensor]) -> PureResult<Self> {
        let first = tensors.first().ok_or(TensorError::EmptyInput("stack"))?;
        let mut data = Vec::with_capacity(first.numel() * tensors.len());
        for tensor in tensors {
            first.ensure_compatible(tensor)?;
            data.extend_from_slice(tensor.data());
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(tensors.len());
        shape.extend_from_slice(&first.shape);
        Ok(Self::from_vec(&shape, data)?.to_device(first.device))
    }

    /// Returns the `index`-th slice along the leading axis.
    pub fn select(&self, index: usize) -> PureResult<Self> {
        let leading = self.shape[0];
        if index >= leading {
            return Err(TensorError::InvalidValue {
                label: "select_index",
            });
        }
        let inner: Vec<usize> = if self.shape.len() == 1 {
            vec![1]
        } else {
            self.shape[1..].to_vec()
        };
        let span: usize = inner.iter().product();
        let data = self.data[index * span..(index + 1) * span].to_vec();
        Ok(Self::from_vec(&inner, data)?.to_device(self.device))
    }

    /// Returns the tensor shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of axes.
    pub fn dims(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Returns the device the tensor is assigned to.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Moves the tensor to `device`.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Fails unless the tensor lives on `device`.
    pub fn ensure_device(&self, device: Device) -> PureResult<()> {
        if self.device != device {
            return Err(TensorError::DeviceMismatch {
                expected: device,
                got: self.device,
            });
        }
        Ok(())
    }

    /// Read-only view of the flat data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the flat data.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consumes the tensor and returns its flat data.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Returns a copy with a new shape of identical volume.
    pub fn reshape(&self, shape: &[usize]) -> PureResult<Self> {
        let expected = volume(shape)?;
        if expected != self.numel() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: shape.to_vec(),
            });
        }
        Ok(Self {
            data: self.data.clone(),
            shape: shape.to_vec(),
            device: self.device,
        })
    }

    /// Fails unless `other` has the same shape and device.
    pub fn ensure_compatible(&self, other: &Tensor) -> PureResult<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        other.ensure_device(self.device)
    }

    /// In-place `self += alpha * other`.
    pub fn add_scaled(&mut self, other: &Tensor, alpha: f32) -> PureResult<()> {
        self.ensure_compatible(other)?;
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += alpha * src;
        }
        Ok(())
    }

    /// Returns `alpha * self`.
    pub fn scale(&self, alpha: f32) -> Self {
        let mut out = self.clone();
        for value in out.data.iter_mut() {
            *value *= alpha;
        }
        out
    }

    fn zip_map(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> PureResult<Self> {
        self.ensure_compatible(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Self {
            data,
            shape: self.shape.clone(),
            device: self.device,
        })
    }

    /// Element-wise sum.
    pub fn add(&self, other: &Tensor) -> PureResult<Self> {
        self.zip_map(other, |a, b| a + b)
    }

    /// Element-wise difference.
    pub fn sub(&self, other: &Tensor) -> PureResult<Self> {
        self.zip_map(other, |a, b| a - b)
    }

    /// Element-wise product.
    pub fn mul(&self, other: &Tensor) -> PureResult<Self> {
        self.zip_map(other, |a, b| a * b)
    }

    /// Applies `f` to every element.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            data: self.data.iter().map(|&v| f(v)).collect(),
            shape: self.shape.clone(),
            device: self.device,
        }
    }

    /// Flat inner product.
    pub fn dot(&self, other: &Tensor) -> PureResult<f32> {
        self.ensure_compatible(other)?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .sum())
    }

    /// Sum of squared elements.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Euclidean norm over all elements.
    pub fn l2_norm(&self) -> f32 {
        self.squared_l2_norm().sqrt()
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    /// Largest absolute element-wise difference.
    pub fn max_abs_diff(&self, other: &Tensor) -> PureResult<f32> {
        self.ensure_compatible(other)?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max))
    }

    /// Returns `true` when no element is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Fails on the first non-finite element.
    pub fn ensure_finite(&self, label: &'static str) -> PureResult<()> {
        match self.data.iter().find(|v| !v.is_finite()) {
            Some(&value) => Err(TensorError::NonFiniteValue { label, value }),
            None => Ok(()),
        }
    }

    fn matrix_dims(&self) -> PureResult<(usize, usize)> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            _ => Err(TensorError::InvalidValue {
                label: "matrix_rank",
            }),
        }
    }

    /// Matrix product of two rank-2 tensors.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Self> {
        let (rows, inner) = self.matrix_dims()?;
        let (other_inner, cols) = other.matrix_dims()?;
        if inner != other_inner {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        other.ensure_device(self.device)?;
        let mut data = vec![0.0f32; rows * cols];
        for r in 0..rows {
            let lhs = &self.data[r * inner..(r + 1) * inner];
            let out = &mut data[r * cols..(r + 1) * cols];
            for (k, &a) in lhs.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs = &other.data[k * cols..(k + 1) * cols];
                for (dst, &b) in out.iter_mut().zip(rhs.iter()) {
                    *dst += a * b;
                }
            }
        }
        Ok(Self::from_vec(&[rows, cols], data)?.to_device(self.device))
    }

    /// Transpose of a rank-2 tensor.
    pub fn transpose(&self) -> PureResult<Self> {
        let (rows, cols) = self.matrix_dims()?;
        let mut data = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = self.data[r * cols + c];
            }
        }
        Ok(Self::from_vec(&[cols, rows], data)?.to_device(self.device))
    }

    /// Column sums of a rank-2 tensor.
    pub fn sum_axis0(&self) -> PureResult<Vec<f32>> {
        let (rows, cols) = self.matrix_dims()?;
        let mut sums = vec![0.0f32; cols];
        for r in 0..rows {
            for (dst, &v) in sums.iter_mut().zip(&self.data[r * cols..(r + 1) * cols]) {
                *dst += v;
            }
        }
        Ok(sums)
    }

    /// Weighted sum `Σ coefficients[i] * tensors[i]`.
    ///
    /// All tensors must share shape and device; an empty input or a length
    /// mismatch between tensors and coefficients is rejected.
    pub fn linear_combination(tensors: &[&Tensor], coefficients: &[f32]) -> PureResult<Self> {
        let first = tensors
            .first()
            .ok_or(TensorError::EmptyInput("linear_combination"))?;
        if tensors.len() != coefficients.len() {
            return Err(TensorError::DataLength {
                expected: tensors.len(),
                got: coefficients.len(),
            });
        }
        let mut out = first.scale(coefficients[0]);
        for (tensor, &coeff) in tensors.iter().zip(coefficients.iter()).skip(1) {
            out.add_scaled(tensor, coeff)?;
        }
        Ok(out)
    }
}
