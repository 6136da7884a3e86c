// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pure CPU tensor primitives for the feature-pyramid fusion crates.
//!
//! Tensors are dense, row-major `f32` matrices. The batch dimension lives in
//! the rows; everything else (channels, height, width) is flattened into the
//! columns by the layers that sit on top of this crate.

use thiserror::Error;

/// Result alias used across the pure tensor surface.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors produced by tensor constructors and operators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    #[error("invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero")]
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor does not match the requested shape.
    #[error("data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    #[error("shape mismatch: left={left:?}, right={right:?} cannot be combined")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// A computation received an empty input that would otherwise panic.
    #[error("empty input: {0}")]
    EmptyInput(&'static str),
    /// Attempted to load a parameter that was missing from a state dict.
    #[error("missing parameter `{name}` in state dict")]
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    #[error("tensor io failure: {message}")]
    IoError { message: String },
    /// Wrapper around serde failures when (de)serialising tensors.
    #[error("tensor serialization failure: {message}")]
    SerializationError { message: String },
    /// Numeric guard tripped on a value that must stay finite.
    #[error("non-finite value for {label}: {value}")]
    NonFiniteValue { label: &'static str, value: f32 },
    /// Generic configuration violation detected by a pure helper.
    #[error("invalid value for {label}")]
    InvalidValue { label: &'static str },
}

/// Dense row-major matrix of `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::guard_shape(rows, cols)?;
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Creates a tensor from an owned buffer.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::guard_shape(rows, cols)?;
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Creates a tensor by evaluating `f` at every `(row, col)` position.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        Self::guard_shape(rows, cols)?;
        let mut data = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                data.push(f(row, col));
            }
        }
        Ok(Self { rows, cols, data })
    }

    /// Creates a tensor where every element holds `value`.
    pub fn full(rows: usize, cols: usize, value: f32) -> PureResult<Self> {
        Self::guard_shape(rows, cols)?;
        Ok(Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        })
    }

    fn guard_shape(rows: usize, cols: usize) -> PureResult<()> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(())
    }

    /// Returns `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` when the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of the backing buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the backing buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    fn guard_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    /// Elementwise addition.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.guard_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Elementwise subtraction.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.guard_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Returns a copy scaled by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|a| a * value).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Accumulates `other * scale` into `self`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        self.guard_same_shape(other)?;
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += src * scale;
        }
        Ok(())
    }

    /// Squared L2 norm over every element.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Largest absolute difference against another tensor of the same shape.
    pub fn max_abs_diff(&self, other: &Tensor) -> PureResult<f32> {
        self.guard_same_shape(other)?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_rejects_degenerate_shapes() {
        assert!(matches!(
            Tensor::zeros(0, 3),
            Err(TensorError::InvalidDimensions { rows: 0, cols: 3 })
        ));
        assert!(Tensor::zeros(2, 2).is_ok());
    }

    #[test]
    fn from_vec_checks_length() {
        let err = Tensor::from_vec(2, 2, vec![1.0; 3]).unwrap_err();
        assert_eq!(
            err,
            TensorError::DataLength {
                expected: 4,
                got: 3
            }
        );
    }

    #[test]
    fn add_and_scale() {
        let a = Tensor::from_vec(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_vec(1, 3, vec![0.5, 0.5, 0.5]).unwrap();
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.data(), &[1.5, 2.5, 3.5]);
        let doubled = sum.scale(2.0).unwrap();
        assert_eq!(doubled.data(), &[3.0, 5.0, 7.0]);
    }

    #[test]
    fn add_scaled_accumulates_in_place() {
        let mut acc = Tensor::zeros(1, 2).unwrap();
        let update = Tensor::from_vec(1, 2, vec![1.0, -2.0]).unwrap();
        acc.add_scaled(&update, 0.5).unwrap();
        assert_eq!(acc.data(), &[0.5, -1.0]);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let a = Tensor::zeros(1, 2).unwrap();
        let b = Tensor::zeros(2, 1).unwrap();
        assert!(matches!(
            a.add(&b),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
