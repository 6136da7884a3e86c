// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{FpnError, FpnResult};
use fpn_tensor::{Tensor, TensorError};

/// A batched 2-D feature map stored as a `(batch, channels * height * width)`
/// tensor with explicit channel/spatial metadata.
///
/// The layout is channels-major: row `b` holds channel 0's `height * width`
/// values first, then channel 1, and so on. Feature maps are produced by one
/// component and consumed read-only by the next; no layer mutates an input
/// in place.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    tensor: Tensor,
    channels: usize,
    height: usize,
    width: usize,
}

impl FeatureMap {
    /// Wraps an existing tensor, checking that its columns match the layout.
    pub fn new(tensor: Tensor, channels: usize, height: usize, width: usize) -> FpnResult<Self> {
        let (rows, cols) = tensor.shape();
        let expected = channels * height * width;
        if channels == 0 || height == 0 || width == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: height,
                cols: channels.max(width),
            }
            .into());
        }
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, expected),
            }
            .into());
        }
        Ok(Self {
            tensor,
            channels,
            height,
            width,
        })
    }

    /// Creates a zero-filled feature map.
    pub fn zeros(batch: usize, channels: usize, height: usize, width: usize) -> FpnResult<Self> {
        let tensor = Tensor::zeros(batch, channels * height * width)?;
        Self::new(tensor, channels, height, width)
    }

    /// Creates a feature map by evaluating `f` at every `(batch, channel, y, x)`.
    pub fn from_fn<F>(
        batch: usize,
        channels: usize,
        height: usize,
        width: usize,
        mut f: F,
    ) -> FpnResult<Self>
    where
        F: FnMut(usize, usize, usize, usize) -> f32,
    {
        let plane = height * width;
        let tensor = Tensor::from_fn(batch, channels * plane, |b, col| {
            let channel = col / plane;
            let y = (col % plane) / width;
            let x = col % width;
            f(b, channel, y, x)
        })?;
        Self::new(tensor, channels, height, width)
    }

    /// Number of examples in the batch.
    pub fn batch(&self) -> usize {
        self.tensor.shape().0
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Spatial height.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Spatial width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Spatial shape `(height, width)`.
    pub fn hw(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Full shape `(batch, channels, height, width)`.
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (self.batch(), self.channels, self.height, self.width)
    }

    /// Underlying tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Consumes the map and returns the backing tensor.
    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    /// Immutable view of the backing buffer.
    pub fn data(&self) -> &[f32] {
        self.tensor.data()
    }

    /// Mutable view of the backing buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        self.tensor.data_mut()
    }

    /// Value at `(batch, channel, y, x)`. Intended for tests and debugging.
    pub fn at(&self, batch: usize, channel: usize, y: usize, x: usize) -> f32 {
        let cols = self.channels * self.height * self.width;
        let idx = batch * cols + channel * self.height * self.width + y * self.width + x;
        self.tensor.data()[idx]
    }

    /// Errors unless `other` shares this map's batch, channel and spatial shape.
    pub fn guard_same_layout(&self, other: &FeatureMap) -> FpnResult<()> {
        if self.shape() != other.shape() {
            return Err(FpnError::Tensor(TensorError::ShapeMismatch {
                left: self.tensor.shape(),
                right: other.tensor.shape(),
            }));
        }
        Ok(())
    }

    /// Elementwise sum with a map of identical layout.
    pub fn add(&self, other: &FeatureMap) -> FpnResult<FeatureMap> {
        self.guard_same_layout(other)?;
        let tensor = self.tensor.add(other.tensor())?;
        FeatureMap::new(tensor, self.channels, self.height, self.width)
    }

    /// Returns a copy scaled by `value`.
    pub fn scale(&self, value: f32) -> FpnResult<FeatureMap> {
        let tensor = self.tensor.scale(value)?;
        FeatureMap::new(tensor, self.channels, self.height, self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_validated() {
        let tensor = Tensor::zeros(1, 12).unwrap();
        assert!(FeatureMap::new(tensor.clone(), 3, 2, 2).is_ok());
        assert!(FeatureMap::new(tensor, 2, 2, 2).is_err());
    }

    #[test]
    fn from_fn_addresses_channels_major() {
        let map = FeatureMap::from_fn(1, 2, 2, 3, |_b, c, y, x| (c * 100 + y * 10 + x) as f32)
            .unwrap();
        assert_eq!(map.at(0, 0, 0, 0), 0.0);
        assert_eq!(map.at(0, 0, 1, 2), 12.0);
        assert_eq!(map.at(0, 1, 0, 1), 101.0);
    }

    #[test]
    fn add_requires_identical_layout() {
        let a = FeatureMap::zeros(1, 1, 2, 2).unwrap();
        let b = FeatureMap::zeros(1, 1, 2, 2).unwrap();
        assert!(a.add(&b).is_ok());
        let c = FeatureMap::zeros(1, 1, 4, 1).unwrap();
        assert!(a.add(&c).is_err());
    }
}
