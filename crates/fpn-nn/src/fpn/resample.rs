// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{FpnError, FpnResult};
use crate::feature::FeatureMap;
use crate::layers::{pool2d_same, upsample_nearest, BatchNorm2d, Conv2dSame, PoolingType};
use crate::module::{Layer, Module, Parameter};

#[derive(Debug)]
struct Projection {
    conv: Conv2dSame,
    batchnorm: Option<BatchNorm2d>,
}

impl Projection {
    fn apply(&self, input: &FeatureMap, training: bool) -> FpnResult<FeatureMap> {
        let projected = self.conv.forward(input, training)?;
        match &self.batchnorm {
            Some(bn) => bn.forward(&projected, training),
            None => Ok(projected),
        }
    }
}

/// Reshapes a feature map onto a node's channel width and spatial shape.
///
/// The direction is inferred from the shapes: strictly larger sources are
/// pooled down, sources no larger than the target are nearest-neighbour
/// upsampled, and mixed comparisons are rejected. A 1x1 projection runs only
/// when the channel counts differ; on the downsample path its position is
/// controlled by `conv_after_downsample`, on the upsample path it always
/// runs before interpolation.
#[derive(Debug)]
pub struct ResampleFeatureMap {
    in_channels: usize,
    target_channels: usize,
    projection: Option<Projection>,
    conv_after_downsample: bool,
    pooling_type: PoolingType,
}

impl ResampleFeatureMap {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        target_channels: usize,
        conv_after_downsample: bool,
        use_batchnorm: bool,
        pooling_type: PoolingType,
    ) -> FpnResult<Self> {
        let name = name.into();
        let projection = if in_channels != target_channels {
            let conv = Conv2dSame::new(format!("{name}::conv"), in_channels, target_channels, 1, true)?;
            let batchnorm = if use_batchnorm {
                Some(BatchNorm2d::new(format!("{name}::bn"), target_channels)?)
            } else {
                None
            };
            Some(Projection { conv, batchnorm })
        } else {
            None
        };
        Ok(Self {
            in_channels,
            target_channels,
            projection,
            conv_after_downsample,
            pooling_type,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn target_channels(&self) -> usize {
        self.target_channels
    }

    fn project(&self, input: &FeatureMap, training: bool) -> FpnResult<FeatureMap> {
        match &self.projection {
            Some(projection) => projection.apply(input, training),
            None => Ok(input.clone()),
        }
    }

    fn downsample(
        &self,
        input: &FeatureMap,
        target: (usize, usize),
        training: bool,
    ) -> FpnResult<FeatureMap> {
        let (h, w) = input.hw();
        let stride_h = (h - 1) / target.0 + 1;
        let stride_w = (w - 1) / target.1 + 1;
        let window = (stride_h + 1, stride_w + 1);
        if self.conv_after_downsample {
            let pooled = pool2d_same(input, window, (stride_h, stride_w), self.pooling_type)?;
            self.project(&pooled, training)
        } else {
            let projected = self.project(input, training)?;
            pool2d_same(&projected, window, (stride_h, stride_w), self.pooling_type)
        }
    }

    /// Resamples `input` to the requested spatial shape. `None` requests the
    /// default one-step downsample used when synthesising a coarser level.
    pub fn resample(
        &self,
        input: &FeatureMap,
        target: Option<(usize, usize)>,
        training: bool,
    ) -> FpnResult<FeatureMap> {
        let (h, w) = input.hw();
        let target = target.unwrap_or((h.div_ceil(2), w.div_ceil(2)));
        let (target_h, target_w) = target;
        if h > target_h && w > target_w {
            self.downsample(input, target, training)
        } else if h <= target_h && w <= target_w {
            let projected = self.project(input, training)?;
            upsample_nearest(&projected, target)
        } else {
            Err(FpnError::ShapeMismatch {
                src: (h, w),
                target,
            })
        }
    }
}

impl Module for ResampleFeatureMap {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        if let Some(projection) = &self.projection {
            projection.conv.visit_parameters(visitor)?;
            if let Some(bn) = &projection.batchnorm {
                bn.visit_parameters(visitor)?;
            }
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        if let Some(projection) = &mut self.projection {
            projection.conv.visit_parameters_mut(visitor)?;
            if let Some(bn) = &mut projection.batchnorm {
                bn.visit_parameters_mut(visitor)?;
            }
        }
        Ok(())
    }
}
