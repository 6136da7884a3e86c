// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{FpnError, FpnResult};
use crate::feature::FeatureMap;
use crate::module::{Layer, Module, Parameter};
use fpn_tensor::{Tensor, TensorError};
use serde::{Deserialize, Serialize};

/// Pooling operator applied when a feature map is downsampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingType {
    Max,
    Average,
}

fn validate_positive(value: usize, label: &'static str) -> FpnResult<()> {
    if value == 0 {
        return Err(FpnError::Tensor(TensorError::InvalidValue { label }));
    }
    Ok(())
}

fn guard_channels(input: &FeatureMap, expected: usize) -> FpnResult<()> {
    if input.channels() != expected {
        return Err(FpnError::Tensor(TensorError::ShapeMismatch {
            left: (1, input.channels()),
            right: (1, expected),
        }));
    }
    Ok(())
}

/// Leading padding for a SAME-style window: total slack is split with the
/// extra element going to the trailing edge.
fn same_pad_before(dim: usize, window: usize, stride: usize) -> usize {
    let out = dim.div_ceil(stride);
    let total = ((out - 1) * stride + window).saturating_sub(dim);
    total / 2
}

fn seeded_weights(rows: usize, cols: usize, start: f32) -> FpnResult<Tensor> {
    let mut seed = start;
    let tensor = Tensor::from_fn(rows, cols, |_r, _c| {
        let value = seed;
        seed = (seed * 1.57).rem_euclid(0.15).max(5e-3);
        value
    })?;
    Ok(tensor)
}

/// Pools a feature map with a SAME-padded window. Max pooling ignores padded
/// positions; average pooling divides by the number of in-bounds elements,
/// never by the full window.
pub fn pool2d_same(
    input: &FeatureMap,
    window: (usize, usize),
    stride: (usize, usize),
    pooling: PoolingType,
) -> FpnResult<FeatureMap> {
    validate_positive(window.0, "pool_window_h")?;
    validate_positive(window.1, "pool_window_w")?;
    validate_positive(stride.0, "pool_stride_h")?;
    validate_positive(stride.1, "pool_stride_w")?;
    let (batch, channels, h, w) = input.shape();
    let out_h = h.div_ceil(stride.0);
    let out_w = w.div_ceil(stride.1);
    let pad_top = same_pad_before(h, window.0, stride.0);
    let pad_left = same_pad_before(w, window.1, stride.1);
    let mut out = FeatureMap::zeros(batch, channels, out_h, out_w)?;
    let in_cols = channels * h * w;
    let out_cols = channels * out_h * out_w;
    let input_data = input.data();
    let out_data = out.data_mut();
    for b in 0..batch {
        let row = &input_data[b * in_cols..(b + 1) * in_cols];
        let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
        for c in 0..channels {
            let plane = &row[c * h * w..(c + 1) * h * w];
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut best = f32::MIN;
                    let mut sum = 0.0f32;
                    let mut count = 0usize;
                    for ky in 0..window.0 {
                        let pos_y = oy * stride.0 + ky;
                        if pos_y < pad_top {
                            continue;
                        }
                        let y = pos_y - pad_top;
                        if y >= h {
                            continue;
                        }
                        for kx in 0..window.1 {
                            let pos_x = ox * stride.1 + kx;
                            if pos_x < pad_left {
                                continue;
                            }
                            let x = pos_x - pad_left;
                            if x >= w {
                                continue;
                            }
                            let value = plane[y * w + x];
                            best = best.max(value);
                            sum += value;
                            count += 1;
                        }
                    }
                    let pooled = match pooling {
                        PoolingType::Max => best,
                        PoolingType::Average => sum / count.max(1) as f32,
                    };
                    out_row[c * out_h * out_w + oy * out_w + ox] = pooled;
                }
            }
        }
    }
    Ok(out)
}

/// Nearest-neighbour interpolation to the requested spatial shape.
pub fn upsample_nearest(input: &FeatureMap, target_hw: (usize, usize)) -> FpnResult<FeatureMap> {
    let (target_h, target_w) = target_hw;
    validate_positive(target_h, "upsample_target_h")?;
    validate_positive(target_w, "upsample_target_w")?;
    let (batch, channels, h, w) = input.shape();
    if (h, w) == (target_h, target_w) {
        return Ok(input.clone());
    }
    let mut out = FeatureMap::zeros(batch, channels, target_h, target_w)?;
    let in_cols = channels * h * w;
    let out_cols = channels * target_h * target_w;
    let input_data = input.data();
    let out_data = out.data_mut();
    for b in 0..batch {
        let row = &input_data[b * in_cols..(b + 1) * in_cols];
        let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
        for c in 0..channels {
            let plane = &row[c * h * w..(c + 1) * h * w];
            let out_plane = &mut out_row[c * target_h * target_w..(c + 1) * target_h * target_w];
            for y in 0..target_h {
                let src_y = (y * h / target_h).min(h - 1);
                for x in 0..target_w {
                    let src_x = (x * w / target_w).min(w - 1);
                    out_plane[y * target_w + x] = plane[src_y * w + src_x];
                }
            }
        }
    }
    Ok(out)
}

/// Dense 2-D convolution with stride 1 and SAME padding, so the spatial
/// shape is preserved. Used for 1x1 channel projections and the dense
/// post-fusion 3x3 transform.
#[derive(Debug)]
pub struct Conv2dSame {
    weight: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
}

impl Conv2dSame {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        use_bias: bool,
    ) -> FpnResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel, "kernel_size")?;
        let name = name.into();
        let span = in_channels * kernel * kernel;
        let weight = seeded_weights(out_channels, span, 0.02)?;
        let bias = if use_bias {
            Some(Parameter::new(
                format!("{name}::bias"),
                Tensor::zeros(1, out_channels)?,
            ))
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias,
            in_channels,
            out_channels,
            kernel,
        })
    }
}

impl Module for Conv2dSame {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            visitor(bias)?;
        }
        Ok(())
    }
}

impl Layer for Conv2dSame {
    fn forward(&self, input: &FeatureMap, _training: bool) -> FpnResult<FeatureMap> {
        guard_channels(input, self.in_channels)?;
        let (batch, _, h, w) = input.shape();
        let k = self.kernel;
        // stride-1 SAME padding on both axes
        let pad = (k - 1) / 2;
        let span = self.in_channels * k * k;
        let mut out = FeatureMap::zeros(batch, self.out_channels, h, w)?;
        let weight_data = self.weight.value().data();
        let in_cols = self.in_channels * h * w;
        let out_cols = self.out_channels * h * w;
        let input_data = input.data();
        let out_data = out.data_mut();
        for b in 0..batch {
            let row = &input_data[b * in_cols..(b + 1) * in_cols];
            let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
            for oc in 0..self.out_channels {
                let weight_row = &weight_data[oc * span..(oc + 1) * span];
                let bias = self
                    .bias
                    .as_ref()
                    .map(|b| b.value().data()[oc])
                    .unwrap_or(0.0);
                for y in 0..h {
                    for x in 0..w {
                        let mut acc = bias;
                        for ic in 0..self.in_channels {
                            let plane = &row[ic * h * w..(ic + 1) * h * w];
                            for ky in 0..k {
                                let iy = y + ky;
                                if iy < pad || iy - pad >= h {
                                    continue;
                                }
                                for kx in 0..k {
                                    let ix = x + kx;
                                    if ix < pad || ix - pad >= w {
                                        continue;
                                    }
                                    let value = plane[(iy - pad) * w + (ix - pad)];
                                    acc += value * weight_row[ic * k * k + ky * k + kx];
                                }
                            }
                        }
                        out_row[oc * h * w + y * w + x] = acc;
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Depthwise-separable 2-D convolution (depth multiplier 1) with stride 1 and
/// SAME padding: a per-channel spatial filter followed by a 1x1 pointwise mix.
#[derive(Debug)]
pub struct SeparableConv2dSame {
    depthwise: Parameter,
    pointwise: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
}

impl SeparableConv2dSame {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        use_bias: bool,
    ) -> FpnResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel, "kernel_size")?;
        let name = name.into();
        let depthwise = seeded_weights(in_channels, kernel * kernel, 0.01)?;
        let pointwise = seeded_weights(out_channels, in_channels, 0.03)?;
        let bias = if use_bias {
            Some(Parameter::new(
                format!("{name}::bias"),
                Tensor::zeros(1, out_channels)?,
            ))
        } else {
            None
        };
        Ok(Self {
            depthwise: Parameter::new(format!("{name}::depthwise"), depthwise),
            pointwise: Parameter::new(format!("{name}::pointwise"), pointwise),
            bias,
            in_channels,
            out_channels,
            kernel,
        })
    }
}

impl Module for SeparableConv2dSame {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        visitor(&self.depthwise)?;
        visitor(&self.pointwise)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        visitor(&mut self.depthwise)?;
        visitor(&mut self.pointwise)?;
        if let Some(bias) = &mut self.bias {
            visitor(bias)?;
        }
        Ok(())
    }
}

impl Layer for SeparableConv2dSame {
    fn forward(&self, input: &FeatureMap, _training: bool) -> FpnResult<FeatureMap> {
        guard_channels(input, self.in_channels)?;
        let (batch, _, h, w) = input.shape();
        let k = self.kernel;
        let pad = if k > 1 { (k - 1) / 2 } else { 0 };
        let depth_data = self.depthwise.value().data();
        let point_data = self.pointwise.value().data();
        let mut filtered = FeatureMap::zeros(batch, self.in_channels, h, w)?;
        let in_cols = self.in_channels * h * w;
        {
            let input_data = input.data();
            let filtered_data = filtered.data_mut();
            for b in 0..batch {
                let row = &input_data[b * in_cols..(b + 1) * in_cols];
                let out_row = &mut filtered_data[b * in_cols..(b + 1) * in_cols];
                for c in 0..self.in_channels {
                    let plane = &row[c * h * w..(c + 1) * h * w];
                    let kernel_row = &depth_data[c * k * k..(c + 1) * k * k];
                    let out_plane = &mut out_row[c * h * w..(c + 1) * h * w];
                    for y in 0..h {
                        for x in 0..w {
                            let mut acc = 0.0f32;
                            for ky in 0..k {
                                let iy = y + ky;
                                if iy < pad || iy - pad >= h {
                                    continue;
                                }
                                for kx in 0..k {
                                    let ix = x + kx;
                                    if ix < pad || ix - pad >= w {
                                        continue;
                                    }
                                    acc += plane[(iy - pad) * w + (ix - pad)]
                                        * kernel_row[ky * k + kx];
                                }
                            }
                            out_plane[y * w + x] = acc;
                        }
                    }
                }
            }
        }
        let mut out = FeatureMap::zeros(batch, self.out_channels, h, w)?;
        let out_cols = self.out_channels * h * w;
        let filtered_data = filtered.data();
        let out_data = out.data_mut();
        for b in 0..batch {
            let row = &filtered_data[b * in_cols..(b + 1) * in_cols];
            let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
            for oc in 0..self.out_channels {
                let mix = &point_data[oc * self.in_channels..(oc + 1) * self.in_channels];
                let bias = self
                    .bias
                    .as_ref()
                    .map(|b| b.value().data()[oc])
                    .unwrap_or(0.0);
                let out_plane = &mut out_row[oc * h * w..(oc + 1) * h * w];
                for p in 0..h * w {
                    let mut acc = bias;
                    for (ic, weight) in mix.iter().enumerate() {
                        acc += row[ic * h * w + p] * weight;
                    }
                    out_plane[p] = acc;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(h: usize, w: usize) -> FeatureMap {
        FeatureMap::from_fn(1, 1, h, w, |_, _, y, x| (y * w + x) as f32).unwrap()
    }

    #[test]
    fn max_pool_same_halves_spatial_shape() {
        let input = ramp(4, 4);
        let pooled = pool2d_same(&input, (3, 3), (2, 2), PoolingType::Max).unwrap();
        assert_eq!(pooled.hw(), (2, 2));
        assert_eq!(pooled.data(), &[10.0, 11.0, 14.0, 15.0]);
    }

    #[test]
    fn average_pool_excludes_padding_from_divisor() {
        let input = ramp(4, 4);
        let pooled = pool2d_same(&input, (3, 3), (2, 2), PoolingType::Average).unwrap();
        assert_eq!(pooled.data(), &[5.0, 6.5, 11.0, 12.5]);
    }

    #[test]
    fn nearest_upsample_repeats_pixels() {
        let input = FeatureMap::from_fn(1, 1, 2, 2, |_, _, y, x| (y * 2 + x) as f32).unwrap();
        let up = upsample_nearest(&input, (4, 4)).unwrap();
        assert_eq!(up.hw(), (4, 4));
        assert_eq!(up.at(0, 0, 0, 0), 0.0);
        assert_eq!(up.at(0, 0, 1, 1), 0.0);
        assert_eq!(up.at(0, 0, 1, 2), 1.0);
        assert_eq!(up.at(0, 0, 3, 3), 3.0);
    }

    #[test]
    fn pointwise_conv_mixes_channels_only() {
        let mut conv = Conv2dSame::new("proj", 2, 1, 1, false).unwrap();
        conv.weight
            .load_value(&Tensor::from_vec(1, 2, vec![2.0, -1.0]).unwrap())
            .unwrap();
        let input =
            FeatureMap::from_fn(1, 2, 2, 2, |_, c, y, x| if c == 0 { 1.0 } else { (y + x) as f32 })
                .unwrap();
        let out = conv.forward(&input, false).unwrap();
        assert_eq!(out.channels(), 1);
        assert_eq!(out.at(0, 0, 0, 0), 2.0);
        assert_eq!(out.at(0, 0, 1, 1), 0.0);
    }

    #[test]
    fn dense_conv_keeps_spatial_shape() {
        let conv = Conv2dSame::new("post", 3, 4, 3, true).unwrap();
        let input = FeatureMap::zeros(2, 3, 5, 7).unwrap();
        let out = conv.forward(&input, false).unwrap();
        assert_eq!(out.shape(), (2, 4, 5, 7));
    }

    #[test]
    fn separable_conv_identity_kernels() {
        let mut conv = SeparableConv2dSame::new("sep", 2, 2, 3, false).unwrap();
        // Depthwise delta kernel, pointwise identity: output equals input.
        let mut depthwise = vec![0.0f32; 2 * 9];
        depthwise[4] = 1.0;
        depthwise[9 + 4] = 1.0;
        conv.depthwise
            .load_value(&Tensor::from_vec(2, 9, depthwise).unwrap())
            .unwrap();
        conv.pointwise
            .load_value(&Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap())
            .unwrap();
        let input = FeatureMap::from_fn(1, 2, 3, 3, |_, c, y, x| (c * 9 + y * 3 + x) as f32)
            .unwrap();
        let out = conv.forward(&input, false).unwrap();
        assert_eq!(out.data(), input.data());
    }

    #[test]
    fn conv_rejects_channel_mismatch() {
        let conv = Conv2dSame::new("proj", 4, 8, 1, false).unwrap();
        let input = FeatureMap::zeros(1, 3, 2, 2).unwrap();
        assert!(conv.forward(&input, false).is_err());
    }
}
