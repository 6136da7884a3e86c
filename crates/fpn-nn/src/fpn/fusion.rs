// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::config::BifpnConfig;
use crate::error::{FpnError, FpnResult};
use crate::feature::FeatureMap;
use crate::fpn::resample::ResampleFeatureMap;
use crate::fpn::topology::NodeSpec;
use crate::layers::{BatchNorm2d, Conv2dSame, SeparableConv2dSame, Swish};
use crate::module::{Layer, Module, Parameter};
use fpn_tensor::Tensor;

/// Per-edge fusion weighting.
///
/// `Sum` carries no parameters. `Attn` and `FastAttn` hold one scalar
/// parameter per input edge, initialised to 1.0 so an untrained node starts
/// as a uniform average.
#[derive(Debug)]
pub enum FusionWeights {
    Sum,
    Attn(Vec<Parameter>),
    FastAttn(Vec<Parameter>),
}

impl FusionWeights {
    /// Parses a weighting scheme name. Unknown names fail here, at
    /// construction, rather than on the first forward pass.
    pub fn parse(method: &str, name: &str, edges: usize) -> FpnResult<Self> {
        let scalars = |label: &str| -> FpnResult<Vec<Parameter>> {
            (0..edges)
                .map(|i| {
                    Ok(Parameter::new(
                        format!("{name}::{label}_{i}"),
                        Tensor::full(1, 1, 1.0)?,
                    ))
                })
                .collect()
        };
        match method {
            "sum" => Ok(FusionWeights::Sum),
            "attn" => Ok(FusionWeights::Attn(scalars("attn")?)),
            "fastattn" => Ok(FusionWeights::FastAttn(scalars("fastattn")?)),
            other => Err(FpnError::UnsupportedWeightMethod {
                name: other.to_string(),
            }),
        }
    }

    fn weighted_sum(inputs: &[FeatureMap], weights: &[f32]) -> FpnResult<FeatureMap> {
        let mut fused = inputs[0].scale(weights[0])?;
        for (input, &weight) in inputs.iter().zip(weights.iter()).skip(1) {
            fused = fused.add(&input.scale(weight)?)?;
        }
        Ok(fused)
    }

    /// Combines the resampled inputs into one feature map.
    pub fn fuse(&self, inputs: &[FeatureMap]) -> FpnResult<FeatureMap> {
        if inputs.is_empty() {
            return Err(FpnError::configuration("fusion node received no inputs"));
        }
        match self {
            FusionWeights::Sum => {
                let mut fused = inputs[0].clone();
                for input in &inputs[1..] {
                    fused = fused.add(input)?;
                }
                Ok(fused)
            }
            FusionWeights::Attn(params) => {
                let raw: Vec<f32> = params.iter().map(|p| p.value().data()[0]).collect();
                let max = raw.iter().fold(f32::MIN, |a, &b| a.max(b));
                let exps: Vec<f32> = raw.iter().map(|w| (w - max).exp()).collect();
                let total: f32 = exps.iter().sum();
                let weights: Vec<f32> = exps.iter().map(|e| e / total).collect();
                Self::weighted_sum(inputs, &weights)
            }
            FusionWeights::FastAttn(params) => {
                let clipped: Vec<f32> =
                    params.iter().map(|p| p.value().data()[0].max(0.0)).collect();
                let total: f32 = clipped.iter().sum::<f32>() + 1e-4;
                let weights: Vec<f32> = clipped.iter().map(|w| w / total).collect();
                Self::weighted_sum(inputs, &weights)
            }
        }
    }
}

impl Module for FusionWeights {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        match self {
            FusionWeights::Sum => Ok(()),
            FusionWeights::Attn(params) | FusionWeights::FastAttn(params) => {
                for param in params {
                    visitor(param)?;
                }
                Ok(())
            }
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        match self {
            FusionWeights::Sum => Ok(()),
            FusionWeights::Attn(params) | FusionWeights::FastAttn(params) => {
                for param in params {
                    visitor(param)?;
                }
                Ok(())
            }
        }
    }
}

/// 3x3 transform applied to every fused feature.
///
/// With `conv_batchnorm_act_pattern` unset the block runs swish, conv, norm
/// and the convolution carries a bias; set, it runs conv, norm, swish
/// without one.
pub struct ConvAfterFusion {
    conv: Box<dyn Layer>,
    batchnorm: BatchNorm2d,
    swish: Swish,
    conv_batchnorm_act_pattern: bool,
}

impl ConvAfterFusion {
    pub fn new(name: &str, channels: usize, config: &BifpnConfig) -> FpnResult<Self> {
        let use_bias = !config.conv_batchnorm_act_pattern;
        let conv: Box<dyn Layer> = if config.separable_conv {
            Box::new(SeparableConv2dSame::new(
                format!("{name}::conv"),
                channels,
                channels,
                3,
                use_bias,
            )?)
        } else {
            Box::new(Conv2dSame::new(
                format!("{name}::conv"),
                channels,
                channels,
                3,
                use_bias,
            )?)
        };
        Ok(Self {
            conv,
            batchnorm: BatchNorm2d::new(format!("{name}::bn"), channels)?,
            swish: Swish::new(),
            conv_batchnorm_act_pattern: config.conv_batchnorm_act_pattern,
        })
    }
}

impl Module for ConvAfterFusion {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        self.conv.visit_parameters(visitor)?;
        self.batchnorm.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        self.conv.visit_parameters_mut(visitor)?;
        self.batchnorm.visit_parameters_mut(visitor)
    }
}

impl Layer for ConvAfterFusion {
    fn forward(&self, input: &FeatureMap, training: bool) -> FpnResult<FeatureMap> {
        if self.conv_batchnorm_act_pattern {
            let out = self.conv.forward(input, training)?;
            let out = self.batchnorm.forward(&out, training)?;
            self.swish.forward(&out, training)
        } else {
            let out = self.swish.forward(input, training)?;
            let out = self.conv.forward(&out, training)?;
            self.batchnorm.forward(&out, training)
        }
    }
}

/// One node of the fusion graph: resamples each input feature onto the
/// node's level, combines them under the configured weighting, then applies
/// the post-fusion transform.
pub struct FusionNode {
    feature_level: usize,
    feature_level_index: usize,
    input_offsets: Vec<usize>,
    resamplers: Vec<ResampleFeatureMap>,
    weights: FusionWeights,
    conv_after_fusion: ConvAfterFusion,
}

impl FusionNode {
    /// Builds a node from its wiring. `input_channels[i]` is the channel
    /// count of the feature at `spec.input_offsets[i]`.
    pub fn new(
        name: &str,
        spec: &NodeSpec,
        min_level: usize,
        input_channels: &[usize],
        config: &BifpnConfig,
    ) -> FpnResult<Self> {
        if input_channels.len() != spec.input_offsets.len() {
            return Err(FpnError::configuration(format!(
                "node {} expects {} input channel counts, got {}",
                spec.id,
                spec.input_offsets.len(),
                input_channels.len()
            )));
        }
        let resamplers = spec
            .input_offsets
            .iter()
            .zip(input_channels.iter())
            .map(|(&offset, &channels)| {
                ResampleFeatureMap::new(
                    format!("{name}::resample_{offset}"),
                    channels,
                    config.num_filters,
                    config.conv_after_downsample,
                    config.use_batchnorm_for_resampling,
                    config.pooling_type,
                )
            })
            .collect::<FpnResult<Vec<_>>>()?;
        let weights =
            FusionWeights::parse(&config.weight_method, name, spec.input_offsets.len())?;
        let conv_after_fusion = ConvAfterFusion::new(name, config.num_filters, config)?;
        Ok(Self {
            feature_level: spec.feature_level,
            feature_level_index: spec.feature_level - min_level,
            input_offsets: spec.input_offsets.clone(),
            resamplers,
            weights,
            conv_after_fusion,
        })
    }

    pub fn feature_level(&self) -> usize {
        self.feature_level
    }

    pub fn input_offsets(&self) -> &[usize] {
        &self.input_offsets
    }

    /// Fuses from the flat feature list accumulated so far. The target
    /// spatial shape is taken from the cell input at the node's own level.
    pub fn forward(&self, features: &[FeatureMap], training: bool) -> FpnResult<FeatureMap> {
        let target_hw = features[self.feature_level_index].hw();
        let mut resampled = Vec::with_capacity(self.input_offsets.len());
        for (&offset, resampler) in self.input_offsets.iter().zip(self.resamplers.iter()) {
            resampled.push(resampler.resample(&features[offset], Some(target_hw), training)?);
        }
        let fused = self.weights.fuse(&resampled)?;
        self.conv_after_fusion.forward(&fused, training)
    }
}

impl Module for FusionNode {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        for resampler in &self.resamplers {
            resampler.visit_parameters(visitor)?;
        }
        self.weights.visit_parameters(visitor)?;
        self.conv_after_fusion.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        for resampler in &mut self.resamplers {
            resampler.visit_parameters_mut(visitor)?;
        }
        self.weights.visit_parameters_mut(visitor)?;
        self.conv_after_fusion.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maps(values: &[f32]) -> Vec<FeatureMap> {
        values
            .iter()
            .map(|&v| {
                let tensor = Tensor::full(1, 4, v).unwrap();
                FeatureMap::new(tensor, 1, 2, 2).unwrap()
            })
            .collect()
    }

    #[test]
    fn sum_fusion_adds_inputs() {
        let weights = FusionWeights::parse("sum", "node", 3).unwrap();
        let fused = weights.fuse(&maps(&[1.0, 2.0, 4.0])).unwrap();
        assert_eq!(fused.data(), &[7.0; 4]);
        assert_eq!(weights.parameter_count().unwrap(), 0);
    }

    #[test]
    fn fast_attention_with_equal_weights_averages() {
        let weights = FusionWeights::parse("fastattn", "node", 2).unwrap();
        let fused = weights.fuse(&maps(&[2.0, 6.0])).unwrap();
        // both weights start at 1.0; the 1e-4 stabiliser pulls the mean
        // fractionally below 4.0
        for value in fused.data() {
            assert!((value - 4.0).abs() < 1e-3, "got {value}");
        }
        assert_eq!(weights.parameter_count().unwrap(), 2);
    }

    #[test]
    fn fast_attention_clips_negative_weights() {
        let mut weights = FusionWeights::parse("fastattn", "node", 2).unwrap();
        if let FusionWeights::FastAttn(params) = &mut weights {
            params[1].value_mut().data_mut()[0] = -5.0;
        }
        let fused = weights.fuse(&maps(&[3.0, 100.0])).unwrap();
        for value in fused.data() {
            assert!((value - 3.0).abs() < 0.05, "got {value}");
        }
    }

    #[test]
    fn attention_softmax_normalises_weights() {
        let mut weights = FusionWeights::parse("attn", "node", 2).unwrap();
        if let FusionWeights::Attn(params) = &mut weights {
            params[0].value_mut().data_mut()[0] = 0.0;
            params[1].value_mut().data_mut()[0] = 0.0;
        }
        let fused = weights.fuse(&maps(&[2.0, 6.0])).unwrap();
        for value in fused.data() {
            assert!((value - 4.0).abs() < 1e-5, "got {value}");
        }
    }

    #[test]
    fn unknown_weight_method_fails_at_construction() {
        let err = FusionWeights::parse("softattn", "node", 2).unwrap_err();
        assert_eq!(
            err,
            FpnError::UnsupportedWeightMethod {
                name: "softattn".to_string(),
            }
        );
    }

    #[test]
    fn fusion_node_resamples_onto_its_level() {
        let config = BifpnConfig {
            weight_method: "sum".to_string(),
            num_filters: 4,
            backbone_channels: vec![4, 4, 4],
            ..BifpnConfig::default()
        };
        let spec = NodeSpec {
            id: 5,
            feature_level: 4,
            input_offsets: vec![1, 2],
        };
        let node = FusionNode::new("cell0::node0", &spec, 3, &[4, 4], &config).unwrap();
        let features = vec![
            FeatureMap::zeros(1, 4, 16, 16).unwrap(),
            FeatureMap::zeros(1, 4, 8, 8).unwrap(),
            FeatureMap::zeros(1, 4, 4, 4).unwrap(),
        ];
        let out = node.forward(&features, false).unwrap();
        assert_eq!(out.shape(), (1, 4, 8, 8));
    }
}
