// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::config::BifpnConfig;
use crate::error::{FpnError, FpnResult};
use crate::feature::FeatureMap;
use crate::fpn::cell::{output_for_level, CellStack};
use crate::fpn::resample::ResampleFeatureMap;
use crate::fpn::topology::fpn_topology;
use crate::module::{Module, Parameter};
use std::sync::Arc;
use tracing::debug;

/// Bidirectional feature-pyramid network.
///
/// Takes the backbone features named by `config.backbone_channels`, ordered
/// fine to coarse starting at `min_level`, synthesises any missing coarse
/// levels by repeated downsampling, and runs the configured number of fusion
/// cells. Returns one feature per pyramid level at `num_filters` channels.
pub struct Bifpn {
    config: BifpnConfig,
    synth_resamplers: Vec<ResampleFeatureMap>,
    cells: CellStack,
}

impl Bifpn {
    pub fn new(config: BifpnConfig) -> FpnResult<Self> {
        config.validate()?;
        let topology = Arc::new(fpn_topology(
            &config.fpn_name,
            config.min_level,
            config.max_level,
            &config.weight_method,
        )?);
        let num_levels = topology.num_levels();
        let provided = config.backbone_channels.len();

        let mut synth_resamplers = Vec::with_capacity(num_levels - provided);
        let mut in_channels = *config
            .backbone_channels
            .last()
            .ok_or_else(|| FpnError::configuration("backbone_channels is empty"))?;
        for level in (config.min_level + provided)..=config.max_level {
            synth_resamplers.push(ResampleFeatureMap::new(
                format!("resample_p{level}"),
                in_channels,
                config.num_filters,
                config.conv_after_downsample,
                config.use_batchnorm_for_resampling,
                config.pooling_type,
            )?);
            in_channels = config.num_filters;
        }

        let mut first_level_channels = config.backbone_channels.clone();
        first_level_channels.resize(num_levels, config.num_filters);
        let cells = CellStack::new(Arc::clone(&topology), &first_level_channels, &config)?;

        debug!(
            min_level = config.min_level,
            max_level = config.max_level,
            cells = config.cell_repeats,
            filters = config.num_filters,
            weight_method = %config.weight_method,
            "built feature pyramid network"
        );
        Ok(Self {
            config,
            synth_resamplers,
            cells,
        })
    }

    pub fn config(&self) -> &BifpnConfig {
        &self.config
    }

    fn validate_inputs(&self, features: &[FeatureMap]) -> FpnResult<()> {
        let expected = &self.config.backbone_channels;
        if features.len() != expected.len() {
            return Err(FpnError::configuration(format!(
                "expected {} backbone features, got {}",
                expected.len(),
                features.len()
            )));
        }
        for (i, (feature, &channels)) in features.iter().zip(expected.iter()).enumerate() {
            if feature.channels() != channels {
                return Err(FpnError::configuration(format!(
                    "backbone feature {i} carries {} channels, expected {channels}",
                    feature.channels()
                )));
            }
        }
        Ok(())
    }

    /// Runs the pyramid. Outputs are ordered fine to coarse, one per level
    /// in `[min_level, max_level]`.
    pub fn forward(
        &self,
        features: &[FeatureMap],
        training: bool,
    ) -> FpnResult<Vec<FeatureMap>> {
        self.validate_inputs(features)?;
        let mut all = features.to_vec();
        for resampler in &self.synth_resamplers {
            let coarser = resampler.resample(all.last().unwrap_or(&features[0]), None, training)?;
            all.push(coarser);
        }
        self.cells.forward(&all, training)
    }

    /// Fetches one level's output from a list produced by [`Bifpn::forward`].
    pub fn output_for_level<'a>(
        &self,
        outputs: &'a [FeatureMap],
        level: usize,
    ) -> FpnResult<&'a FeatureMap> {
        output_for_level(outputs, level, self.config.min_level, self.config.max_level)
    }
}

impl Module for Bifpn {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        for resampler in &self.synth_resamplers {
            resampler.visit_parameters(visitor)?;
        }
        self.cells.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        for resampler in &mut self.synth_resamplers {
            resampler.visit_parameters_mut(visitor)?;
        }
        self.cells.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> BifpnConfig {
        BifpnConfig {
            min_level: 3,
            max_level: 6,
            num_filters: 8,
            cell_repeats: 1,
            backbone_channels: vec![4, 6, 10],
            ..BifpnConfig::default()
        }
    }

    fn backbone(channels: &[usize], base: usize) -> Vec<FeatureMap> {
        channels
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let side = base >> i;
                FeatureMap::from_fn(1, c, side, side, |_, ch, y, x| {
                    ((ch + 1) * (y + x)) as f32 * 0.01
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn synthesises_missing_coarse_levels() {
        let network = Bifpn::new(tiny_config()).unwrap();
        let outputs = network
            .forward(&backbone(&[4, 6, 10], 32), false)
            .unwrap();
        assert_eq!(outputs.len(), 4);
        let expected = [(32, 32), (16, 16), (8, 8), (4, 4)];
        for (output, &(h, w)) in outputs.iter().zip(expected.iter()) {
            assert_eq!(output.hw(), (h, w));
            assert_eq!(output.channels(), 8);
        }
    }

    #[test]
    fn rejects_wrong_backbone_arity() {
        let network = Bifpn::new(tiny_config()).unwrap();
        let err = network
            .forward(&backbone(&[4, 6], 32), false)
            .unwrap_err();
        assert!(matches!(err, FpnError::Configuration { .. }));
    }

    #[test]
    fn rejects_wrong_backbone_channels() {
        let network = Bifpn::new(tiny_config()).unwrap();
        let err = network
            .forward(&backbone(&[4, 6, 12], 32), false)
            .unwrap_err();
        assert!(matches!(err, FpnError::Configuration { .. }));
    }

    #[test]
    fn unknown_topology_name_fails_construction() {
        let config = BifpnConfig {
            fpn_name: "qufpn".to_string(),
            ..tiny_config()
        };
        assert!(matches!(
            Bifpn::new(config),
            Err(FpnError::Configuration { .. })
        ));
    }

    #[test]
    fn unknown_weight_method_fails_construction() {
        let config = BifpnConfig {
            weight_method: "channelattn".to_string(),
            ..tiny_config()
        };
        assert!(matches!(
            Bifpn::new(config),
            Err(FpnError::UnsupportedWeightMethod { .. })
        ));
    }

    #[test]
    fn parameters_have_unique_names() {
        let network = Bifpn::new(tiny_config()).unwrap();
        let mut names = std::collections::HashSet::new();
        network
            .visit_parameters(&mut |param| {
                assert!(names.insert(param.name().to_string()), "{}", param.name());
                Ok(())
            })
            .unwrap();
        assert!(!names.is_empty());
    }
}
