// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{FpnError, FpnResult};
use crate::layers::PoolingType;
use serde::{Deserialize, Serialize};

/// Options controlling the shape and behaviour of a bidirectional
/// feature-pyramid network.
///
/// Defaults follow the smallest detector preset ([`BifpnConfig::d0`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BifpnConfig {
    /// Finest pyramid level consumed and produced.
    pub min_level: usize,
    /// Coarsest pyramid level consumed and produced.
    pub max_level: usize,
    /// Topology family name. Only `"bifpn"` is recognised.
    pub fpn_name: String,
    /// Fusion weighting scheme: `"sum"`, `"attn"` or `"fastattn"`.
    pub weight_method: String,
    /// Channel width every fused feature is projected to.
    pub num_filters: usize,
    /// Number of stacked fusion cells.
    pub cell_repeats: usize,
    /// Use depthwise-separable convolutions after fusion.
    pub separable_conv: bool,
    /// Apply the channel projection after pooling instead of before.
    pub conv_after_downsample: bool,
    /// Batch-normalise the output of resampling projections.
    pub use_batchnorm_for_resampling: bool,
    /// Post-fusion ordering: `true` runs conv, norm, swish; `false` runs
    /// swish, conv, norm.
    pub conv_batchnorm_act_pattern: bool,
    /// Pooling operator used when downsampling.
    pub pooling_type: PoolingType,
    /// Channel counts of the backbone features handed to the first cell,
    /// ordered fine to coarse starting at `min_level`.
    pub backbone_channels: Vec<usize>,
}

impl Default for BifpnConfig {
    fn default() -> Self {
        Self {
            min_level: 3,
            max_level: 7,
            fpn_name: "bifpn".to_string(),
            weight_method: "fastattn".to_string(),
            num_filters: 64,
            cell_repeats: 3,
            separable_conv: true,
            conv_after_downsample: false,
            use_batchnorm_for_resampling: true,
            conv_batchnorm_act_pattern: false,
            pooling_type: PoolingType::Max,
            backbone_channels: vec![40, 112, 320],
        }
    }
}

impl BifpnConfig {
    /// Number of pyramid levels spanned by the configuration.
    pub fn num_levels(&self) -> usize {
        self.max_level - self.min_level + 1
    }

    /// Checks internal consistency. Called by the network constructor, so
    /// manual invocation is only needed for configs built from external data.
    pub fn validate(&self) -> FpnResult<()> {
        if self.min_level >= self.max_level {
            return Err(FpnError::configuration(format!(
                "min_level {} must be below max_level {}",
                self.min_level, self.max_level
            )));
        }
        if self.num_filters == 0 {
            return Err(FpnError::configuration("num_filters must be positive"));
        }
        if self.cell_repeats == 0 {
            return Err(FpnError::configuration("cell_repeats must be positive"));
        }
        if self.backbone_channels.is_empty() {
            return Err(FpnError::configuration(
                "backbone_channels must name at least one input level",
            ));
        }
        if self.backbone_channels.len() > self.num_levels() {
            return Err(FpnError::configuration(format!(
                "{} backbone levels exceed the {} pyramid levels",
                self.backbone_channels.len(),
                self.num_levels()
            )));
        }
        if self.backbone_channels.iter().any(|&c| c == 0) {
            return Err(FpnError::configuration(
                "backbone channel counts must be positive",
            ));
        }
        Ok(())
    }

    fn preset(num_filters: usize, cell_repeats: usize, weight_method: &str) -> Self {
        Self {
            num_filters,
            cell_repeats,
            weight_method: weight_method.to_string(),
            ..Self::default()
        }
    }

    pub fn d0() -> Self {
        Self::preset(64, 3, "fastattn")
    }

    pub fn d1() -> Self {
        Self::preset(88, 4, "fastattn")
    }

    pub fn d2() -> Self {
        Self::preset(112, 5, "fastattn")
    }

    pub fn d3() -> Self {
        Self::preset(160, 6, "fastattn")
    }

    pub fn d4() -> Self {
        Self::preset(224, 7, "fastattn")
    }

    pub fn d5() -> Self {
        Self::preset(288, 7, "fastattn")
    }

    pub fn d6() -> Self {
        Self::preset(384, 8, "sum")
    }

    pub fn d7() -> Self {
        Self::preset(384, 8, "sum")
    }

    pub fn d7x() -> Self {
        Self {
            max_level: 8,
            ..Self::preset(384, 8, "sum")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = BifpnConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_levels(), 5);
    }

    #[test]
    fn presets_scale_width_and_depth() {
        assert_eq!(BifpnConfig::d0().num_filters, 64);
        assert_eq!(BifpnConfig::d3().cell_repeats, 6);
        assert_eq!(BifpnConfig::d6().weight_method, "sum");
        assert_eq!(BifpnConfig::d7x().max_level, 8);
        for config in [
            BifpnConfig::d0(),
            BifpnConfig::d4(),
            BifpnConfig::d7(),
            BifpnConfig::d7x(),
        ] {
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn inverted_level_range_is_rejected() {
        let config = BifpnConfig {
            min_level: 7,
            max_level: 3,
            ..BifpnConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FpnError::Configuration { .. })
        ));
    }

    #[test]
    fn too_many_backbone_levels_are_rejected() {
        let config = BifpnConfig {
            backbone_channels: vec![8; 6],
            ..BifpnConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = BifpnConfig::d2();
        let text = serde_json::to_string(&config).unwrap();
        let back: BifpnConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
