// SPDX-License-Identifier: AGPL-3.0-or-later

use fpn_tensor::TensorError;
use thiserror::Error;

/// Result alias used across the fusion-graph surface.
pub type FpnResult<T> = Result<T, FpnError>;

/// Errors produced while building or evaluating a feature-pyramid graph.
///
/// Every variant is deterministic: these are configuration or programming
/// errors, never transient faults, so callers are expected to fail model
/// construction or evaluation outright instead of retrying.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FpnError {
    /// Unsupported topology name, invalid level range, or malformed options.
    #[error("invalid feature pyramid configuration: {reason}")]
    Configuration { reason: String },
    /// Unknown fusion weighting scheme.
    #[error("unsupported fusion weight method `{name}` (expected sum, attn or fastattn)")]
    UnsupportedWeightMethod { name: String },
    /// Resampling requested between spatial shapes that are not related by a
    /// strict larger/smaller ordering in both dimensions.
    #[error("incompatible resampling: source {src:?} vs target {target:?}")]
    ShapeMismatch {
        src: (usize, usize),
        target: (usize, usize),
    },
    /// Level selection requested outside the pyramid range.
    #[error("level {level} outside pyramid range [{min_level}, {max_level}]")]
    LevelOutOfRange {
        level: usize,
        min_level: usize,
        max_level: usize,
    },
    /// Failure bubbled up from the tensor layer.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl FpnError {
    /// Shorthand for a configuration failure with a formatted reason.
    pub fn configuration(reason: impl Into<String>) -> Self {
        FpnError::Configuration {
            reason: reason.into(),
        }
    }
}
