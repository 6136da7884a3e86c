// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bidirectional multi-scale feature fusion for object-detection pyramids.
//!
//! The crate builds a static fusion topology over a contiguous range of
//! pyramid levels, resamples features onto each node's shape, combines them
//! under a configurable weighting scheme and repeats the cell a configurable
//! number of times. [`Bifpn`] is the user-facing entry point; the pieces it
//! is assembled from are public for direct use.

pub mod config;
pub mod error;
pub mod feature;
pub mod fpn;
pub mod io;
pub mod layers;
pub mod module;

pub use config::BifpnConfig;
pub use error::{FpnError, FpnResult};
pub use feature::FeatureMap;
pub use fpn::{
    fpn_topology, output_for_level, Bifpn, Cell, CellStack, ConvAfterFusion, FusionNode,
    FusionWeights, NodeSpec, ResampleFeatureMap, Topology,
};
pub use layers::{BatchNorm2d, Conv2dSame, PoolingType, SeparableConv2dSame, Swish};
pub use module::{Layer, Module, Parameter};

pub use fpn_tensor::{PureResult, Tensor, TensorError};
