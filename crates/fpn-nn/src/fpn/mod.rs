// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bidirectional feature-pyramid fusion graph: wiring, resampling, weighted
//! fusion and the stacked cells that tie them together.

pub mod cell;
pub mod fusion;
pub mod network;
pub mod resample;
pub mod topology;

pub use cell::{output_for_level, select_levels, Cell, CellStack};
pub use fusion::{ConvAfterFusion, FusionNode, FusionWeights};
pub use network::Bifpn;
pub use resample::ResampleFeatureMap;
pub use topology::{fpn_topology, NodeSpec, Topology};
