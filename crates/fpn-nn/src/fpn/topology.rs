// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{FpnError, FpnResult};

/// One fusion node of the pyramid graph.
///
/// `input_offsets` index into the flat list of features accumulated so far:
/// offsets below `num_levels` address the cell's input features, later
/// offsets address previously fused nodes. Every offset is strictly smaller
/// than the node's own id, so evaluation in id order never reads ahead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: usize,
    pub feature_level: usize,
    pub input_offsets: Vec<usize>,
}

/// Static wiring of one fusion cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    min_level: usize,
    max_level: usize,
    weight_method: String,
    nodes: Vec<NodeSpec>,
}

impl Topology {
    /// Builds the bidirectional wiring: a top-down pass from the coarsest
    /// level toward the finest, then a bottom-up pass back, fusing every
    /// intermediate feature produced along the way.
    pub fn generate(
        min_level: usize,
        max_level: usize,
        weight_method: impl Into<String>,
    ) -> FpnResult<Self> {
        if min_level >= max_level {
            return Err(FpnError::configuration(format!(
                "min_level {min_level} must be below max_level {max_level}"
            )));
        }
        let num_levels = max_level - min_level + 1;
        // ids_per_level[i] tracks every feature id produced so far for
        // level min_level + i, seeded with the cell inputs 0..num_levels.
        let mut ids_per_level: Vec<Vec<usize>> = (0..num_levels).map(|i| vec![i]).collect();
        let mut nodes = Vec::with_capacity(2 * (num_levels - 1));
        let mut next_id = num_levels;

        for level in (min_level..max_level).rev() {
            let i = level - min_level;
            let input_offsets = vec![
                *ids_per_level[i].last().unwrap_or(&i),
                *ids_per_level[i + 1].last().unwrap_or(&(i + 1)),
            ];
            nodes.push(NodeSpec {
                id: next_id,
                feature_level: level,
                input_offsets,
            });
            ids_per_level[i].push(next_id);
            next_id += 1;
        }
        for level in (min_level + 1)..=max_level {
            let i = level - min_level;
            let mut input_offsets = ids_per_level[i].clone();
            input_offsets.push(*ids_per_level[i - 1].last().unwrap_or(&(i - 1)));
            nodes.push(NodeSpec {
                id: next_id,
                feature_level: level,
                input_offsets,
            });
            ids_per_level[i].push(next_id);
            next_id += 1;
        }

        Ok(Self {
            min_level,
            max_level,
            weight_method: weight_method.into(),
            nodes,
        })
    }

    pub fn min_level(&self) -> usize {
        self.min_level
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn num_levels(&self) -> usize {
        self.max_level - self.min_level + 1
    }

    pub fn weight_method(&self) -> &str {
        &self.weight_method
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }
}

/// Looks up a topology family by name. `"bifpn"` (case-insensitive) is the
/// only supported family.
pub fn fpn_topology(
    name: &str,
    min_level: usize,
    max_level: usize,
    weight_method: impl Into<String>,
) -> FpnResult<Topology> {
    if !name.eq_ignore_ascii_case("bifpn") {
        return Err(FpnError::configuration(format!(
            "unknown feature pyramid topology `{name}`"
        )));
    }
    Topology::generate(min_level, max_level, weight_method)
}
