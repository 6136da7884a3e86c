// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::config::BifpnConfig;
use crate::error::{FpnError, FpnResult};
use crate::feature::FeatureMap;
use crate::fpn::fusion::FusionNode;
use crate::fpn::topology::Topology;
use crate::module::{Module, Parameter};
use std::sync::Arc;

/// Picks the final fused feature for each pyramid level out of a cell's
/// grown feature list, ordered fine to coarse.
pub fn select_levels(topology: &Topology, flat: &[FeatureMap]) -> FpnResult<Vec<FeatureMap>> {
    let num_levels = topology.num_levels();
    let mut selected = Vec::with_capacity(num_levels);
    for level in topology.min_level()..=topology.max_level() {
        let node_index = topology
            .nodes()
            .iter()
            .rposition(|node| node.feature_level == level)
            .ok_or_else(|| {
                FpnError::configuration(format!("no fusion node produces level {level}"))
            })?;
        selected.push(flat[num_levels + node_index].clone());
    }
    Ok(selected)
}

/// Fetches the output for one pyramid level from a fine-to-coarse ordered
/// list, rejecting levels outside the pyramid range.
pub fn output_for_level(
    outputs: &[FeatureMap],
    level: usize,
    min_level: usize,
    max_level: usize,
) -> FpnResult<&FeatureMap> {
    if level < min_level || level > max_level {
        return Err(FpnError::LevelOutOfRange {
            level,
            min_level,
            max_level,
        });
    }
    Ok(&outputs[level - min_level])
}

/// One bidirectional fusion cell: evaluates every topology node in order,
/// appending each fused feature to the flat list the later nodes read from.
pub struct Cell {
    topology: Arc<Topology>,
    nodes: Vec<FusionNode>,
}

impl Cell {
    /// Builds a cell. `level_channels[i]` is the channel count of the cell
    /// input for level `min_level + i`; fused features always carry
    /// `config.num_filters` channels.
    pub fn new(
        name: &str,
        topology: Arc<Topology>,
        level_channels: &[usize],
        config: &BifpnConfig,
    ) -> FpnResult<Self> {
        let num_levels = topology.num_levels();
        if level_channels.len() != num_levels {
            return Err(FpnError::configuration(format!(
                "cell expects {num_levels} input channel counts, got {}",
                level_channels.len()
            )));
        }
        let channels_at = |offset: usize| {
            if offset < num_levels {
                level_channels[offset]
            } else {
                config.num_filters
            }
        };
        let nodes = topology
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let input_channels: Vec<usize> =
                    spec.input_offsets.iter().map(|&o| channels_at(o)).collect();
                FusionNode::new(
                    &format!("{name}::node{i}"),
                    spec,
                    topology.min_level(),
                    &input_channels,
                    config,
                )
            })
            .collect::<FpnResult<Vec<_>>>()?;
        Ok(Self { topology, nodes })
    }

    /// Runs the cell. Accepts either the bare per-level inputs or the grown
    /// list emitted by a previous cell, which is reduced back to one feature
    /// per level before fusing.
    pub fn forward(
        &self,
        features: &[FeatureMap],
        training: bool,
    ) -> FpnResult<Vec<FeatureMap>> {
        let num_levels = self.topology.num_levels();
        let mut flat = if features.len() == num_levels {
            features.to_vec()
        } else if features.len() == num_levels + self.nodes.len() {
            select_levels(&self.topology, features)?
        } else {
            return Err(FpnError::configuration(format!(
                "cell expects {num_levels} features, got {}",
                features.len()
            )));
        };
        flat.reserve(self.nodes.len());
        for node in &self.nodes {
            let fused = node.forward(&flat, training)?;
            flat.push(fused);
        }
        Ok(flat)
    }
}

impl Module for Cell {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        for node in &self.nodes {
            node.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        for node in &mut self.nodes {
            node.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

/// Repeated fusion cells. All cells share one topology; only the first sees
/// the raw input channel widths.
pub struct CellStack {
    topology: Arc<Topology>,
    cells: Vec<Cell>,
}

impl CellStack {
    pub fn new(
        topology: Arc<Topology>,
        first_level_channels: &[usize],
        config: &BifpnConfig,
    ) -> FpnResult<Self> {
        let uniform = vec![config.num_filters; topology.num_levels()];
        let cells = (0..config.cell_repeats)
            .map(|i| {
                let channels = if i == 0 {
                    first_level_channels
                } else {
                    &uniform
                };
                Cell::new(&format!("cell{i}"), Arc::clone(&topology), channels, config)
            })
            .collect::<FpnResult<Vec<_>>>()?;
        Ok(Self { topology, cells })
    }

    /// Threads the features through every cell and returns one fused feature
    /// per level, ordered fine to coarse.
    pub fn forward(
        &self,
        features: &[FeatureMap],
        training: bool,
    ) -> FpnResult<Vec<FeatureMap>> {
        let mut flat = features.to_vec();
        for cell in &self.cells {
            flat = cell.forward(&flat, training)?;
        }
        select_levels(&self.topology, &flat)
    }
}

impl Module for CellStack {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        for cell in &self.cells {
            cell.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        for cell in &mut self.cells {
            cell.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> BifpnConfig {
        BifpnConfig {
            min_level: 3,
            max_level: 5,
            weight_method: "fastattn".to_string(),
            num_filters: 4,
            cell_repeats: 2,
            backbone_channels: vec![2, 3, 5],
            ..BifpnConfig::default()
        }
    }

    fn inputs(channels: &[usize]) -> Vec<FeatureMap> {
        channels
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let side = 16 >> i;
                FeatureMap::from_fn(1, c, side, side, |_, ch, y, x| {
                    (ch + y + x) as f32 * 0.1
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn cell_grows_the_feature_list() {
        let config = small_config();
        let topology = Arc::new(
            Topology::generate(config.min_level, config.max_level, &config.weight_method)
                .unwrap(),
        );
        let cell = Cell::new("cell0", Arc::clone(&topology), &[2, 3, 5], &config).unwrap();
        let flat = cell.forward(&inputs(&[2, 3, 5]), false).unwrap();
        assert_eq!(flat.len(), 3 + 4);
        for fused in &flat[3..] {
            assert_eq!(fused.channels(), config.num_filters);
        }
    }

    #[test]
    fn cell_reduces_a_grown_list_before_fusing() {
        let config = small_config();
        let topology = Arc::new(
            Topology::generate(config.min_level, config.max_level, &config.weight_method)
                .unwrap(),
        );
        let first = Cell::new("cell0", Arc::clone(&topology), &[2, 3, 5], &config).unwrap();
        let second = Cell::new("cell1", Arc::clone(&topology), &[4, 4, 4], &config).unwrap();
        let grown = first.forward(&inputs(&[2, 3, 5]), false).unwrap();
        let flat = second.forward(&grown, false).unwrap();
        assert_eq!(flat.len(), 3 + 4);
        assert_eq!(flat[0].hw(), (16, 16));
        assert_eq!(flat[2].hw(), (4, 4));
    }

    #[test]
    fn stack_returns_one_output_per_level() {
        let config = small_config();
        let topology = Arc::new(
            Topology::generate(config.min_level, config.max_level, &config.weight_method)
                .unwrap(),
        );
        let stack = CellStack::new(Arc::clone(&topology), &[2, 3, 5], &config).unwrap();
        let outputs = stack.forward(&inputs(&[2, 3, 5]), false).unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].hw(), (16, 16));
        assert_eq!(outputs[1].hw(), (8, 8));
        assert_eq!(outputs[2].hw(), (4, 4));
        for output in &outputs {
            assert_eq!(output.channels(), config.num_filters);
        }
    }

    #[test]
    fn level_lookup_is_range_checked() {
        let config = small_config();
        let topology = Arc::new(
            Topology::generate(config.min_level, config.max_level, &config.weight_method)
                .unwrap(),
        );
        let stack = CellStack::new(Arc::clone(&topology), &[2, 3, 5], &config).unwrap();
        let outputs = stack.forward(&inputs(&[2, 3, 5]), false).unwrap();
        assert!(output_for_level(&outputs, 4, 3, 5).is_ok());
        let err = output_for_level(&outputs, 8, 3, 5).unwrap_err();
        assert_eq!(
            err,
            FpnError::LevelOutOfRange {
                level: 8,
                min_level: 3,
                max_level: 5,
            }
        );
    }
}
