// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::FpnResult;
use crate::feature::FeatureMap;
use crate::module::{Layer, Module, Parameter};
use fpn_tensor::Tensor;

/// Swish activation (`x * sigmoid(x)`). Stateless, so it does not
/// participate in parameter visits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Swish;

impl Swish {
    /// Creates a new swish layer.
    pub fn new() -> Self {
        Self
    }
}

fn swish(value: f32) -> f32 {
    value / (1.0 + (-value).exp())
}

impl Module for Swish {
    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        Ok(())
    }
}

impl Layer for Swish {
    fn forward(&self, input: &FeatureMap, _training: bool) -> FpnResult<FeatureMap> {
        let (rows, cols) = input.tensor().shape();
        let mut data = Vec::with_capacity(rows * cols);
        for value in input.data() {
            data.push(swish(*value));
        }
        let tensor = Tensor::from_vec(rows, cols, data)?;
        FeatureMap::new(tensor, input.channels(), input.height(), input.width())
    }
}
