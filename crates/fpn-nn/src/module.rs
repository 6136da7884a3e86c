// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{FpnError, FpnResult};
use crate::feature::FeatureMap;
use fpn_tensor::{Tensor, TensorError};
use std::collections::HashMap;

/// Named tensor value owned by a layer.
///
/// The fusion graph only reads parameters during a forward pass; an external
/// optimizer mutates them between passes through [`Module::visit_parameters_mut`].
pub struct Parameter {
    name: String,
    value: Tensor,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(f, "Parameter(name={},shape=({rows},{cols}))", self.name)
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> FpnResult<()> {
        if self.value.shape() != value.shape() {
            return Err(FpnError::Tensor(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: value.shape(),
            }));
        }
        self.value = value.clone();
        Ok(())
    }
}

/// Parameter-bearing component of the fusion graph.
///
/// Forward signatures differ per component (single-input layers take one
/// feature map, fusion nodes take a growing list), so the trait only carries
/// the parameter-visiting surface shared by everything.
pub trait Module {
    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()>;

    /// Number of parameter tensors reachable from this module.
    fn parameter_count(&self) -> FpnResult<usize> {
        let mut count = 0usize;
        self.visit_parameters(&mut |_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> FpnResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> FpnResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(FpnError::Tensor(TensorError::MissingParameter {
                    name: param.name().to_string(),
                }));
            };
            param.load_value(value)
        })
    }
}

/// Single-input, single-output layer.
///
/// `training` selects normalisation-statistics behaviour; it must be held
/// consistent across every layer within one forward pass.
pub trait Layer: Module {
    /// Runs a forward pass.
    fn forward(&self, input: &FeatureMap, training: bool) -> FpnResult<FeatureMap>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Gate {
        weight: Parameter,
    }

    impl Module for Gate {
        fn visit_parameters(
            &self,
            visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
        ) -> FpnResult<()> {
            visitor(&self.weight)
        }

        fn visit_parameters_mut(
            &mut self,
            visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
        ) -> FpnResult<()> {
            visitor(&mut self.weight)
        }
    }

    #[test]
    fn state_dict_round_trip() {
        let mut gate = Gate {
            weight: Parameter::new("gate::w", Tensor::full(1, 2, 1.0).unwrap()),
        };
        let saved = gate.state_dict().unwrap();
        gate.weight.value_mut().data_mut()[0] = 5.0;
        gate.load_state_dict(&saved).unwrap();
        assert_eq!(gate.weight.value().data(), &[1.0, 1.0]);
    }

    #[test]
    fn load_state_dict_reports_missing_parameter() {
        let mut gate = Gate {
            weight: Parameter::new("gate::w", Tensor::full(1, 2, 1.0).unwrap()),
        };
        let err = gate.load_state_dict(&HashMap::new()).unwrap_err();
        assert!(matches!(
            err,
            FpnError::Tensor(TensorError::MissingParameter { .. })
        ));
    }

    #[test]
    fn load_value_rejects_shape_changes() {
        let mut param = Parameter::new("p", Tensor::zeros(1, 2).unwrap());
        let wrong = Tensor::zeros(2, 2).unwrap();
        assert!(param.load_value(&wrong).is_err());
    }
}
