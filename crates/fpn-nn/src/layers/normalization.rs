// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{FpnError, FpnResult};
use crate::feature::FeatureMap;
use crate::module::{Layer, Module, Parameter};
use fpn_tensor::{Tensor, TensorError};
use std::cell::RefCell;

/// Per-channel batch normalisation over the batch and spatial axes.
///
/// Running statistics live behind `RefCell` so a training forward pass can
/// update them through a shared reference; they are not part of the
/// state-dict surface. `momentum` is the fraction of the fresh batch
/// statistic blended into the running value.
#[derive(Debug)]
pub struct BatchNorm2d {
    channels: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,
}

impl BatchNorm2d {
    pub fn new(name: impl Into<String>, channels: usize) -> FpnResult<Self> {
        if channels == 0 {
            return Err(FpnError::Tensor(TensorError::InvalidValue {
                label: "batchnorm_channels",
            }));
        }
        let name = name.into();
        Ok(Self {
            channels,
            epsilon: 1e-3,
            momentum: 0.01,
            gamma: Parameter::new(format!("{name}::gamma"), Tensor::full(1, channels, 1.0)?),
            beta: Parameter::new(format!("{name}::beta"), Tensor::zeros(1, channels)?),
            running_mean: RefCell::new(vec![0.0; channels]),
            running_var: RefCell::new(vec![1.0; channels]),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.borrow().clone()
    }

    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.borrow().clone()
    }
}

impl Module for BatchNorm2d {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> FpnResult<()>,
    ) -> FpnResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }
}

impl Layer for BatchNorm2d {
    fn forward(&self, input: &FeatureMap, training: bool) -> FpnResult<FeatureMap> {
        if input.channels() != self.channels {
            return Err(FpnError::Tensor(TensorError::ShapeMismatch {
                left: (1, input.channels()),
                right: (1, self.channels),
            }));
        }
        let (batch, channels, h, w) = input.shape();
        let plane = h * w;
        let cols = channels * plane;
        let count = (batch * plane) as f32;
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let input_data = input.data();

        let (means, vars) = if training {
            let mut means = vec![0.0f32; channels];
            let mut vars = vec![0.0f32; channels];
            for c in 0..channels {
                let mut sum = 0.0f32;
                for b in 0..batch {
                    let start = b * cols + c * plane;
                    for value in &input_data[start..start + plane] {
                        sum += value;
                    }
                }
                let mean = sum / count;
                let mut var_sum = 0.0f32;
                for b in 0..batch {
                    let start = b * cols + c * plane;
                    for value in &input_data[start..start + plane] {
                        let diff = value - mean;
                        var_sum += diff * diff;
                    }
                }
                means[c] = mean;
                vars[c] = var_sum / count;
            }
            {
                let mut running_mean = self.running_mean.borrow_mut();
                let mut running_var = self.running_var.borrow_mut();
                for c in 0..channels {
                    running_mean[c] =
                        self.momentum * means[c] + (1.0 - self.momentum) * running_mean[c];
                    running_var[c] =
                        self.momentum * vars[c] + (1.0 - self.momentum) * running_var[c];
                }
            }
            (means, vars)
        } else {
            (self.running_mean(), self.running_var())
        };

        let mut out = FeatureMap::zeros(batch, channels, h, w)?;
        let out_data = out.data_mut();
        for c in 0..channels {
            let inv_std = 1.0 / (vars[c] + self.epsilon).sqrt();
            let scale = gamma[c] * inv_std;
            let shift = beta[c] - means[c] * scale;
            for b in 0..batch {
                let start = b * cols + c * plane;
                for i in start..start + plane {
                    out_data[i] = input_data[i] * scale + shift;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_pass_normalises_each_channel() {
        let bn = BatchNorm2d::new("bn", 2).unwrap();
        let input = FeatureMap::from_fn(1, 2, 1, 4, |_, c, _, x| {
            (c as f32 + 1.0) * (x as f32)
        })
        .unwrap();
        let out = bn.forward(&input, true).unwrap();
        for c in 0..2 {
            let mut sum = 0.0f32;
            let mut sq = 0.0f32;
            for x in 0..4 {
                let v = out.at(0, c, 0, x);
                sum += v;
                sq += v * v;
            }
            assert!(sum.abs() < 1e-4);
            let var = sq / 4.0;
            assert!((var - 1.0).abs() < 0.05, "channel {c} var {var}");
        }
    }

    #[test]
    fn training_pass_updates_running_statistics() {
        let bn = BatchNorm2d::new("bn", 1).unwrap();
        let input = FeatureMap::from_fn(1, 1, 1, 4, |_, _, _, x| x as f32 * 2.0).unwrap();
        bn.forward(&input, true).unwrap();
        let mean = bn.running_mean()[0];
        // batch mean is 3.0, blended at momentum 0.01 into a zero start
        assert!((mean - 0.03).abs() < 1e-6, "running mean {mean}");
    }

    #[test]
    fn eval_pass_uses_running_statistics() {
        let bn = BatchNorm2d::new("bn", 1).unwrap();
        let input = FeatureMap::from_fn(1, 1, 2, 2, |_, _, y, x| (y * 2 + x) as f32).unwrap();
        let out = bn.forward(&input, false).unwrap();
        // fresh running stats are mean 0, var 1, gamma 1, beta 0
        for (got, want) in out.data().iter().zip(input.data().iter()) {
            let expected = want / (1.0f32 + 1e-3).sqrt();
            assert!((got - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_channel_mismatch() {
        let bn = BatchNorm2d::new("bn", 3).unwrap();
        let input = FeatureMap::zeros(1, 2, 2, 2).unwrap();
        assert!(bn.forward(&input, false).is_err());
    }
}
