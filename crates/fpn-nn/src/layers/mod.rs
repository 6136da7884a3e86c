// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod activation;
pub mod conv;
pub mod normalization;

pub use activation::Swish;
pub use conv::{pool2d_same, upsample_nearest, Conv2dSame, PoolingType, SeparableConv2dSame};
pub use normalization::BatchNorm2d;
