// SPDX-License-Identifier: AGPL-3.0-or-later

//! Serialisation of module parameters to JSON and bincode snapshots.

use crate::error::FpnResult;
use crate::module::Module;
use fpn_tensor::{Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

/// On-disk form of a module's state dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    tensors: HashMap<String, StoredTensor>,
}

impl ModuleSnapshot {
    fn capture<M: Module + ?Sized>(module: &M) -> FpnResult<Self> {
        let mut tensors = HashMap::new();
        for (name, tensor) in module.state_dict()? {
            let (rows, cols) = tensor.shape();
            tensors.insert(
                name,
                StoredTensor {
                    rows,
                    cols,
                    data: tensor.data().to_vec(),
                },
            );
        }
        Ok(Self { tensors })
    }

    fn restore<M: Module + ?Sized>(&self, module: &mut M) -> FpnResult<()> {
        let mut state = HashMap::new();
        for (name, stored) in &self.tensors {
            let tensor = Tensor::from_vec(stored.rows, stored.cols, stored.data.clone())?;
            state.insert(name.clone(), tensor);
        }
        module.load_state_dict(&state)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(message: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: message.to_string(),
    }
}

/// Saves a module's parameters as pretty-printed JSON.
pub fn save_json<M: Module + ?Sized>(module: &M, path: impl AsRef<Path>) -> FpnResult<()> {
    let snapshot = ModuleSnapshot::capture(module)?;
    let file = File::create(path).map_err(io_error)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &snapshot).map_err(serde_error)?;
    Ok(())
}

/// Loads parameters saved by [`save_json`] into an existing module.
pub fn load_json<M: Module + ?Sized>(module: &mut M, path: impl AsRef<Path>) -> FpnResult<()> {
    let file = File::open(path).map_err(io_error)?;
    let snapshot: ModuleSnapshot =
        serde_json::from_reader(BufReader::new(file)).map_err(serde_error)?;
    snapshot.restore(module)
}

/// Saves a module's parameters in the compact bincode format.
pub fn save_bincode<M: Module + ?Sized>(module: &M, path: impl AsRef<Path>) -> FpnResult<()> {
    let snapshot = ModuleSnapshot::capture(module)?;
    let file = File::create(path).map_err(io_error)?;
    bincode::serialize_into(BufWriter::new(file), &snapshot).map_err(serde_error)?;
    Ok(())
}

/// Loads parameters saved by [`save_bincode`] into an existing module.
pub fn load_bincode<M: Module + ?Sized>(module: &mut M, path: impl AsRef<Path>) -> FpnResult<()> {
    let file = File::open(path).map_err(io_error)?;
    let snapshot: ModuleSnapshot =
        bincode::deserialize_from(BufReader::new(file)).map_err(serde_error)?;
    snapshot.restore(module)
}
