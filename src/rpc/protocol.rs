//! HTTP API of the device server
//!
//! ```text
//! GET    /health
//! POST   /sessions                                   DeviceRequest -> Granted
//! DELETE /sessions/:session
//! POST   /sessions/:session/uploads/:name            library bytes -> Uploaded
//! POST   /sessions/:session/modules                  LoadModule -> Loaded
//! POST   /sessions/:session/modules/:module/invoke   argument bytes -> output bytes
//! POST   /sessions/:session/modules/:module/time     argument bytes -> output bytes
//! DELETE /sessions/:session/modules/:module
//! ```
//!
//! Tensor contents never pass through JSON. Kernel arguments travel as the
//! little-endian bytes of input, filter and output back to back, with their
//! signature in [`ARGS_HEADER`]; the reply carries the output bytes and
//! describes them in [`OUTPUT_HEADER`].

use crate::dtype::DType;
use crate::tensor::{DeviceBuffers, HostTensor};
use serde::{Deserialize, Serialize};

pub const ARGS_HEADER: &str = "x-convsweep-args";
pub const OUTPUT_HEADER: &str = "x-convsweep-output";
pub const MEAN_HEADER: &str = "x-convsweep-mean";

/// Upper bound on a request body, in bytes.
pub const MAX_BODY_LEN: usize = 1 << 30;

/// Type and shape of one tensor carried in a body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTensor {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl WireTensor {
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
        }
    }

    pub fn of(tensor: &HostTensor) -> Self {
        Self::new(tensor.dtype(), tensor.shape())
    }

    pub fn byte_len(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size_in_bytes()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Granted {
    pub session: u64,
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uploaded {
    pub name: String,
    pub bytes: u64,
}

/// Loads the latest upload of `name`. Every later call must pass
/// arguments matching `signature`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModule {
    pub name: String,
    pub signature: Vec<WireTensor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loaded {
    pub module: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeQuery {
    pub number: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn signature(buffers: &DeviceBuffers) -> Vec<WireTensor> {
    buffers.args().iter().map(|t| WireTensor::of(t)).collect()
}

pub fn pack_args(buffers: &DeviceBuffers) -> Vec<u8> {
    let mut body = Vec::new();
    for tensor in buffers.args() {
        body.extend_from_slice(&tensor.to_le_bytes());
    }
    body
}

pub fn unpack_args(args: &[WireTensor], body: &[u8]) -> Result<DeviceBuffers, String> {
    let [input, filter, output] = args else {
        return Err(format!("expected 3 kernel arguments, got {}", args.len()));
    };
    let total: usize = args.iter().map(WireTensor::byte_len).sum();
    if total != body.len() {
        return Err(format!(
            "arguments describe {total} bytes, body has {}",
            body.len()
        ));
    }
    let (input_bytes, rest) = body.split_at(input.byte_len());
    let (filter_bytes, output_bytes) = rest.split_at(filter.byte_len());
    let tensor = |wire: &WireTensor, bytes: &[u8]| {
        HostTensor::from_le_bytes(wire.dtype, &wire.shape, bytes).map_err(|e| e.to_string())
    };
    Ok(DeviceBuffers {
        input: tensor(input, input_bytes)?,
        filter: tensor(filter, filter_bytes)?,
        output: tensor(output, output_bytes)?,
    })
}
