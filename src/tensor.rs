//! Host-side tensors handed to compiled kernels.
//!
//! Kernels receive raw pointers to contiguous row-major storage, so every
//! constructor here produces arrays in standard layout.

use crate::dtype::DType;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;

#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("expected {expected} bytes for {dtype} tensor of shape {shape:?}, got {actual}")]
    ByteLength {
        dtype: DType,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("invalid tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// A dense tensor whose element type is chosen at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum HostTensor {
    I8(ArrayD<i8>),
    I32(ArrayD<i32>),
    F32(ArrayD<f32>),
}

impl HostTensor {
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let dim = IxDyn(shape);
        match dtype {
            DType::I8 => HostTensor::I8(ArrayD::zeros(dim)),
            DType::I32 => HostTensor::I32(ArrayD::zeros(dim)),
            DType::F32 => HostTensor::F32(ArrayD::zeros(dim)),
        }
    }

    /// Uniform random contents: floats in `[0, 1)`, integers in `[-8, 8)`.
    ///
    /// Integer values stay small so an int32 accumulator cannot overflow on
    /// any of the built-in workloads.
    pub fn random<R: Rng + ?Sized>(dtype: DType, shape: &[usize], rng: &mut R) -> Self {
        let dim = IxDyn(shape);
        match dtype {
            DType::I8 => HostTensor::I8(ArrayD::from_shape_simple_fn(dim, || {
                rng.gen_range(-8i8..8)
            })),
            DType::I32 => HostTensor::I32(ArrayD::from_shape_simple_fn(dim, || {
                rng.gen_range(-8i32..8)
            })),
            DType::F32 => HostTensor::F32(ArrayD::from_shape_simple_fn(dim, || rng.gen::<f32>())),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            HostTensor::I8(_) => DType::I8,
            HostTensor::I32(_) => DType::I32,
            HostTensor::F32(_) => DType::F32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            HostTensor::I8(a) => a.shape(),
            HostTensor::I32(a) => a.shape(),
            HostTensor::F32(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    /// Pointer to the first element of the contiguous storage.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            HostTensor::I8(a) => a.as_mut_ptr() as *mut u8,
            HostTensor::I32(a) => a.as_mut_ptr() as *mut u8,
            HostTensor::F32(a) => a.as_mut_ptr() as *mut u8,
        }
    }

    /// Little-endian byte image of the elements in row-major order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            HostTensor::I8(a) => a.iter().map(|v| *v as u8).collect(),
            HostTensor::I32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            HostTensor::F32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn from_le_bytes(dtype: DType, shape: &[usize], bytes: &[u8]) -> Result<Self, TensorError> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(TensorError::ByteLength {
                dtype,
                shape: shape.to_vec(),
                expected,
                actual: bytes.len(),
            });
        }
        let dim = IxDyn(shape);
        let tensor = match dtype {
            DType::I8 => {
                HostTensor::I8(ArrayD::from_shape_vec(dim, bytes.iter().map(|b| *b as i8).collect())?)
            }
            DType::I32 => HostTensor::I32(ArrayD::from_shape_vec(
                dim,
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )?),
            DType::F32 => HostTensor::F32(ArrayD::from_shape_vec(
                dim,
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )?),
        };
        Ok(tensor)
    }

    /// Widened copy used by the reference implementation.
    pub fn to_f64(&self) -> ArrayD<f64> {
        match self {
            HostTensor::I8(a) => a.mapv(f64::from),
            HostTensor::I32(a) => a.mapv(f64::from),
            HostTensor::F32(a) => a.mapv(f64::from),
        }
    }

    /// Overwrites the contents with `other`, which must match in type and shape.
    pub fn copy_from(&mut self, other: &HostTensor) -> Result<(), TensorError> {
        if self.dtype() != other.dtype() || self.shape() != other.shape() {
            return Err(TensorError::ByteLength {
                dtype: self.dtype(),
                shape: self.shape().to_vec(),
                expected: self.byte_len(),
                actual: other.byte_len(),
            });
        }
        match (self, other) {
            (HostTensor::I8(dst), HostTensor::I8(src)) => dst.assign(src),
            (HostTensor::I32(dst), HostTensor::I32(src)) => dst.assign(src),
            (HostTensor::F32(dst), HostTensor::F32(src)) => dst.assign(src),
            _ => unreachable!("dtype checked above"),
        }
        Ok(())
    }
}

/// The three kernel arguments of one workload, always passed in
/// `(input, filter, output)` order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBuffers {
    pub input: HostTensor,
    pub filter: HostTensor,
    pub output: HostTensor,
}

impl DeviceBuffers {
    pub fn args_mut(&mut self) -> [&mut HostTensor; 3] {
        [&mut self.input, &mut self.filter, &mut self.output]
    }

    pub fn args(&self) -> [&HostTensor; 3] {
        [&self.input, &self.filter, &self.output]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        let HostTensor::I8(a) = HostTensor::random(DType::I8, &[4, 4, 4], &mut rng) else {
            panic!("expected int8 tensor");
        };
        assert!(a.iter().all(|v| (-8..8).contains(v)));

        let HostTensor::F32(b) = HostTensor::random(DType::F32, &[64], &mut rng) else {
            panic!("expected float tensor");
        };
        assert!(b.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_byte_image_roundtrip() {
        let mut rng = StdRng::seed_from_u64(11);
        let t = HostTensor::random(DType::I32, &[2, 3], &mut rng);
        let bytes = t.to_le_bytes();
        assert_eq!(bytes.len(), t.byte_len());
        let back = HostTensor::from_le_bytes(DType::I32, &[2, 3], &bytes).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        let err = HostTensor::from_le_bytes(DType::F32, &[2, 2], &[0u8; 15]).unwrap_err();
        assert!(matches!(err, TensorError::ByteLength { expected: 16, .. }));
    }

    #[test]
    fn test_copy_from_checks_shape() {
        let mut dst = HostTensor::zeros(DType::F32, &[2]);
        let src = HostTensor::zeros(DType::F32, &[3]);
        assert!(dst.copy_from(&src).is_err());
    }
}
