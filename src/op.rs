//! Symbolic convolution operators.
//!
//! A [`ConvOp`] fixes every shape and type of one workload in one layout. Its
//! [`ConvOp::lowering`] picks the index arithmetic for one of the six
//! `(layout, kind)` combinations; the renderer only ever sees the result.

use crate::dtype::DType;
use crate::layout::{ConvKind, DataLayout};
use crate::schedule::ScheduleError;
use crate::tensor::{DeviceBuffers, HostTensor};
use crate::workload::WorkloadSpec;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct ConvOp {
    /// C symbol of the kernel built from this operator
    pub name: String,
    pub kind: ConvKind,
    pub layout: DataLayout,
    pub workload: WorkloadSpec,
    pub input_shape: [usize; 4],
    pub filter_shape: [usize; 4],
    pub output_shape: [usize; 4],
    pub output_space: usize,
    /// Depthwise channel multiplier; 1 for dense convolutions
    pub multiplier: usize,
    pub in_dtype: DType,
    pub out_dtype: DType,
}

/// How the reduction loop covers input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Dense: every input channel contributes to every output channel.
    AllChannels,
    /// Depthwise: output channel `oc` reads input channel `oc / multiplier`.
    SingleChannel,
}

/// Flattened C index expressions for one `(layout, kind)` case.
///
/// Expressions refer to the loop variables `oc`, `oh`, `ow`, `ic`, `ih`,
/// `iw`, `kh`, `kw` and, for depthwise kernels, `q = oc % multiplier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvLowering {
    pub input_index: String,
    pub filter_index: String,
    pub output_index: String,
    pub reduction: Reduction,
}

impl ConvOp {
    pub fn new(
        name: impl Into<String>,
        workload: &WorkloadSpec,
        layout: DataLayout,
        dtype: DType,
    ) -> Result<Self, ScheduleError> {
        let kind = workload.kind();
        if workload.input_channel == 0 || workload.output_channel == 0 {
            return Err(ScheduleError::EmptyChannels);
        }
        let multiplier = match kind {
            ConvKind::Dense => 1,
            ConvKind::Depthwise => {
                if workload.output_channel % workload.input_channel != 0 {
                    return Err(ScheduleError::ChannelMultiplier {
                        input: workload.input_channel,
                        output: workload.output_channel,
                    });
                }
                workload.output_channel / workload.input_channel
            }
        };
        let output_space = workload
            .output_space()
            .ok_or(ScheduleError::EmptyOutput {
                space: workload.space,
                kernel: workload.kernel,
                stride: workload.stride,
                pad: workload.pad,
            })?;

        Ok(Self {
            name: name.into(),
            kind,
            layout,
            workload: *workload,
            input_shape: workload.input_shape(layout),
            filter_shape: workload.filter_shape(layout),
            output_shape: layout.activation_shape(output_space, workload.output_channel),
            output_space,
            multiplier,
            in_dtype: dtype,
            out_dtype: dtype.accumulator(),
        })
    }

    /// Key under which tuned schedules for this operator are recorded.
    pub fn workload_key(&self) -> String {
        let w = &self.workload;
        format!(
            "{}_{}_{}_s{}_c{}_o{}_k{}_st{}_p{}",
            self.layout,
            self.kind,
            self.in_dtype,
            w.space,
            w.input_channel,
            w.output_channel,
            w.kernel,
            w.stride,
            w.pad
        )
    }

    pub fn op_count(&self) -> u64 {
        // output_space exists, checked in new()
        self.workload.op_count().unwrap_or(0)
    }

    pub fn lowering(&self) -> ConvLowering {
        let c = self.workload.input_channel;
        let o = self.workload.output_channel;
        let h = self.workload.space;
        let w = self.workload.space;
        let k = self.workload.kernel;
        let m = self.multiplier;
        let (oh, ow) = (self.output_space, self.output_space);

        let (input_index, filter_index, output_index, reduction) = match (self.layout, self.kind)
        {
            (DataLayout::Nchw, ConvKind::Dense) => (
                format!("(ic * {h} + ih) * {w} + iw"),
                format!("((oc * {c} + ic) * {k} + kh) * {k} + kw"),
                format!("(oc * {oh} + oh) * {ow} + ow"),
                Reduction::AllChannels,
            ),
            (DataLayout::Nchw, ConvKind::Depthwise) => (
                format!("(ic * {h} + ih) * {w} + iw"),
                format!("((ic * {m} + q) * {k} + kh) * {k} + kw"),
                format!("(oc * {oh} + oh) * {ow} + ow"),
                Reduction::SingleChannel,
            ),
            (DataLayout::Nhwc, ConvKind::Dense) => (
                format!("(ih * {w} + iw) * {c} + ic"),
                format!("((kh * {k} + kw) * {c} + ic) * {o} + oc"),
                format!("(oh * {ow} + ow) * {o} + oc"),
                Reduction::AllChannels,
            ),
            (DataLayout::Nhwc, ConvKind::Depthwise) => (
                format!("(ih * {w} + iw) * {c} + ic"),
                format!("((kh * {k} + kw) * {c} + ic) * {m} + q"),
                format!("(oh * {ow} + ow) * {o} + oc"),
                Reduction::SingleChannel,
            ),
            // batch is the innermost axis and fixed at 1
            (DataLayout::Hwcn, ConvKind::Dense) => (
                format!("((ih * {w} + iw) * {c} + ic) * 1"),
                format!("((kh * {k} + kw) * {c} + ic) * {o} + oc"),
                format!("((oh * {ow} + ow) * {o} + oc) * 1"),
                Reduction::AllChannels,
            ),
            (DataLayout::Hwcn, ConvKind::Depthwise) => (
                format!("((ih * {w} + iw) * {c} + ic) * 1"),
                format!("((kh * {k} + kw) * {c} + ic) * {m} + q"),
                format!("((oh * {ow} + ow) * {o} + oc) * 1"),
                Reduction::SingleChannel,
            ),
        };

        ConvLowering {
            input_index,
            filter_index,
            output_index,
            reduction,
        }
    }

    /// Fresh buffers for one run: random operands and a zeroed output.
    pub fn allocate_buffers<R: Rng + ?Sized>(&self, rng: &mut R) -> DeviceBuffers {
        DeviceBuffers {
            input: HostTensor::random(self.in_dtype, &self.input_shape, rng),
            filter: HostTensor::random(self.in_dtype, &self.filter_shape, rng),
            output: HostTensor::zeros(self.out_dtype, &self.output_shape),
        }
    }

    /// Checks that `buffers` match the kernel signature before raw pointers
    /// are handed to compiled code.
    pub fn check_buffers(&self, buffers: &DeviceBuffers) -> Result<(), String> {
        let expected = [
            ("input", self.in_dtype, &self.input_shape),
            ("filter", self.in_dtype, &self.filter_shape),
            ("output", self.out_dtype, &self.output_shape),
        ];
        for ((label, dtype, shape), tensor) in expected.into_iter().zip(buffers.args()) {
            if tensor.dtype() != dtype || tensor.shape() != shape.as_slice() {
                return Err(format!(
                    "{label} buffer is {} {:?}, kernel expects {dtype} {shape:?}",
                    tensor.dtype(),
                    tensor.shape()
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn op(workload: WorkloadSpec, layout: DataLayout, dtype: DType) -> ConvOp {
        ConvOp::new("conv_test", &workload, layout, dtype).unwrap()
    }

    #[test]
    fn test_int8_promotes_output() {
        let w = WorkloadSpec::depthwise(32, 32, 3, 2, 1);
        let conv = op(w, DataLayout::Nhwc, DType::I8);
        assert_eq!(conv.out_dtype, DType::I32);
        assert_eq!(conv.output_shape, [1, 16, 16, 32]);
        assert_eq!(conv.lowering().reduction, Reduction::SingleChannel);
    }

    #[test]
    fn test_float_keeps_width() {
        let w = WorkloadSpec::standard(56, 32, 64, 3, 1, 1);
        let conv = op(w, DataLayout::Nchw, DType::F32);
        assert_eq!(conv.out_dtype, DType::F32);
        assert_eq!(conv.input_shape, [1, 32, 56, 56]);
        assert_eq!(conv.filter_shape, [64, 32, 3, 3]);
    }

    #[test]
    fn test_depthwise_multiplier_must_divide() {
        let mut w = WorkloadSpec::depthwise(8, 3, 3, 1, 1);
        w.output_channel = 4;
        let err = ConvOp::new("bad", &w, DataLayout::Nchw, DType::F32).unwrap_err();
        assert!(matches!(err, ScheduleError::ChannelMultiplier { input: 3, output: 4 }));
    }

    #[test]
    fn test_empty_output_rejected() {
        let w = WorkloadSpec::standard(2, 1, 1, 7, 1, 0);
        let err = ConvOp::new("bad", &w, DataLayout::Nchw, DType::F32).unwrap_err();
        assert!(matches!(err, ScheduleError::EmptyOutput { .. }));
    }

    #[test]
    fn test_each_case_has_distinct_filter_indexing() {
        let dense = WorkloadSpec::standard(8, 4, 4, 3, 1, 1);
        let dw = WorkloadSpec::depthwise(8, 4, 3, 1, 1);
        let nchw_dense = op(dense, DataLayout::Nchw, DType::F32).lowering();
        let nchw_dw = op(dw, DataLayout::Nchw, DType::F32).lowering();
        let nhwc_dense = op(dense, DataLayout::Nhwc, DType::F32).lowering();
        assert_ne!(nchw_dense.filter_index, nchw_dw.filter_index);
        assert_ne!(nchw_dense.input_index, nhwc_dense.input_index);
        assert!(nchw_dw.filter_index.contains('q'));
    }

    #[test]
    fn test_workload_key_is_stable() {
        let w = WorkloadSpec::standard(56, 32, 64, 3, 1, 1);
        let conv = op(w, DataLayout::Nchw, DType::I8);
        assert_eq!(conv.workload_key(), "NCHW_standard_int8_s56_c32_o64_k3_st1_p1");
    }

    #[test]
    fn test_allocated_buffers_match_signature() {
        let w = WorkloadSpec::standard(6, 2, 3, 3, 1, 1);
        let conv = op(w, DataLayout::Hwcn, DType::I8);
        let mut rng = StdRng::seed_from_u64(1);
        let mut buffers = conv.allocate_buffers(&mut rng);
        assert!(conv.check_buffers(&buffers).is_ok());
        buffers.output = HostTensor::zeros(DType::I8, &conv.output_shape);
        assert!(conv.check_buffers(&buffers).is_err());
    }
}
