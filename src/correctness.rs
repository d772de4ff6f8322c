//! Reference checking
//!
//! [`NdarrayReference`] permutes every tensor into NCHW (filters into
//! `O I H W` or `C M H W`), recomputes the convolution directly in `f64` and
//! compares element by element. The comparison is deterministic: the same
//! case always gets the same verdict.

use crate::dtype::DType;
use crate::layout::{filter_to_canonical, ConvKind, DataLayout};
use crate::op::ConvOp;
use crate::tensor::{DeviceBuffers, HostTensor};
use ndarray::{Array4, ArrayD, Ix4};

/// Absolute part of the float tolerance
pub const FLOAT_ATOL: f64 = 1e-3;
/// Relative part of the float tolerance
pub const FLOAT_RTOL: f64 = 1e-3;

/// Everything needed to recompute one convolution.
#[derive(Debug, Clone, Copy)]
pub struct CheckCase<'a> {
    pub input_channel: usize,
    pub output_channel: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
    pub input: &'a HostTensor,
    pub filter: &'a HostTensor,
    pub output: &'a HostTensor,
    /// Element type of input and filter
    pub dtype: DType,
    pub layout: DataLayout,
    pub depthwise: bool,
}

impl<'a> CheckCase<'a> {
    pub fn new(op: &ConvOp, buffers: &'a DeviceBuffers) -> Self {
        let w = &op.workload;
        Self {
            input_channel: w.input_channel,
            output_channel: w.output_channel,
            kernel: w.kernel,
            stride: w.stride,
            pad: w.pad,
            input: &buffers.input,
            filter: &buffers.filter,
            output: &buffers.output,
            dtype: op.in_dtype,
            layout: op.layout,
            depthwise: w.depthwise,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Match,
    Mismatch { diagnostic: String },
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }

    fn mismatch(diagnostic: impl Into<String>) -> Self {
        Verdict::Mismatch {
            diagnostic: diagnostic.into(),
        }
    }
}

pub trait ReferenceChecker {
    fn check(&self, case: &CheckCase<'_>) -> Verdict;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NdarrayReference;

impl NdarrayReference {
    fn to_nchw(tensor: &HostTensor, perm: [usize; 4]) -> Result<Array4<f64>, String> {
        let array: ArrayD<f64> = tensor.to_f64();
        let array = array
            .into_dimensionality::<Ix4>()
            .map_err(|_| format!("expected a 4-d tensor, got shape {:?}", tensor.shape()))?;
        Ok(array.permuted_axes(perm).as_standard_layout().into_owned())
    }

    /// Direct convolution over NCHW input and canonical filter.
    fn convolve(
        input: &Array4<f64>,
        filter: &Array4<f64>,
        case: &CheckCase<'_>,
    ) -> Result<Array4<f64>, String> {
        let (_, channels, height, width) = input.dim();
        let k = case.kernel;
        let (s, p) = (case.stride, case.pad);
        if channels != case.input_channel || height != width {
            return Err(format!(
                "input has {channels} channels and {height}x{width} extent"
            ));
        }
        if s == 0 || k == 0 || height + 2 * p < k {
            return Err(format!("kernel {k} stride {s} pad {p} leave no output"));
        }
        let out_space = (height + 2 * p - k) / s + 1;
        let kind = ConvKind::from_depthwise(case.depthwise);
        let multiplier = case.output_channel / case.input_channel.max(1);
        let expected_filter = match kind {
            ConvKind::Dense => (case.output_channel, case.input_channel, k, k),
            ConvKind::Depthwise => (case.input_channel, multiplier, k, k),
        };
        if filter.dim() != expected_filter {
            return Err(format!(
                "filter has shape {:?}, expected {:?}",
                filter.shape(),
                expected_filter
            ));
        }

        let mut out = Array4::<f64>::zeros((1, case.output_channel, out_space, out_space));
        for oc in 0..case.output_channel {
            let channels_in = match kind {
                ConvKind::Dense => 0..channels,
                ConvKind::Depthwise => (oc / multiplier)..(oc / multiplier + 1),
            };
            for oh in 0..out_space {
                for ow in 0..out_space {
                    let mut acc = 0.0;
                    for ic in channels_in.clone() {
                        for kh in 0..k {
                            let Some(ih) = (oh * s + kh).checked_sub(p) else {
                                continue;
                            };
                            if ih >= height {
                                continue;
                            }
                            for kw in 0..k {
                                let Some(iw) = (ow * s + kw).checked_sub(p) else {
                                    continue;
                                };
                                if iw >= width {
                                    continue;
                                }
                                let weight = match kind {
                                    ConvKind::Dense => filter[[oc, ic, kh, kw]],
                                    ConvKind::Depthwise => filter[[ic, oc % multiplier, kh, kw]],
                                };
                                acc += input[[0, ic, ih, iw]] * weight;
                            }
                        }
                    }
                    out[[0, oc, oh, ow]] = acc;
                }
            }
        }
        Ok(out)
    }

    fn compare(expected: &Array4<f64>, actual: &Array4<f64>, exact: bool) -> Verdict {
        if expected.dim() != actual.dim() {
            return Verdict::mismatch(format!(
                "output shape {:?} (as NCHW), expected {:?}",
                actual.shape(),
                expected.shape()
            ));
        }
        let mut mismatched = 0usize;
        let mut worst: Option<((usize, usize, usize, usize), f64, f64, f64)> = None;
        for ((idx, e), a) in expected.indexed_iter().zip(actual.iter()) {
            let diff = (e - a).abs();
            let ok = if exact {
                diff == 0.0
            } else {
                diff <= FLOAT_ATOL + FLOAT_RTOL * e.abs()
            };
            if !ok {
                mismatched += 1;
                if worst.map_or(true, |(_, _, _, d)| diff > d || d.is_nan()) {
                    worst = Some((idx, *e, *a, diff));
                }
            }
        }
        match worst {
            None => Verdict::Match,
            Some(((_, oc, oh, ow), e, a, _)) => Verdict::mismatch(format!(
                "{mismatched} of {} elements differ; worst at channel {oc}, row {oh}, column {ow}: expected {e}, got {a}",
                expected.len()
            )),
        }
    }
}

impl ReferenceChecker for NdarrayReference {
    fn check(&self, case: &CheckCase<'_>) -> Verdict {
        Self::evaluate(case).unwrap_or_else(Verdict::mismatch)
    }
}

impl NdarrayReference {
    fn evaluate(case: &CheckCase<'_>) -> Result<Verdict, String> {
        if case.input.dtype() != case.dtype || case.filter.dtype() != case.dtype {
            return Err(format!(
                "operands are {}/{}, expected {}",
                case.input.dtype(),
                case.filter.dtype(),
                case.dtype
            ));
        }
        if case.output.dtype() != case.dtype.accumulator() {
            return Err(format!(
                "output is {}, expected {}",
                case.output.dtype(),
                case.dtype.accumulator()
            ));
        }
        let kind = ConvKind::from_depthwise(case.depthwise);
        let input = Self::to_nchw(case.input, case.layout.activation_to_nchw())?;
        let filter = Self::to_nchw(case.filter, filter_to_canonical(case.layout, kind))?;
        let actual = Self::to_nchw(case.output, case.layout.activation_to_nchw())?;
        let expected = Self::convolve(&input, &filter, case)?;
        Ok(Self::compare(&expected, &actual, !case.output.dtype().is_float()))
    }
}
