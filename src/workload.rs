//! Convolution workloads and the fixed sets the sweep iterates over.

use crate::layout::{filter_shape, ConvKind, DataLayout};
use std::fmt;
use std::str::FromStr;

/// Warmup iterations used by the built-in workload sets.
pub const DEFAULT_WARMUP: usize = 2;
/// Timed iterations used by the built-in workload sets.
pub const DEFAULT_RUNS: usize = 10;

/// One convolution problem instance (batch 1, square spatial extent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkloadSpec {
    pub space: usize,
    pub input_channel: usize,
    pub output_channel: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
    pub depthwise: bool,
    pub warmup: usize,
    pub run: usize,
}

impl WorkloadSpec {
    pub const fn standard(
        space: usize,
        input_channel: usize,
        output_channel: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Self {
        Self {
            space,
            input_channel,
            output_channel,
            kernel,
            stride,
            pad,
            depthwise: false,
            warmup: DEFAULT_WARMUP,
            run: DEFAULT_RUNS,
        }
    }

    /// Depthwise workload with channel multiplier 1.
    pub const fn depthwise(
        space: usize,
        channels: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Self {
        Self {
            space,
            input_channel: channels,
            output_channel: channels,
            kernel,
            stride,
            pad,
            depthwise: true,
            warmup: DEFAULT_WARMUP,
            run: DEFAULT_RUNS,
        }
    }

    pub const fn with_repeats(mut self, warmup: usize, run: usize) -> Self {
        self.warmup = warmup;
        self.run = run;
        self
    }

    pub fn kind(&self) -> ConvKind {
        ConvKind::from_depthwise(self.depthwise)
    }

    pub fn phase(&self) -> &'static str {
        self.kind().phase()
    }

    /// Output spatial extent, or `None` when the padded input is smaller
    /// than the kernel or the stride is zero.
    pub fn output_space(&self) -> Option<usize> {
        let padded = self.space + 2 * self.pad;
        if self.stride == 0 || self.kernel == 0 || padded < self.kernel {
            return None;
        }
        Some((padded - self.kernel) / self.stride + 1)
    }

    pub fn input_shape(&self, layout: DataLayout) -> [usize; 4] {
        layout.activation_shape(self.space, self.input_channel)
    }

    pub fn filter_shape(&self, layout: DataLayout) -> [usize; 4] {
        filter_shape(
            layout,
            self.kind(),
            self.input_channel,
            self.output_channel,
            self.kernel,
        )
    }

    pub fn output_shape(&self, layout: DataLayout) -> Option<[usize; 4]> {
        self.output_space()
            .map(|out| layout.activation_shape(out, self.output_channel))
    }

    /// Multiply-add count times two, the usual FLOP convention.
    pub fn op_count(&self) -> Option<u64> {
        let out = self.output_space()? as u64;
        let reduction = if self.depthwise {
            1
        } else {
            self.input_channel as u64
        };
        let k = self.kernel as u64;
        Some(2 * out * out * self.output_channel as u64 * k * k * reduction)
    }

    /// Symbol name of the compiled kernel for the `index`-th workload of a set.
    pub fn function_name(&self, index: usize) -> String {
        format!(
            "conv_{}_{}_{}_{}_{}_{}",
            index,
            self.phase(),
            self.kernel,
            self.space,
            self.input_channel,
            self.output_channel
        )
    }
}

/// The named workload lists a sweep can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadSet {
    Caffe2Depthwise,
    Caffe2Standard,
    Mobilenet,
}

impl WorkloadSet {
    pub const ALL: [WorkloadSet; 3] = [
        WorkloadSet::Caffe2Depthwise,
        WorkloadSet::Caffe2Standard,
        WorkloadSet::Mobilenet,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WorkloadSet::Caffe2Depthwise => "caffe2_depthwise",
            WorkloadSet::Caffe2Standard => "caffe2_standard",
            WorkloadSet::Mobilenet => "mobilenet",
        }
    }

    pub fn workloads(self) -> &'static [WorkloadSpec] {
        match self {
            WorkloadSet::Caffe2Depthwise => CAFFE2_DEPTHWISE,
            WorkloadSet::Caffe2Standard => CAFFE2_STANDARD,
            WorkloadSet::Mobilenet => MOBILENET,
        }
    }
}

impl fmt::Display for WorkloadSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown workload set '{0}' (expected caffe2_depthwise, caffe2_standard or mobilenet)")]
pub struct UnknownWorkloadSet(pub String);

impl FromStr for WorkloadSet {
    type Err = UnknownWorkloadSet;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caffe2_depthwise" | "depthwise-set" => Ok(WorkloadSet::Caffe2Depthwise),
            "caffe2_standard" | "standard-set" => Ok(WorkloadSet::Caffe2Standard),
            "mobilenet" | "mobile-set" => Ok(WorkloadSet::Mobilenet),
            other => Err(UnknownWorkloadSet(other.to_string())),
        }
    }
}

const CAFFE2_DEPTHWISE: &[WorkloadSpec] = &[
    WorkloadSpec::depthwise(112, 32, 3, 1, 1),
    WorkloadSpec::depthwise(112, 64, 3, 2, 1),
    WorkloadSpec::depthwise(56, 128, 3, 1, 1),
    WorkloadSpec::depthwise(56, 128, 3, 2, 1),
    WorkloadSpec::depthwise(28, 256, 3, 1, 1),
    WorkloadSpec::depthwise(28, 256, 3, 2, 1),
    WorkloadSpec::depthwise(14, 512, 3, 1, 1),
    WorkloadSpec::depthwise(56, 32, 5, 1, 2),
];

const CAFFE2_STANDARD: &[WorkloadSpec] = &[
    WorkloadSpec::standard(56, 32, 64, 3, 1, 1),
    WorkloadSpec::standard(56, 64, 64, 1, 1, 0),
    WorkloadSpec::standard(28, 128, 128, 3, 1, 1),
    WorkloadSpec::standard(28, 128, 256, 1, 1, 0),
    WorkloadSpec::standard(14, 256, 256, 3, 1, 1),
    WorkloadSpec::standard(14, 256, 512, 3, 2, 1),
    WorkloadSpec::standard(7, 512, 512, 3, 1, 1),
    WorkloadSpec::standard(112, 3, 32, 3, 2, 1),
];

// MobileNet v1 at 224x224, repeated 14x14 blocks collapsed to one.
const MOBILENET: &[WorkloadSpec] = &[
    WorkloadSpec::standard(224, 3, 32, 3, 2, 1),
    WorkloadSpec::depthwise(112, 32, 3, 1, 1),
    WorkloadSpec::standard(112, 32, 64, 1, 1, 0),
    WorkloadSpec::depthwise(112, 64, 3, 2, 1),
    WorkloadSpec::standard(56, 64, 128, 1, 1, 0),
    WorkloadSpec::depthwise(56, 128, 3, 1, 1),
    WorkloadSpec::standard(56, 128, 128, 1, 1, 0),
    WorkloadSpec::depthwise(56, 128, 3, 2, 1),
    WorkloadSpec::standard(28, 128, 256, 1, 1, 0),
    WorkloadSpec::depthwise(28, 256, 3, 1, 1),
    WorkloadSpec::standard(28, 256, 256, 1, 1, 0),
    WorkloadSpec::depthwise(28, 256, 3, 2, 1),
    WorkloadSpec::standard(14, 256, 512, 1, 1, 0),
    WorkloadSpec::depthwise(14, 512, 3, 1, 1),
    WorkloadSpec::standard(14, 512, 512, 1, 1, 0),
    WorkloadSpec::depthwise(14, 512, 3, 2, 1),
    WorkloadSpec::standard(7, 512, 1024, 1, 1, 0),
    WorkloadSpec::depthwise(7, 1024, 3, 1, 1),
    WorkloadSpec::standard(7, 1024, 1024, 1, 1, 0),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_shapes() {
        let w = WorkloadSpec::standard(56, 32, 64, 3, 1, 1);
        assert_eq!(w.input_shape(DataLayout::Nchw), [1, 32, 56, 56]);
        assert_eq!(w.filter_shape(DataLayout::Nchw), [64, 32, 3, 3]);
        assert_eq!(w.output_shape(DataLayout::Nchw), Some([1, 64, 56, 56]));
    }

    #[test]
    fn test_strided_output_space() {
        let w = WorkloadSpec::depthwise(32, 32, 3, 2, 1);
        assert_eq!(w.output_space(), Some(16));
        assert_eq!(w.output_shape(DataLayout::Nhwc), Some([1, 16, 16, 32]));
    }

    #[test]
    fn test_empty_output() {
        let w = WorkloadSpec::standard(2, 4, 4, 5, 1, 0);
        assert_eq!(w.output_space(), None);
        assert_eq!(w.op_count(), None);
    }

    #[test]
    fn test_op_count() {
        let dense = WorkloadSpec::standard(4, 2, 3, 3, 1, 1);
        assert_eq!(dense.op_count(), Some(2 * 16 * 3 * 9 * 2));
        let dw = WorkloadSpec::depthwise(4, 3, 3, 1, 1);
        assert_eq!(dw.op_count(), Some(2 * 16 * 3 * 9));
    }

    #[test]
    fn test_function_name_is_c_identifier() {
        let name = WorkloadSpec::depthwise(56, 32, 3, 1, 1).function_name(4);
        assert_eq!(name, "conv_4_depthwise_3_56_32_32");
        assert!(!name.starts_with(|c: char| c.is_ascii_digit()));
    }

    #[test]
    fn test_workload_set_aliases() {
        assert_eq!(
            "mobile-set".parse::<WorkloadSet>().unwrap(),
            WorkloadSet::Mobilenet
        );
        assert_eq!(
            "caffe2_standard".parse::<WorkloadSet>().unwrap(),
            WorkloadSet::Caffe2Standard
        );
        assert!("resnet".parse::<WorkloadSet>().is_err());
    }

    #[test]
    fn test_builtin_sets_are_well_formed() {
        for set in WorkloadSet::ALL {
            assert!(!set.workloads().is_empty());
            for w in set.workloads() {
                assert!(w.output_space().is_some(), "{set}: {w:?}");
                if w.depthwise {
                    assert_eq!(w.output_channel % w.input_channel, 0);
                }
            }
        }
    }
}
