//! Tensor axis orderings and the convolution variants built on top of them.

use std::fmt;
use std::str::FromStr;

/// Axis ordering of activation tensors.
///
/// Filters follow the matching convention: `NCHW` pairs with `OIHW`
/// (depthwise `C M H W`), while `NHWC` and `HWCN` pair with `HWIO`
/// (depthwise `H W C M`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataLayout {
    Nchw,
    Nhwc,
    Hwcn,
}

impl DataLayout {
    pub const ALL: [DataLayout; 3] = [DataLayout::Nchw, DataLayout::Nhwc, DataLayout::Hwcn];

    pub fn name(self) -> &'static str {
        match self {
            DataLayout::Nchw => "NCHW",
            DataLayout::Nhwc => "NHWC",
            DataLayout::Hwcn => "HWCN",
        }
    }

    /// Shape of an activation tensor with batch 1.
    pub fn activation_shape(self, space: usize, channels: usize) -> [usize; 4] {
        match self {
            DataLayout::Nchw => [1, channels, space, space],
            DataLayout::Nhwc => [1, space, space, channels],
            DataLayout::Hwcn => [space, space, channels, 1],
        }
    }

    /// Axis permutation that turns an activation in this layout into NCHW.
    pub fn activation_to_nchw(self) -> [usize; 4] {
        match self {
            DataLayout::Nchw => [0, 1, 2, 3],
            DataLayout::Nhwc => [0, 3, 1, 2],
            DataLayout::Hwcn => [3, 2, 0, 1],
        }
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported layout '{0}' (expected NCHW, NHWC or HWCN)")]
pub struct UnknownLayout(pub String);

impl FromStr for DataLayout {
    type Err = UnknownLayout;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NCHW" => Ok(DataLayout::Nchw),
            "NHWC" => Ok(DataLayout::Nhwc),
            "HWCN" => Ok(DataLayout::Hwcn),
            other => Err(UnknownLayout(other.to_string())),
        }
    }
}

/// Dense or depthwise convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvKind {
    Dense,
    Depthwise,
}

impl ConvKind {
    pub fn from_depthwise(depthwise: bool) -> Self {
        if depthwise {
            ConvKind::Depthwise
        } else {
            ConvKind::Dense
        }
    }

    /// Phase label printed in sweep logs.
    pub fn phase(self) -> &'static str {
        match self {
            ConvKind::Dense => "standard",
            ConvKind::Depthwise => "depthwise",
        }
    }
}

impl fmt::Display for ConvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.phase())
    }
}

/// Filter shape for `kind` in `layout`.
///
/// For depthwise filters `out_channels` must be a multiple of
/// `in_channels`; the quotient is the channel multiplier.
pub fn filter_shape(
    layout: DataLayout,
    kind: ConvKind,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
) -> [usize; 4] {
    match (layout, kind) {
        (DataLayout::Nchw, ConvKind::Dense) => [out_channels, in_channels, kernel, kernel],
        (DataLayout::Nchw, ConvKind::Depthwise) => {
            [in_channels, out_channels / in_channels.max(1), kernel, kernel]
        }
        (DataLayout::Nhwc | DataLayout::Hwcn, ConvKind::Dense) => {
            [kernel, kernel, in_channels, out_channels]
        }
        (DataLayout::Nhwc | DataLayout::Hwcn, ConvKind::Depthwise) => {
            [kernel, kernel, in_channels, out_channels / in_channels.max(1)]
        }
    }
}

/// Axis permutation that turns a filter in `layout` into `O I H W`
/// (dense) or `C M H W` (depthwise).
pub fn filter_to_canonical(layout: DataLayout, kind: ConvKind) -> [usize; 4] {
    match (layout, kind) {
        (DataLayout::Nchw, _) => [0, 1, 2, 3],
        (DataLayout::Nhwc | DataLayout::Hwcn, ConvKind::Dense) => [3, 2, 0, 1],
        (DataLayout::Nhwc | DataLayout::Hwcn, ConvKind::Depthwise) => [2, 3, 0, 1],
    }
}
