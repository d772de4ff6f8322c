//! Schedules: the loop tiling applied to a convolution before rendering.
//!
//! `auto` uses a layout-aware heuristic. `manual` looks the operator up in a
//! [`TuningHistory`] and falls back to the heuristic when nothing was
//! recorded for that workload.

pub mod history;

pub use history::{history_path, HistoryError, TuningHistory, TuningRecord};

use crate::layout::{DataLayout, UnknownLayout};
use crate::op::ConvOp;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Failure while constructing an operator or its schedule.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Layout(#[from] UnknownLayout),
    #[error("convolution needs at least one input and one output channel")]
    EmptyChannels,
    #[error("depthwise convolution needs output channels ({output}) to be a multiple of input channels ({input})")]
    ChannelMultiplier { input: usize, output: usize },
    #[error("kernel {kernel} with pad {pad} and stride {stride} leaves no output for input extent {space}")]
    EmptyOutput {
        space: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    },
    #[error("invalid schedule for {op}: {reason}")]
    InvalidSchedule { op: String, reason: String },
    #[error("schedule construction panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleStrategy {
    Auto,
    Manual,
}

impl ScheduleStrategy {
    pub const ALL: [ScheduleStrategy; 2] = [ScheduleStrategy::Auto, ScheduleStrategy::Manual];

    pub fn name(self) -> &'static str {
        match self {
            ScheduleStrategy::Auto => "auto",
            ScheduleStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ScheduleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown schedule strategy '{0}' (expected auto or manual)")]
pub struct UnknownStrategy(pub String);

impl FromStr for ScheduleStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ScheduleStrategy::Auto),
            "manual" => Ok(ScheduleStrategy::Manual),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// Loop tiling for the rendered loop nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schedule {
    /// Output channels computed per tile
    pub tile_channels: usize,
    /// Output columns computed per tile
    pub tile_width: usize,
    /// Fully unroll the kernel window loops
    pub unroll_kernel: bool,
}

impl Schedule {
    /// Heuristic schedule used by the `auto` strategy.
    ///
    /// Channel-last layouts tile over output channels since those are
    /// contiguous; NCHW tiles along the output row instead.
    pub fn generic(op: &ConvOp) -> Self {
        let out_channels = op.workload.output_channel;
        let (tile_channels, tile_width) = match op.layout {
            DataLayout::Nchw => (1, op.output_space.min(8)),
            DataLayout::Nhwc | DataLayout::Hwcn => (out_channels.min(16), 1),
        };
        Self {
            tile_channels,
            tile_width,
            unroll_kernel: op.workload.kernel <= 3,
        }
    }

    pub fn validate(&self, op: &ConvOp) -> Result<(), ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidSchedule {
            op: op.name.clone(),
            reason,
        };
        if self.tile_channels == 0 || self.tile_channels > op.workload.output_channel {
            return Err(invalid(format!(
                "tile_channels {} outside 1..={}",
                self.tile_channels, op.workload.output_channel
            )));
        }
        if self.tile_width == 0 || self.tile_width > op.output_space {
            return Err(invalid(format!(
                "tile_width {} outside 1..={}",
                self.tile_width, op.output_space
            )));
        }
        Ok(())
    }
}

/// Strategy plus the history it may consult, applied while an operator is
/// being scheduled.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleContext<'a> {
    pub strategy: ScheduleStrategy,
    pub history: Option<&'a TuningHistory>,
}

impl<'a> ScheduleContext<'a> {
    pub fn new(strategy: ScheduleStrategy, history: Option<&'a TuningHistory>) -> Self {
        Self { strategy, history }
    }

    pub fn select(&self, op: &ConvOp) -> Result<Schedule, ScheduleError> {
        let schedule = match self.strategy {
            ScheduleStrategy::Auto => Schedule::generic(op),
            ScheduleStrategy::Manual => {
                let key = op.workload_key();
                match self.history.and_then(|h| h.best(&key)) {
                    Some(record) => {
                        debug!("Applying tuned schedule for {key} (cost {})", record.cost);
                        record.schedule
                    }
                    None => {
                        warn!("No tuned schedule recorded for {key}, using generic schedule");
                        Schedule::generic(op)
                    }
                }
            }
        };
        schedule.validate(op)?;
        Ok(schedule)
    }
}
