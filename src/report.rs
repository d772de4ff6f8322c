//! Sweep results and the line-oriented console report.

use crate::dtype::DType;
use crate::schedule::ScheduleStrategy;
use crate::target::{CompileTarget, UnsupportedTarget};
use crate::workload::{WorkloadSet, WorkloadSpec};
use std::fmt;

/// One sweep cell. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Configuration {
    pub arch: String,
    pub target: String,
    pub dtype: DType,
    /// Kept as given so an unknown layout fails at schedule time
    pub layout: String,
    pub workload_set: WorkloadSet,
    pub strategy: ScheduleStrategy,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            self.arch, self.target, self.dtype, self.layout, self.workload_set, self.strategy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    Schedule,
    Build,
    Run,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureStage::Schedule => "schedule",
            FailureStage::Build => "build",
            FailureStage::Run => "run",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Correctness {
    Match,
    Mismatch(String),
    /// No output to check because an earlier stage failed
    Skipped,
}

/// Outcome of one `(configuration, workload)` attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchResult {
    pub configuration: Configuration,
    pub workload_index: usize,
    pub workload: WorkloadSpec,
    pub phase: &'static str,
    /// Mean seconds per run; only set on success
    pub mean_cost: Option<f64>,
    pub op_count: Option<u64>,
    pub correctness: Correctness,
    pub failure_stage: Option<FailureStage>,
    pub message: Option<String>,
}

impl BenchResult {
    pub fn success(
        configuration: Configuration,
        workload_index: usize,
        workload: WorkloadSpec,
        mean_cost: f64,
        op_count: u64,
        correctness: Correctness,
    ) -> Self {
        Self {
            configuration,
            workload_index,
            phase: workload.phase(),
            workload,
            mean_cost: Some(mean_cost),
            op_count: Some(op_count),
            correctness,
            failure_stage: None,
            message: None,
        }
    }

    pub fn failure(
        configuration: Configuration,
        workload_index: usize,
        workload: WorkloadSpec,
        stage: FailureStage,
        message: String,
    ) -> Self {
        Self {
            configuration,
            workload_index,
            phase: workload.phase(),
            workload,
            mean_cost: None,
            op_count: None,
            correctness: Correctness::Skipped,
            failure_stage: Some(stage),
            message: Some(message),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure_stage.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub mismatched: usize,
    pub schedule_failures: usize,
    pub build_failures: usize,
    pub run_failures: usize,
    pub skipped_targets: usize,
}

impl fmt::Display for SweepSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "summary: {} attempted, {} succeeded ({} mismatched), {} schedule failures, {} build failures, {} run failures, {} skipped targets",
            self.attempted,
            self.succeeded,
            self.mismatched,
            self.schedule_failures,
            self.build_failures,
            self.run_failures,
            self.skipped_targets
        )
    }
}

/// Append-only log of a sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    results: Vec<BenchResult>,
    skipped_targets: Vec<UnsupportedTarget>,
}

impl SweepReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: BenchResult) {
        self.results.push(result);
    }

    pub fn skip_target(&mut self, unsupported: UnsupportedTarget) {
        self.skipped_targets.push(unsupported);
    }

    pub fn results(&self) -> &[BenchResult] {
        &self.results
    }

    pub fn skipped_targets(&self) -> &[UnsupportedTarget] {
        &self.skipped_targets
    }

    pub fn summary(&self) -> SweepSummary {
        let mut summary = SweepSummary {
            attempted: self.results.len(),
            skipped_targets: self.skipped_targets.len(),
            ..Default::default()
        };
        for result in &self.results {
            match result.failure_stage {
                None => {
                    summary.succeeded += 1;
                    if matches!(result.correctness, Correctness::Mismatch(_)) {
                        summary.mismatched += 1;
                    }
                }
                Some(FailureStage::Schedule) => summary.schedule_failures += 1,
                Some(FailureStage::Build) => summary.build_failures += 1,
                Some(FailureStage::Run) => summary.run_failures += 1,
            }
        }
        summary
    }
}

/// Shape as `(1, 32, 56, 56)`, or `?` when the layout was not understood.
pub fn format_shape(shape: Option<&[usize]>) -> String {
    match shape {
        Some(dims) => {
            let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("({})", dims.join(", "))
        }
        None => "?".to_string(),
    }
}

/// Prefix shared by every console line about one workload. The target is
/// printed as resolved, not as named in the configuration.
pub fn describe(
    configuration: &Configuration,
    target: &CompileTarget,
    workload: &WorkloadSpec,
    input_shape: Option<&[usize]>,
    filter_shape: Option<&[usize]>,
) -> String {
    format!(
        "{}--target: {}, dtype: {}, layout: {}, stride: {}, pad: {}, input_shape: {}, filter_shape: {}",
        workload.phase(),
        target,
        configuration.dtype,
        configuration.layout,
        workload.stride,
        workload.pad,
        format_shape(input_shape),
        format_shape(filter_shape)
    )
}
