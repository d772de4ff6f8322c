//! The sweep driver
//!
//! Visits targets, then every `(dtype, layout, workload set, strategy)`
//! tuple, then every workload of the set, in that order. Each workload goes
//! through schedule, compile, run and check; whatever stage fails is recorded
//! and the driver moves on. Only target resolution can skip more than one
//! workload, and it skips the whole target.

use crate::artifact::{ArtifactBuilder, BuildFailure};
use crate::backend::c::{CCompiler, KernelCompiler};
use crate::backend::ExecutionBackend;
use crate::correctness::{CheckCase, NdarrayReference, ReferenceChecker, Verdict};
use crate::dtype::DType;
use crate::guard::guarded;
use crate::layout::DataLayout;
use crate::report::{
    describe, BenchResult, Configuration, Correctness, FailureStage, SweepReport,
};
use crate::schedule::ScheduleStrategy;
use crate::target::{self, ResolvedTarget};
use crate::workload::{WorkloadSet, WorkloadSpec};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;

/// The axes of a sweep. Every combination is visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    pub targets: Vec<String>,
    pub dtypes: Vec<DType>,
    pub layouts: Vec<String>,
    pub workload_sets: Vec<WorkloadSet>,
    pub strategies: Vec<ScheduleStrategy>,
}

impl Default for SweepPlan {
    /// `cpu` × `{int8, float32}` × all layouts × all sets × `{auto, manual}`.
    fn default() -> Self {
        Self {
            targets: vec!["cpu".to_string()],
            dtypes: vec![DType::I8, DType::F32],
            layouts: DataLayout::ALL.iter().map(|l| l.name().to_string()).collect(),
            workload_sets: WorkloadSet::ALL.to_vec(),
            strategies: ScheduleStrategy::ALL.to_vec(),
        }
    }
}

impl SweepPlan {
    /// A plan with exactly one cell.
    pub fn single(
        target: impl Into<String>,
        dtype: DType,
        layout: impl Into<String>,
        workload_set: WorkloadSet,
        strategy: ScheduleStrategy,
    ) -> Self {
        Self {
            targets: vec![target.into()],
            dtypes: vec![dtype],
            layouts: vec![layout.into()],
            workload_sets: vec![workload_set],
            strategies: vec![strategy],
        }
    }

    /// Configurations for one target in visiting order.
    pub fn configurations(&self, arch: &str, target: &str) -> Vec<Configuration> {
        let mut configs = Vec::new();
        for &dtype in &self.dtypes {
            for layout in &self.layouts {
                for &workload_set in &self.workload_sets {
                    for &strategy in &self.strategies {
                        configs.push(Configuration {
                            arch: arch.to_string(),
                            target: target.to_string(),
                            dtype,
                            layout: layout.clone(),
                            workload_set,
                            strategy,
                        });
                    }
                }
            }
        }
        configs
    }

    /// Workload attempts the plan makes when every target resolves.
    pub fn attempt_count(&self) -> usize {
        let per_tuple: usize = self
            .workload_sets
            .iter()
            .map(|set| set.workloads().len())
            .sum();
        self.targets.len()
            * self.dtypes.len()
            * self.layouts.len()
            * self.strategies.len()
            * per_tuple
    }
}

pub struct SweepDriver<C: KernelCompiler = CCompiler> {
    arch: String,
    builder: ArtifactBuilder<C>,
    backend: Box<dyn ExecutionBackend>,
    checker: Box<dyn ReferenceChecker>,
    seed: u64,
    out: Box<dyn Write>,
}

impl<C: KernelCompiler> SweepDriver<C> {
    pub fn new(
        arch: impl Into<String>,
        builder: ArtifactBuilder<C>,
        backend: Box<dyn ExecutionBackend>,
    ) -> Self {
        Self {
            arch: arch.into(),
            builder,
            backend,
            checker: Box::new(NdarrayReference),
            seed: rand::random(),
            out: Box::new(std::io::stdout()),
        }
    }

    pub fn with_checker(mut self, checker: Box<dyn ReferenceChecker>) -> Self {
        self.checker = checker;
        self
    }

    /// Makes the generated operands reproducible. Each cell draws from its
    /// own stream keyed by configuration and workload index, so the operands
    /// of one cell do not depend on how earlier cells went.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn cell_rng(&self, configuration: &Configuration, index: usize) -> StdRng {
        let mut hasher = FxHasher::default();
        self.seed.hash(&mut hasher);
        configuration.hash(&mut hasher);
        index.hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish())
    }

    /// Where report lines go; stdout by default.
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    pub fn run(&mut self, plan: &SweepPlan) -> SweepReport {
        let mut report = SweepReport::new();
        for target_name in &plan.targets {
            let resolved = match target::resolve(&self.arch, target_name) {
                Ok(resolved) => resolved,
                Err(unsupported) => {
                    warn!("Skipping target: {unsupported}");
                    report.skip_target(unsupported);
                    continue;
                }
            };
            info!(
                "Sweeping {} ({}) on {} backend, device {}",
                resolved.name,
                resolved.compile_target,
                self.backend.name(),
                self.backend.device()
            );
            for configuration in plan.configurations(&self.arch, target_name) {
                let workloads = configuration.workload_set.workloads();
                self.run_configuration(&configuration, &resolved, workloads, &mut report);
            }
        }
        let summary = report.summary();
        self.emit(&summary.to_string());
        report
    }

    /// Attempts every workload of one configuration, appending one result
    /// per workload to `report`.
    pub fn run_configuration(
        &mut self,
        configuration: &Configuration,
        target: &ResolvedTarget,
        workloads: &[WorkloadSpec],
        report: &mut SweepReport,
    ) {
        debug!("Configuration {configuration}");
        for (index, workload) in workloads.iter().enumerate() {
            let result = self.run_workload(configuration, target, index, workload);
            report.push(result);
        }
    }

    fn run_workload(
        &mut self,
        configuration: &Configuration,
        target: &ResolvedTarget,
        index: usize,
        workload: &WorkloadSpec,
    ) -> BenchResult {
        let layout = configuration.layout.parse::<DataLayout>().ok();
        let input_shape = layout.map(|l| workload.input_shape(l));
        let filter_shape = layout.map(|l| workload.filter_shape(l));
        let line = describe(
            configuration,
            &target.compile_target,
            workload,
            input_shape.as_ref().map(|s| s.as_slice()),
            filter_shape.as_ref().map(|s| s.as_slice()),
        );
        self.emit(&format!("{line} -> build"));

        let fail = |stage: FailureStage, message: String| {
            BenchResult::failure(configuration.clone(), index, *workload, stage, message)
        };

        let name = workload.function_name(index);
        let scheduled = match self.builder.schedule(
            &name,
            workload,
            &configuration.layout,
            configuration.dtype,
            configuration.strategy,
        ) {
            Ok(scheduled) => scheduled,
            Err(e) => {
                warn!("[{configuration}] {line}: {e}");
                self.emit(&format!("{line} -> schedule skip: {e}"));
                return fail(stage_of(&e), e.to_string());
            }
        };

        let mut buffers = scheduled
            .op
            .allocate_buffers(&mut self.cell_rng(configuration, index));

        let artifact = match self.builder.compile(scheduled, target) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("[{configuration}] {line}: {e}");
                self.emit(&format!("{line} -> failed: {e}"));
                return fail(stage_of(&e), e.to_string());
            }
        };

        let cost = match self
            .backend
            .run(&artifact, &mut buffers, workload.warmup, workload.run)
        {
            Ok(cost) => cost,
            Err(e) => {
                warn!("[{configuration}] {line}: run failed: {e}");
                self.emit(&format!("{line} -> run skip: {e}"));
                return fail(FailureStage::Run, e.to_string());
            }
        };

        let case = CheckCase::new(&artifact.op, &buffers);
        let checker = &self.checker;
        let verdict = guarded(
            || -> Result<Verdict, String> { Ok(checker.check(&case)) },
            |panic| panic,
        )
        .unwrap_or_else(|panic| Verdict::Mismatch {
            diagnostic: format!("reference check panicked: {panic}"),
        });
        let correctness = match verdict {
            Verdict::Match => Correctness::Match,
            Verdict::Mismatch { diagnostic } => {
                warn!("[{configuration}] {line}: output mismatch: {diagnostic}");
                Correctness::Mismatch(diagnostic)
            }
        };

        let ops = artifact.op.op_count();
        let verdict_text = match &correctness {
            Correctness::Match => "correct".to_string(),
            Correctness::Mismatch(diagnostic) => format!("MISMATCH ({diagnostic})"),
            Correctness::Skipped => "unchecked".to_string(),
        };
        self.emit(&format!("{line}, ops: {ops} -> {cost:.6e} s, {verdict_text}"));

        BenchResult::success(configuration.clone(), index, *workload, cost, ops, correctness)
    }

    fn emit(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{line}") {
            warn!("Failed to write report line: {e}");
        }
    }
}

fn stage_of(failure: &BuildFailure) -> FailureStage {
    match failure {
        BuildFailure::Schedule(_) => FailureStage::Schedule,
        BuildFailure::Compile(_) => FailureStage::Build,
    }
}
