//! Artifact construction
//!
//! Building is split into two guarded stages so a failure can be attributed
//! to the right one: scheduling (operator construction plus schedule
//! selection) and compilation (rendering plus the C toolchain). Neither stage
//! ever unwinds into the caller.

use crate::backend::c::{CCode, CCompiler, CRenderer, CompileError, CompiledLibrary, KernelCompiler};
use crate::dtype::DType;
use crate::guard::guarded;
use crate::layout::DataLayout;
use crate::op::ConvOp;
use crate::schedule::{Schedule, ScheduleContext, ScheduleError, ScheduleStrategy, TuningHistory};
use crate::target::ResolvedTarget;
use crate::workload::WorkloadSpec;
use log::debug;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum BuildFailure {
    #[error("schedule failed: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("build failed: {0}")]
    Compile(#[from] CompileError),
}

/// An operator together with the schedule chosen for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledOp {
    pub op: ConvOp,
    pub schedule: Schedule,
}

/// A compiled kernel plus the description it was built from.
#[derive(Debug)]
pub struct BuiltArtifact {
    pub op: ConvOp,
    pub schedule: Schedule,
    pub code: CCode,
    pub library: CompiledLibrary,
}

impl BuiltArtifact {
    /// Name of the kernel function, also used as the module name remotely.
    pub fn entry_name(&self) -> &str {
        self.library.entry_point()
    }

    pub fn library_path(&self) -> &Path {
        self.library.path()
    }

    /// Writes the shared library to `<dir>/<entry_name>.so`.
    pub fn export_library(&self, dir: &Path) -> std::io::Result<PathBuf> {
        self.library.export_to(dir)
    }
}

pub struct ArtifactBuilder<C: KernelCompiler = CCompiler> {
    compiler: C,
    history: Option<TuningHistory>,
}

impl<C: KernelCompiler> ArtifactBuilder<C> {
    pub fn new(compiler: C) -> Self {
        Self {
            compiler,
            history: None,
        }
    }

    /// History consulted by the `manual` strategy.
    pub fn with_history(mut self, history: TuningHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Constructs the operator for `layout` and picks its schedule.
    pub fn schedule(
        &self,
        name: &str,
        workload: &WorkloadSpec,
        layout: &str,
        dtype: DType,
        strategy: ScheduleStrategy,
    ) -> Result<ScheduledOp, BuildFailure> {
        let ctx = ScheduleContext::new(strategy, self.history.as_ref());
        let scheduled = guarded(
            || -> Result<ScheduledOp, ScheduleError> {
                let layout: DataLayout = layout.parse()?;
                let op = ConvOp::new(name, workload, layout, dtype)?;
                let schedule = ctx.select(&op)?;
                Ok(ScheduledOp { op, schedule })
            },
            ScheduleError::Panicked,
        )?;
        debug!(
            "Scheduled {} ({}) with {:?}",
            scheduled.op.name, strategy, scheduled.schedule
        );
        Ok(scheduled)
    }

    /// Renders and compiles a scheduled operator for `target`.
    pub fn compile(
        &self,
        scheduled: ScheduledOp,
        target: &ResolvedTarget,
    ) -> Result<BuiltArtifact, BuildFailure> {
        let ScheduledOp { op, schedule } = scheduled;
        debug!(
            "Compiling {} for {} on {}",
            op.name, target.compile_target, target.compile_host
        );
        let (code, library) = guarded(
            || -> Result<(CCode, CompiledLibrary), CompileError> {
                let code = CRenderer::new().render(&op, &schedule);
                let library = self.compiler.compile(&code, &target.compile_target)?;
                Ok((code, library))
            },
            CompileError::Panicked,
        )?;
        Ok(BuiltArtifact {
            op,
            schedule,
            code,
            library,
        })
    }

    /// Both stages back to back.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        name: &str,
        workload: &WorkloadSpec,
        layout: &str,
        dtype: DType,
        strategy: ScheduleStrategy,
        target: &ResolvedTarget,
    ) -> Result<BuiltArtifact, BuildFailure> {
        let scheduled = self.schedule(name, workload, layout, dtype, strategy)?;
        self.compile(scheduled, target)
    }
}
