//! Execution backends
//!
//! Building always happens locally; running goes through an
//! [`ExecutionBackend`]. Both variants hand back a [`DeviceFunction`] with
//! the same `invoke`/`time_evaluator` contract, so timing and checking never
//! know where the kernel actually ran.

pub mod c;
pub mod local;
pub mod remote;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

use crate::artifact::BuiltArtifact;
use crate::backend::c::KernelError;
use crate::guard::guarded;
use crate::rpc::RpcError;
use crate::target::DeviceContext;
use crate::tensor::DeviceBuffers;
use crate::timer;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("failed to export library: {0}")]
    Export(#[source] std::io::Error),
    #[error("buffer mismatch: {0}")]
    Buffers(String),
    #[error("at least one timed run is required")]
    NoRuns,
    #[error("run panicked: {0}")]
    Panicked(String),
}

/// Result of a time evaluator call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingReport {
    /// Mean seconds per invocation
    pub mean: f64,
}

/// A loaded kernel, callable as `(input, filter, output)`.
pub trait DeviceFunction {
    fn entry_name(&self) -> &str;

    fn invoke(&mut self, buffers: &mut DeviceBuffers) -> Result<(), RunError>;

    /// Runs the kernel `number` times and reports the mean.
    fn time_evaluator(
        &mut self,
        buffers: &mut DeviceBuffers,
        number: usize,
    ) -> Result<TimingReport, RunError>;
}

pub trait ExecutionBackend {
    fn name(&self) -> &'static str;

    fn device(&self) -> DeviceContext;

    /// Makes `artifact` callable on this backend's device.
    fn load<'a>(
        &'a mut self,
        artifact: &BuiltArtifact,
    ) -> Result<Box<dyn DeviceFunction + 'a>, RunError>;

    /// Loads `artifact` and times it. Every failure, panics included, comes
    /// back as a [`RunError`].
    fn run(
        &mut self,
        artifact: &BuiltArtifact,
        buffers: &mut DeviceBuffers,
        warmup: usize,
        runs: usize,
    ) -> Result<f64, RunError> {
        guarded(
            || -> Result<f64, RunError> {
                let mut func = self.load(artifact)?;
                timer::measure(func.as_mut(), buffers, warmup, runs)
            },
            RunError::Panicked,
        )
    }
}
