use super::c::LoadedKernel;
use super::{DeviceFunction, ExecutionBackend, RunError, TimingReport};
use crate::artifact::BuiltArtifact;
use crate::op::ConvOp;
use crate::target::DeviceContext;
use crate::tensor::DeviceBuffers;
use crate::timer;

/// Runs kernels in this process.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    device: DeviceContext,
}

impl LocalBackend {
    pub fn new(device: DeviceContext) -> Self {
        Self { device }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(DeviceContext::cpu(0))
    }
}

impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn device(&self) -> DeviceContext {
        self.device
    }

    fn load<'a>(
        &'a mut self,
        artifact: &BuiltArtifact,
    ) -> Result<Box<dyn DeviceFunction + 'a>, RunError> {
        let kernel = LoadedKernel::open(artifact.library_path(), artifact.entry_name())?;
        Ok(Box::new(LocalFunction {
            kernel,
            op: artifact.op.clone(),
        }))
    }
}

/// A kernel opened with libloading. Buffers are checked against the
/// operator before any pointer reaches compiled code.
pub struct LocalFunction {
    kernel: LoadedKernel,
    op: ConvOp,
}

impl DeviceFunction for LocalFunction {
    fn entry_name(&self) -> &str {
        self.kernel.entry_point()
    }

    fn invoke(&mut self, buffers: &mut DeviceBuffers) -> Result<(), RunError> {
        self.op.check_buffers(buffers).map_err(RunError::Buffers)?;
        unsafe { self.kernel.invoke(buffers) }?;
        Ok(())
    }

    fn time_evaluator(
        &mut self,
        buffers: &mut DeviceBuffers,
        number: usize,
    ) -> Result<TimingReport, RunError> {
        self.op.check_buffers(buffers).map_err(RunError::Buffers)?;
        let kernel = &self.kernel;
        let mean = timer::time_repeated(number, || unsafe { kernel.invoke(&mut *buffers) })?
            .ok_or(RunError::NoRuns)?;
        Ok(TimingReport { mean })
    }
}
