use super::{DeviceFunction, ExecutionBackend, RunError, TimingReport};
use crate::artifact::BuiltArtifact;
use crate::op::ConvOp;
use crate::rpc::{RemoteModule, RemoteSession, WireTensor};
use crate::target::DeviceContext;
use crate::tensor::DeviceBuffers;
use log::debug;
use tempfile::TempDir;

/// Runs kernels on a device reached through a [`RemoteSession`].
///
/// Each artifact is exported to a local staging directory as
/// `<entry>.so`, uploaded, and loaded on the device with the argument
/// signature of its operator. The session is opened once per sweep; once
/// its connection breaks every later load fails.
#[derive(Debug)]
pub struct RemoteBackend {
    session: RemoteSession,
    staging: TempDir,
    device: DeviceContext,
}

impl RemoteBackend {
    pub fn new(session: RemoteSession, device: DeviceContext) -> Result<Self, std::io::Error> {
        Ok(Self {
            session,
            staging: TempDir::new()?,
            device,
        })
    }

    pub fn session(&self) -> &RemoteSession {
        &self.session
    }
}

fn kernel_signature(op: &ConvOp) -> Vec<WireTensor> {
    vec![
        WireTensor::new(op.in_dtype, &op.input_shape),
        WireTensor::new(op.in_dtype, &op.filter_shape),
        WireTensor::new(op.out_dtype, &op.output_shape),
    ]
}

impl ExecutionBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn device(&self) -> DeviceContext {
        self.device
    }

    fn load<'a>(
        &'a mut self,
        artifact: &BuiltArtifact,
    ) -> Result<Box<dyn DeviceFunction + 'a>, RunError> {
        let package = artifact
            .export_library(self.staging.path())
            .map_err(RunError::Export)?;
        let name = self.session.upload(&package)?;
        debug!(
            "Loading {name} ({}) on {}",
            artifact.library.triple(),
            self.session.device()
        );
        let module = self
            .session
            .load_module(&name, kernel_signature(&artifact.op))?;
        Ok(Box::new(RemoteFunction {
            module,
            op: artifact.op.clone(),
            entry: artifact.entry_name().to_string(),
        }))
    }
}

/// A module loaded on the device. Buffers are checked against the operator
/// before anything is sent.
pub struct RemoteFunction<'a> {
    module: RemoteModule<'a>,
    op: ConvOp,
    entry: String,
}

impl DeviceFunction for RemoteFunction<'_> {
    fn entry_name(&self) -> &str {
        &self.entry
    }

    fn invoke(&mut self, buffers: &mut DeviceBuffers) -> Result<(), RunError> {
        self.op.check_buffers(buffers).map_err(RunError::Buffers)?;
        self.module.invoke(buffers)?;
        Ok(())
    }

    fn time_evaluator(
        &mut self,
        buffers: &mut DeviceBuffers,
        number: usize,
    ) -> Result<TimingReport, RunError> {
        self.op.check_buffers(buffers).map_err(RunError::Buffers)?;
        let mean = self.module.time_evaluator(buffers, number)?;
        Ok(TimingReport { mean })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::layout::DataLayout;
    use crate::workload::WorkloadSpec;

    #[test]
    fn test_kernel_signature_follows_operator() {
        let workload = WorkloadSpec::depthwise(8, 4, 3, 1, 1);
        let op = ConvOp::new("conv_0", &workload, DataLayout::Nhwc, DType::I8).unwrap();
        let signature = kernel_signature(&op);
        assert_eq!(signature[0], WireTensor::new(DType::I8, &op.input_shape));
        assert_eq!(signature[1], WireTensor::new(DType::I8, &op.filter_shape));
        assert_eq!(signature[2], WireTensor::new(DType::I32, &op.output_shape));
    }
}
