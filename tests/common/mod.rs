#![allow(dead_code)]

use convsweep::artifact::BuiltArtifact;
use convsweep::backend::c::{CCode, CompileError, CompiledLibrary, KernelCompiler};
use convsweep::backend::{DeviceFunction, ExecutionBackend, RunError, TimingReport};
use convsweep::correctness::{CheckCase, ReferenceChecker, Verdict};
use convsweep::dtype::DType;
use convsweep::layout::DataLayout;
use convsweep::target::{CompileTarget, DeviceContext};
use convsweep::tensor::DeviceBuffers;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Report sink the test keeps a handle to after the driver takes its copy.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap();
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Pretends to compile: writes an empty file named after the entry point.
/// Entry points listed in `reject` fail like a broken toolchain would.
#[derive(Default)]
pub struct FakeCompiler {
    pub reject: Vec<String>,
}

impl KernelCompiler for FakeCompiler {
    fn is_available(&self, _target: &CompileTarget) -> bool {
        true
    }

    fn compile(&self, code: &CCode, target: &CompileTarget) -> Result<CompiledLibrary, CompileError> {
        if self.reject.iter().any(|name| name == code.entry_point()) {
            return Err(CompileError::Failed {
                status: "exit status: 1".to_string(),
                stderr: format!("{}: internal compiler error", code.entry_point()),
            });
        }
        let dir = TempDir::new()?;
        let path = dir.path().join(format!("lib{}.so", code.entry_point()));
        std::fs::write(&path, code.as_str())?;
        Ok(CompiledLibrary::new(
            dir,
            path,
            code.entry_point().to_string(),
            target.triple.clone(),
        ))
    }
}

/// Backend whose kernels do nothing and take a fixed millisecond.
/// Entry points listed in `fail` error out at load, those in `panic` panic.
#[derive(Default)]
pub struct FakeBackend {
    pub fail: Vec<String>,
    pub panic: Vec<String>,
    pub loads: Arc<Mutex<Vec<String>>>,
}

impl ExecutionBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn device(&self) -> DeviceContext {
        DeviceContext::cpu(0)
    }

    fn load<'a>(
        &'a mut self,
        artifact: &BuiltArtifact,
    ) -> Result<Box<dyn DeviceFunction + 'a>, RunError> {
        let entry = artifact.entry_name().to_string();
        self.loads.lock().unwrap().push(entry.clone());
        if self.fail.contains(&entry) {
            return Err(RunError::Buffers(format!("{entry}: device out of memory")));
        }
        if self.panic.contains(&entry) {
            panic!("{entry}: device driver crashed");
        }
        Ok(Box::new(FakeFunction { entry }))
    }
}

pub struct FakeFunction {
    entry: String,
}

impl DeviceFunction for FakeFunction {
    fn entry_name(&self) -> &str {
        &self.entry
    }

    fn invoke(&mut self, _buffers: &mut DeviceBuffers) -> Result<(), RunError> {
        Ok(())
    }

    fn time_evaluator(
        &mut self,
        _buffers: &mut DeviceBuffers,
        number: usize,
    ) -> Result<TimingReport, RunError> {
        if number == 0 {
            return Err(RunError::NoRuns);
        }
        Ok(TimingReport { mean: 1e-3 })
    }
}

/// What a checker was asked to verify.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckedCase {
    pub dtype: DType,
    pub output_dtype: DType,
    pub layout: DataLayout,
    pub depthwise: bool,
    pub output_shape: Vec<usize>,
    /// Little-endian bytes of the generated input operand
    pub input: Vec<u8>,
}

/// Accepts everything and remembers each case.
#[derive(Clone, Default)]
pub struct RecordingChecker {
    pub cases: Arc<Mutex<Vec<CheckedCase>>>,
}

impl ReferenceChecker for RecordingChecker {
    fn check(&self, case: &CheckCase<'_>) -> Verdict {
        self.cases.lock().unwrap().push(CheckedCase {
            dtype: case.dtype,
            output_dtype: case.output.dtype(),
            layout: case.layout,
            depthwise: case.depthwise,
            output_shape: case.output.shape().to_vec(),
            input: case.input.to_le_bytes(),
        });
        Verdict::Match
    }
}
