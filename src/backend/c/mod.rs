pub mod compiler;
pub mod kernel;
pub mod renderer;

pub use compiler::{CCompiler, CompileError, CompiledLibrary, KernelCompiler};
pub use kernel::{KernelError, LoadedKernel};
pub use renderer::CRenderer;

/// Fixed-signature wrapper every rendered kernel exports.
///
/// libloading needs one known signature, so the renderer emits
/// `void __convsweep_entry(void** args)` forwarding to the real kernel.
pub const KERNEL_ENTRY: &str = "__convsweep_entry";

/// C source for one kernel, tagged with the name of the function it defines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CCode {
    code: String,
    entry_point: String,
}

impl CCode {
    pub fn new(code: String, entry_point: impl Into<String>) -> Self {
        Self {
            code,
            entry_point: entry_point.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.code
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn contains(&self, pat: &str) -> bool {
        self.code.contains(pat)
    }
}

impl AsRef<str> for CCode {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for CCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)
    }
}
