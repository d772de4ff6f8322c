use super::CCode;
use crate::target::CompileTarget;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to run compiler '{compiler}': {source}")]
    Spawn {
        compiler: String,
        source: std::io::Error,
    },
    #[error("compilation failed ({status}):\n{stderr}")]
    Failed { status: String, stderr: String },
    #[error("compilation panicked: {0}")]
    Panicked(String),
}

pub trait KernelCompiler {
    fn is_available(&self, target: &CompileTarget) -> bool;

    fn compile(&self, code: &CCode, target: &CompileTarget)
        -> Result<CompiledLibrary, CompileError>;
}

/// Lives as long as the temporary directory holding it.
#[derive(Debug)]
pub struct CompiledLibrary {
    _dir: TempDir,
    path: PathBuf,
    entry_point: String,
    triple: String,
}

impl CompiledLibrary {
    pub fn new(dir: TempDir, path: PathBuf, entry_point: String, triple: String) -> Self {
        Self {
            _dir: dir,
            path,
            entry_point,
            triple,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn triple(&self) -> &str {
        &self.triple
    }

    pub fn export_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let dest = dir.join(format!("{}.so", self.entry_point));
        fs::copy(&self.path, &dest)?;
        debug!("Exported {} to {}", self.entry_point, dest.display());
        Ok(dest)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CCompiler {
    host_compiler: Option<String>,
    sysroot: Option<PathBuf>,
}

impl CCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `CC` (host compiler) and `CONVSWEEP_SYSROOT` (cross sysroot).
    pub fn from_env() -> Self {
        let mut compiler = Self::new();
        if let Ok(cc) = std::env::var("CC") {
            if !cc.is_empty() {
                compiler.host_compiler = Some(cc);
            }
        }
        if let Ok(sysroot) = std::env::var("CONVSWEEP_SYSROOT") {
            if !sysroot.is_empty() {
                compiler.sysroot = Some(PathBuf::from(sysroot));
            }
        }
        compiler
    }

    pub fn with_host_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.host_compiler = Some(compiler.into());
        self
    }

    pub fn with_sysroot(mut self, sysroot: impl Into<PathBuf>) -> Self {
        self.sysroot = Some(sysroot.into());
        self
    }

    fn compiler_for(&self, target: &CompileTarget) -> String {
        match &self.host_compiler {
            Some(cc) if target.is_host() => cc.clone(),
            _ => target.compiler.clone(),
        }
    }

    fn sysroot_for<'a>(&'a self, target: &'a CompileTarget) -> Option<&'a Path> {
        target.sysroot.as_deref().or_else(|| {
            if target.is_host() {
                None
            } else {
                self.sysroot.as_deref()
            }
        })
    }

    pub fn compiler_args(&self, target: &CompileTarget, source: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = target.flags.clone();
        if let Some(sysroot) = self.sysroot_for(target) {
            args.push(format!("--sysroot={}", sysroot.display()));
        }
        args.extend(
            ["-O3", "-std=c99", "-shared", "-fPIC"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push("-o".to_string());
        args.push(output.to_string_lossy().to_string());
        args.push(source.to_string_lossy().to_string());
        args
    }
}

impl KernelCompiler for CCompiler {
    fn is_available(&self, target: &CompileTarget) -> bool {
        Command::new(self.compiler_for(target))
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn compile(
        &self,
        code: &CCode,
        target: &CompileTarget,
    ) -> Result<CompiledLibrary, CompileError> {
        let dir = TempDir::new()?;
        let source_path = dir.path().join("kernel.c");
        let lib_path = dir.path().join(format!("lib{}.so", code.entry_point()));
        fs::write(&source_path, code.as_str())?;

        let compiler = self.compiler_for(target);
        let args = self.compiler_args(target, &source_path, &lib_path);
        debug!("Running compile command: {} {}", compiler, args.join(" "));

        let output = Command::new(&compiler)
            .args(&args)
            .output()
            .map_err(|source| CompileError::Spawn {
                compiler: compiler.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CompileError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(CompiledLibrary::new(
            dir,
            lib_path,
            code.entry_point().to_string(),
            target.triple.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_for_cross_target() {
        let target = CompileTarget {
            triple: "aarch64-linux-android".to_string(),
            compiler: "clang".to_string(),
            flags: vec!["--target=aarch64-linux-android21".to_string()],
            sysroot: None,
        };
        let compiler = CCompiler::new()
            .with_host_compiler("gcc")
            .with_sysroot("/ndk/sysroot");
        let args = compiler.compiler_args(&target, Path::new("k.c"), Path::new("k.so"));
        assert_eq!(args[0], "--target=aarch64-linux-android21");
        assert_eq!(args[1], "--sysroot=/ndk/sysroot");
        assert!(args.contains(&"-shared".to_string()));
        assert_eq!(args.last().unwrap(), "k.c");
        // CC only replaces the host toolchain
        assert_eq!(compiler.compiler_for(&target), "clang");
    }

    #[test]
    fn test_host_target_uses_override() {
        let target = CompileTarget::host();
        let compiler = CCompiler::new().with_host_compiler("gcc-13").with_sysroot("/x");
        assert_eq!(compiler.compiler_for(&target), "gcc-13");
        let args = compiler.compiler_args(&target, Path::new("k.c"), Path::new("k.so"));
        assert!(!args.iter().any(|a| a.starts_with("--sysroot")));
    }

    #[test]
    fn test_broken_source_is_compile_error() {
        let compiler = CCompiler::from_env();
        let target = CompileTarget::host();
        if !compiler.is_available(&target) {
            eprintln!("C compiler not available, skipping test.");
            return;
        }
        let code = CCode::new("void broken( {".to_string(), "broken");
        let err = compiler.compile(&code, &target).unwrap_err();
        assert!(matches!(err, CompileError::Failed { .. }));
    }

    #[test]
    fn test_missing_compiler_is_spawn_error() {
        let target = CompileTarget::host().with_compiler("definitely-not-a-cc");
        let compiler = CCompiler::new();
        // the override only applies when set, so the target's compiler is used
        assert!(!compiler.is_available(&target));
        let code = CCode::new("void f(void) {}".to_string(), "f");
        let err = compiler.compile(&code, &target).unwrap_err();
        assert!(matches!(err, CompileError::Spawn { .. }));
    }
}
