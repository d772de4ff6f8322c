//! Architecture and target resolution.
//!
//! Maps an `(architecture, target)` pair from the command line onto the
//! toolchain used to cross-compile kernels and the device context they run
//! on. Resolution is a pure lookup in a fixed table; anything outside the
//! table is reported as [`UnsupportedTarget`] so the sweep can skip the
//! whole target.

use std::fmt;
use std::path::PathBuf;

/// Toolchain settings for one compile target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileTarget {
    /// Platform triple the kernel is compiled for
    pub triple: String,
    /// Compiler executable
    pub compiler: String,
    /// Extra flags placed before the common shared-library flags
    pub flags: Vec<String>,
    /// Sysroot passed as `--sysroot` when set
    pub sysroot: Option<PathBuf>,
}

impl CompileTarget {
    /// Toolchain for the machine running the sweep.
    pub fn host() -> Self {
        Self {
            triple: host_triple(),
            compiler: "cc".to_string(),
            flags: Vec::new(),
            sysroot: None,
        }
    }

    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }

    pub fn with_sysroot(mut self, sysroot: impl Into<PathBuf>) -> Self {
        self.sysroot = Some(sysroot.into());
        self
    }

    /// Whether binaries built for this target load in the current process.
    pub fn is_host(&self) -> bool {
        self.triple == host_triple()
    }
}

impl fmt::Display for CompileTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c -target={}", self.triple)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
}

/// Device a kernel executes on, local or behind the RPC proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceContext {
    pub kind: DeviceKind,
    pub index: usize,
}

impl DeviceContext {
    pub fn cpu(index: usize) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            index,
        }
    }
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu({})", self.index),
        }
    }
}

/// Everything the build and run stages need to know about a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Target name as given on the command line
    pub name: String,
    pub compile_target: CompileTarget,
    /// Triple of the machine driving the build
    pub compile_host: String,
    pub device: DeviceContext,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("target '{target}' is not supported on architecture '{arch}'")]
pub struct UnsupportedTarget {
    pub arch: String,
    pub target: String,
}

struct ArchEntry {
    names: &'static [&'static str],
    /// `None` means the host triple
    triple: Option<&'static str>,
    compiler: &'static str,
    flags: &'static [&'static str],
}

const ARCH_TABLE: &[ArchEntry] = &[
    ArchEntry {
        names: &["host", "native"],
        triple: None,
        compiler: "cc",
        flags: &[],
    },
    ArchEntry {
        names: &["x86_64"],
        triple: Some("x86_64-unknown-linux-gnu"),
        compiler: "cc",
        flags: &["-march=x86-64"],
    },
    ArchEntry {
        names: &["aarch64", "arm64"],
        triple: Some("aarch64-linux-android"),
        compiler: "clang",
        flags: &["--target=aarch64-linux-android21"],
    },
    ArchEntry {
        names: &["armv7", "armv7a"],
        triple: Some("armv7a-linux-androideabi"),
        compiler: "clang",
        flags: &[
            "--target=armv7a-linux-androideabi21",
            "-mfloat-abi=softfp",
            "-mfpu=neon",
        ],
    },
];

const SUPPORTED_TARGETS: &[&str] = &["cpu"];

/// Resolves `arch`/`target` against the fixed toolchain table.
pub fn resolve(arch: &str, target: &str) -> Result<ResolvedTarget, UnsupportedTarget> {
    let unsupported = || UnsupportedTarget {
        arch: arch.to_string(),
        target: target.to_string(),
    };

    if !SUPPORTED_TARGETS.contains(&target) {
        return Err(unsupported());
    }
    let entry = ARCH_TABLE
        .iter()
        .find(|entry| entry.names.contains(&arch))
        .ok_or_else(unsupported)?;

    let compile_target = CompileTarget {
        triple: entry
            .triple
            .map(str::to_string)
            .unwrap_or_else(host_triple),
        compiler: entry.compiler.to_string(),
        flags: entry.flags.iter().map(|f| f.to_string()).collect(),
        sysroot: None,
    };

    Ok(ResolvedTarget {
        name: target.to_string(),
        compile_target,
        compile_host: host_triple(),
        device: DeviceContext::cpu(0),
    })
}

/// Triple of the running process in `arch-vendor-os` form.
pub fn host_triple() -> String {
    let arch = std::env::consts::ARCH;
    match std::env::consts::OS {
        "linux" => format!("{arch}-unknown-linux-gnu"),
        "macos" => format!("{arch}-apple-darwin"),
        "windows" => format!("{arch}-pc-windows-msvc"),
        os => format!("{arch}-unknown-{os}"),
    }
}
