//! convsweep: convolution benchmark and correctness sweep
//!
//! Builds standard and depthwise convolution kernels over a grid of dtypes,
//! layouts, workload sets and schedule strategies, runs each one locally or
//! on a remote device, times it and checks it against a reference.
//!
//! # Architecture
//!
//! - **workload / layout / dtype**: the problem definitions
//! - **op / schedule**: operator construction and loop schedules
//! - **backend::c**: C rendering, compilation and loading
//! - **artifact**: guarded schedule and compile stages
//! - **backend**: local and remote execution behind one trait
//! - **rpc**: tracker client and device server
//! - **timer / correctness**: measurement and reference checks
//! - **sweep / report**: the driver and its results

pub mod artifact;
pub mod backend;
pub mod config;
pub mod correctness;
pub mod dtype;
pub mod error;
mod guard;
pub mod layout;
pub mod op;
pub mod report;
pub mod rpc;
pub mod schedule;
pub mod sweep;
pub mod target;
pub mod tensor;
pub mod timer;
pub mod workload;

pub use artifact::{ArtifactBuilder, BuildFailure, BuiltArtifact};
pub use backend::{DeviceFunction, ExecutionBackend, LocalBackend, RemoteBackend, RunError};
pub use correctness::{CheckCase, NdarrayReference, ReferenceChecker, Verdict};
pub use dtype::DType;
pub use error::SetupError;
pub use layout::{ConvKind, DataLayout};
pub use report::{BenchResult, Configuration, Correctness, FailureStage, SweepReport};
pub use schedule::{Schedule, ScheduleStrategy, TuningHistory};
pub use sweep::{SweepDriver, SweepPlan};
pub use workload::{WorkloadSet, WorkloadSpec};

/// Installs `env_logger`, defaulting to `info` when `RUST_LOG` is unset.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
