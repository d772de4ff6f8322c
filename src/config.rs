//! Command line and environment.
//!
//! ```text
//! convsweep <ARCH> <MODE> [KEY [TARGET DTYPE LAYOUT WORKLOAD_SET SCHEDULE]]
//! ```

use crate::artifact::ArtifactBuilder;
use crate::backend::c::CCompiler;
use crate::backend::{ExecutionBackend, LocalBackend, RemoteBackend};
use crate::dtype::DType;
use crate::error::SetupError;
use crate::rpc::TrackerClient;
use crate::schedule::{history_path, ScheduleStrategy, TuningHistory};
use crate::sweep::{SweepDriver, SweepPlan};
use crate::target::DeviceContext;
use crate::workload::WorkloadSet;
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;

pub const TRACKER_HOST_ENV: &str = "CONVSWEEP_TRACKER_HOST";
pub const TRACKER_PORT_ENV: &str = "CONVSWEEP_TRACKER_PORT";
pub const DEFAULT_DEVICE_KEY: &str = "android";
pub const DEFAULT_CONFIG_DIR: &str = "../configs";

/// Convolution benchmark and correctness sweep
///
/// Builds every convolution workload for every dtype, layout, workload set
/// and schedule strategy, runs it locally or on a remote device, times it
/// and checks the output against a reference implementation.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "convsweep")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Device architecture (host, x86_64, aarch64, armv7)
    #[arg(value_name = "ARCH")]
    pub arch: String,

    /// Where kernels run
    #[arg(value_name = "MODE")]
    pub mode: Mode,

    /// Device key for the tracker; also names the tuning history file
    #[arg(value_name = "KEY")]
    pub key: Option<String>,

    /// One cell to run: TARGET DTYPE LAYOUT WORKLOAD_SET SCHEDULE
    #[arg(value_name = "CELL")]
    pub cell: Vec<String>,

    /// Directory holding `<key>.convolutions.log` tuning histories
    #[arg(long, value_name = "DIR", default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// Seed for the generated operands
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Run kernels in this process
    Local,
    /// Run kernels on a device behind the RPC tracker
    Remote,
}

impl Cli {
    pub fn device_key(&self) -> &str {
        self.key.as_deref().unwrap_or(DEFAULT_DEVICE_KEY)
    }

    /// The full default sweep, or the single cell given on the command line.
    pub fn plan(&self) -> Result<SweepPlan, SetupError> {
        match self.cell.as_slice() {
            [] => Ok(SweepPlan::default()),
            [target, dtype, layout, workload_set, strategy] => Ok(SweepPlan::single(
                target.clone(),
                dtype.parse::<DType>()?,
                layout.clone(),
                workload_set.parse::<WorkloadSet>()?,
                strategy.parse::<ScheduleStrategy>()?,
            )),
            other => Err(SetupError::Usage(format!(
                "expected TARGET DTYPE LAYOUT WORKLOAD_SET SCHEDULE together, got {} of them",
                other.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerAddress {
    pub host: String,
    pub port: u16,
}

impl TrackerAddress {
    pub fn from_env() -> Result<Self, SetupError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SetupError> {
        let host = lookup(TRACKER_HOST_ENV)
            .filter(|h| !h.is_empty())
            .ok_or(SetupError::MissingEnv(TRACKER_HOST_ENV))?;
        let port = lookup(TRACKER_PORT_ENV).ok_or(SetupError::MissingEnv(TRACKER_PORT_ENV))?;
        let port = port.trim().parse::<u16>().map_err(|_| SetupError::InvalidPort {
            name: TRACKER_PORT_ENV,
            value: port.clone(),
        })?;
        Ok(Self { host, port })
    }
}

/// Everything resolved from the command line and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub arch: String,
    pub mode: Mode,
    pub key: String,
    pub plan: SweepPlan,
    pub config_dir: PathBuf,
    pub seed: Option<u64>,
    /// Only resolved in remote mode
    pub tracker: Option<TrackerAddress>,
}

impl Settings {
    pub fn from_cli(
        cli: &Cli,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SetupError> {
        let tracker = match cli.mode {
            Mode::Local => None,
            Mode::Remote => Some(TrackerAddress::from_lookup(lookup)?),
        };
        Ok(Self {
            arch: cli.arch.clone(),
            mode: cli.mode,
            key: cli.device_key().to_string(),
            plan: cli.plan()?,
            config_dir: cli.config_dir.clone(),
            seed: cli.seed,
            tracker,
        })
    }

    /// Opens the execution backend. In remote mode this connects to the
    /// tracker and requests the device once for the whole run.
    pub fn open_backend(&self) -> Result<Box<dyn ExecutionBackend>, SetupError> {
        match (self.mode, &self.tracker) {
            (Mode::Local, _) => Ok(Box::new(LocalBackend::default())),
            (Mode::Remote, Some(tracker)) => {
                let session = TrackerClient::connect(&tracker.host, tracker.port)?.request(&self.key)?;
                info!(
                    "Using remote device {} via {}:{}",
                    session.device(),
                    tracker.host,
                    tracker.port
                );
                Ok(Box::new(RemoteBackend::new(session, DeviceContext::cpu(0))?))
            }
            (Mode::Remote, None) => Err(SetupError::MissingEnv(TRACKER_HOST_ENV)),
        }
    }

    /// Builds the driver. Nothing has been printed when this fails.
    pub fn driver(&self) -> Result<SweepDriver<CCompiler>, SetupError> {
        let backend = self.open_backend()?;
        let history = TuningHistory::load_or_empty(&history_path(&self.config_dir, &self.key));
        let builder = ArtifactBuilder::new(CCompiler::from_env()).with_history(history);
        let driver = SweepDriver::new(self.arch.clone(), builder, backend);
        Ok(match self.seed {
            Some(seed) => driver.with_seed(seed),
            None => driver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("convsweep").chain(args.iter().copied()))
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn test_minimal_local() {
        let cli = parse(&["arm64", "local"]).unwrap();
        assert_eq!(cli.device_key(), "android");
        assert_eq!(cli.config_dir, PathBuf::from("../configs"));
        let settings = Settings::from_cli(&cli, env(&[])).unwrap();
        assert_eq!(settings.plan, SweepPlan::default());
        assert!(settings.tracker.is_none());
    }

    #[test]
    fn test_single_cell() {
        let cli = parse(&[
            "host", "local", "pixel", "cpu", "float", "NHWC", "mobile-set", "manual", "--seed", "4",
        ])
        .unwrap();
        let plan = cli.plan().unwrap();
        assert_eq!(plan.dtypes, vec![DType::F32]);
        assert_eq!(plan.workload_sets, vec![WorkloadSet::Mobilenet]);
        assert_eq!(plan.strategies, vec![ScheduleStrategy::Manual]);
        assert_eq!(cli.seed, Some(4));
    }

    #[test]
    fn test_partial_cell_is_usage_error() {
        let cli = parse(&["host", "local", "android", "cpu", "float"]).unwrap();
        assert!(matches!(cli.plan(), Err(SetupError::Usage(_))));
    }

    #[test]
    fn test_bad_mode_rejected() {
        assert!(parse(&["host", "cloud"]).is_err());
    }

    #[test]
    fn test_unknown_layout_passes_through() {
        let cli = parse(&["host", "local", "k", "cpu", "int8", "NCWH", "standard-set", "auto"]).unwrap();
        assert_eq!(cli.plan().unwrap().layouts, vec!["NCWH".to_string()]);
    }

    #[test]
    fn test_remote_requires_tracker_env() {
        let cli = parse(&["arm64", "remote", "android"]).unwrap();
        assert!(matches!(
            Settings::from_cli(&cli, env(&[])),
            Err(SetupError::MissingEnv(TRACKER_HOST_ENV))
        ));
        let bad_port = env(&[(TRACKER_HOST_ENV, "10.0.0.2"), (TRACKER_PORT_ENV, "nine")]);
        assert!(matches!(
            Settings::from_cli(&cli, bad_port),
            Err(SetupError::InvalidPort { .. })
        ));
        let ok = env(&[(TRACKER_HOST_ENV, "10.0.0.2"), (TRACKER_PORT_ENV, "9190")]);
        let settings = Settings::from_cli(&cli, ok).unwrap();
        assert_eq!(
            settings.tracker,
            Some(TrackerAddress {
                host: "10.0.0.2".to_string(),
                port: 9190
            })
        );
    }
}
