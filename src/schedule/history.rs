//! Tuning history
//!
//! Tuned schedules are stored one JSON record per line in
//! `<config-dir>/<device-key>.convolutions.log`. Later or cheaper records for
//! the same workload replace earlier ones; only the best survives loading.

use super::Schedule;
use log::{debug, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const HISTORY_FILE_SUFFIX: &str = "convolutions.log";

/// Location of the tuning log for `device_key`.
pub fn history_path(config_dir: &Path, device_key: &str) -> PathBuf {
    config_dir.join(format!("{device_key}.{HISTORY_FILE_SUFFIX}"))
}

/// One measured schedule for one workload key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TuningRecord {
    pub workload: String,
    pub schedule: Schedule,
    /// Mean execution time in seconds
    pub cost: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("failed to read tuning history {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct TuningHistory {
    best: FxHashMap<String, TuningRecord>,
}

impl TuningHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses log text, skipping blank and malformed lines.
    pub fn parse(text: &str) -> Self {
        let mut history = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TuningRecord>(line) {
                Ok(record) => history.insert(record),
                Err(e) => warn!("Skipping malformed tuning record on line {}: {}", lineno + 1, e),
            }
        }
        history
    }

    pub fn load(path: &Path) -> Result<Self, HistoryError> {
        let text = std::fs::read_to_string(path).map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let history = Self::parse(&text);
        debug!(
            "Loaded {} tuned workloads from {}",
            history.len(),
            path.display()
        );
        Ok(history)
    }

    /// Loads `path`, or returns an empty history (every lookup then falls
    /// back to the generic schedule) when it cannot be read.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(history) => history,
            Err(e) => {
                warn!("{e}; manual schedules will fall back to generic ones");
                Self::new()
            }
        }
    }

    /// Adds `record` if it beats the current best for its workload.
    pub fn insert(&mut self, record: TuningRecord) {
        if !record.cost.is_finite() {
            return;
        }
        match self.best.get(&record.workload) {
            Some(current) if current.cost <= record.cost => {}
            _ => {
                self.best.insert(record.workload.clone(), record);
            }
        }
    }

    pub fn best(&self, workload: &str) -> Option<&TuningRecord> {
        self.best.get(workload)
    }

    pub fn len(&self) -> usize {
        self.best.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }
}
