//! Timing
//!
//! `measure` discards `warmup` invocations and then asks the function's own
//! time evaluator for the mean over `runs` repetitions. Errors are returned
//! as they are; the caller owns the failure path.

use crate::backend::{DeviceFunction, RunError};
use crate::tensor::DeviceBuffers;
use log::debug;
use std::time::Instant;

/// Mean seconds per invocation of `func` after `warmup` discarded runs.
pub fn measure(
    func: &mut dyn DeviceFunction,
    buffers: &mut DeviceBuffers,
    warmup: usize,
    runs: usize,
) -> Result<f64, RunError> {
    if runs == 0 {
        return Err(RunError::NoRuns);
    }
    debug!(
        "Timing {}: {warmup} warmup, {runs} timed runs",
        func.entry_name()
    );
    for _ in 0..warmup {
        func.invoke(buffers)?;
    }
    let report = func.time_evaluator(buffers, runs)?;
    Ok(report.mean)
}

/// Wall-clock mean of `number` calls to `f`, or `None` when `number` is 0.
pub fn time_repeated<E>(
    number: usize,
    mut f: impl FnMut() -> Result<(), E>,
) -> Result<Option<f64>, E> {
    if number == 0 {
        return Ok(None);
    }
    let start = Instant::now();
    for _ in 0..number {
        f()?;
    }
    Ok(Some(start.elapsed().as_secs_f64() / number as f64))
}
