//! Bounded polling shared by the startup probe and the convergence wait.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::ClusterError;

/// Runs `step` at a fixed interval until it produces a value, fails, or the
/// deadline passes.
///
/// The deadline is checked before every step, so a step is never started
/// with no time remaining. Returns `Ok(None)` when the deadline expired
/// without a value; errors from `step` propagate immediately.
pub(crate) fn poll_until<T, F>(
    deadline: Instant,
    interval: Duration,
    mut step: F,
) -> Result<Option<T>, ClusterError>
where
    F: FnMut() -> Result<Option<T>, ClusterError>,
{
    loop {
        if Instant::now() >= deadline {
            return Ok(None);
        }
        if let Some(value) = step()? {
            return Ok(Some(value));
        }
        thread::sleep(interval);
    }
}
