//! Startup probe: discovers a server's bound endpoints after launch.
//!
//! A freshly launched server has no reachable interface the harness could
//! ask, so discovery works the other way round: the server writes a
//! [`ServerStatus`] record to a well-known path inside its data directory
//! once its listeners are bound, and the probe polls for that artefact
//! while watching the process for an early death.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use corral_daemon_types::ServerStatus;
use tracing::warn;

use crate::error::ClusterError;
use crate::process::ManagedProcess;
use crate::retry::poll_until;

/// Tracing target for startup probing.
const PROBE_TARGET: &str = "corral::probe";

/// Interval between artefact/exit checks.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Removes a status artefact left behind by a previous run.
///
/// Must be called before launching into a reused data directory, otherwise
/// the probe would instantly "discover" the stale record.
///
/// # Errors
///
/// Returns `RemoveStaleStatus` when the file exists but cannot be deleted.
pub fn remove_stale_status(path: &Path) -> Result<(), ClusterError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ClusterError::RemoveStaleStatus {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Waits for the status artefact to appear and parses it.
///
/// Polls every 10 ms, checking on each tick first for the artefact and then
/// non-blockingly whether the process has already exited. A dead process
/// aborts the wait immediately with `ExitedEarly` carrying the real exit
/// code rather than letting the timeout run out. When the deadline passes
/// with the process still alive, the process is killed as cleanup and
/// `StartupTimeout` is returned.
///
/// # Errors
///
/// Returns `ExitedEarly`, `StartupTimeout`, `ReadStatus`, or `ParseStatus`;
/// a parse failure is fatal and never retried.
pub fn wait_for_status(
    process: &mut ManagedProcess,
    status_path: &Path,
    timeout: Duration,
) -> Result<ServerStatus, ClusterError> {
    let deadline = Instant::now() + timeout;
    let binary = process.exe().to_path_buf();
    let appeared = poll_until(deadline, POLL_INTERVAL, || {
        if status_path.exists() {
            return Ok(Some(()));
        }
        if let Some(exit) = process.poll_exited()? {
            return Err(ClusterError::ExitedEarly {
                binary: binary.clone(),
                code: exit.code(),
            });
        }
        Ok(None)
    })?;
    if appeared.is_none() {
        // Still running but mute; reap it so the data directory is safe to
        // reuse.
        if let Err(error) = process.kill() {
            warn!(
                target: PROBE_TARGET,
                binary = %binary.display(),
                error = %error,
                "failed to kill process after startup timeout"
            );
        }
        if let Err(error) = process.wait() {
            warn!(
                target: PROBE_TARGET,
                binary = %binary.display(),
                error = %error,
                "failed to reap process after startup timeout"
            );
        }
        return Err(ClusterError::StartupTimeout {
            path: status_path.to_path_buf(),
            timeout,
        });
    }
    read_status(status_path)
}

/// Reads and parses the status artefact at `path`.
fn read_status(path: &Path) -> Result<ServerStatus, ClusterError> {
    let content = fs::read_to_string(path).map_err(|source| ClusterError::ReadStatus {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ClusterError::ParseStatus {
        path: path.to_path_buf(),
        source,
    })
}
