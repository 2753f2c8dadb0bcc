//! Error surface of the harness.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while bringing up, driving, or tearing down a cluster.
///
/// Every failure mode is a distinct variant so callers can branch on the
/// outcome; nothing is swallowed except process-wait failures during
/// shutdown, which are logged instead.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The requested topology is invalid, e.g. the coordinator port list
    /// does not match the coordinator count.
    #[error("invalid cluster configuration: {message}")]
    Configuration {
        /// What was wrong with the request.
        message: String,
    },
    /// Spawning the server binary failed outright.
    #[error("failed to launch '{binary}': {source}")]
    LaunchFailed {
        /// Path of the binary that could not be spawned.
        binary: PathBuf,
        /// Underlying spawn failure.
        #[source]
        source: io::Error,
    },
    /// The server started but exited before reporting its status.
    #[error("'{binary}' exited before reporting its status (exit code {code:?})")]
    ExitedEarly {
        /// Path of the binary that died.
        binary: PathBuf,
        /// Exit code, when the process was not killed by a signal.
        code: Option<i32>,
    },
    /// The status artefact never appeared; the process has been killed as
    /// cleanup before this error is returned.
    #[error("timed out after {timeout:?} waiting for status artifact at {path:?}")]
    StartupTimeout {
        /// Expected artefact location.
        path: PathBuf,
        /// How long the probe waited.
        timeout: Duration,
    },
    /// Reading the status artefact failed with an I/O error.
    #[error("failed to read status artifact {path:?}: {source}")]
    ReadStatus {
        /// Artefact location.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The status artefact exists but is not a valid record. Fatal; the
    /// probe never retries a parse failure.
    #[error("failed to parse status artifact {path:?}: {source}")]
    ParseStatus {
        /// Artefact location.
        path: PathBuf,
        /// Underlying JSON failure.
        #[source]
        source: serde_json::Error,
    },
    /// Removing a stale status artefact from a previous run failed.
    #[error("failed to remove stale status artifact {path:?}: {source}")]
    RemoveStaleStatus {
        /// Artefact location.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// An operation was invoked in a state that forbids it, e.g. restart
    /// without a prior shutdown or launching an already-launched process.
    #[error("{operation} is not valid here: {reason}")]
    IllegalState {
        /// The rejected operation.
        operation: &'static str,
        /// Why the current state forbids it.
        reason: String,
    },
    /// A membership call failed at the transport level. Propagated verbatim;
    /// the convergence wait treats this as fatal, not transient.
    #[error("membership call to {endpoint} failed: {source}")]
    Rpc {
        /// Coordinator endpoint that was called.
        endpoint: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// A membership message could not be encoded or decoded.
    #[error("invalid membership message from {endpoint}: {source}")]
    RpcProtocol {
        /// Coordinator endpoint that was called.
        endpoint: String,
        /// Underlying JSON failure.
        #[source]
        source: serde_json::Error,
    },
    /// The expected worker set never registered within the deadline.
    #[error("{expected} worker(s) never registered with the coordinator within {timeout:?}")]
    ConvergenceTimeout {
        /// Number of workers that was expected to register.
        expected: usize,
        /// How long the waiter polled.
        timeout: Duration,
    },
    /// Delivering a signal to a server process failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        /// Target process id.
        pid: u32,
        /// Underlying OS failure.
        #[source]
        source: io::Error,
    },
    /// Polling or waiting on a server process failed.
    #[error("failed to monitor '{binary}': {source}")]
    MonitorProcess {
        /// Path of the monitored binary.
        binary: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// Creating the cluster data root failed.
    #[error("failed to create data root {path:?}: {source}")]
    CreateDataRoot {
        /// The directory that could not be created.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The platform has no equivalent of the POSIX process signals the
    /// harness relies on.
    #[cfg(not(unix))]
    #[error("platform does not support process suspension signalling")]
    UnsupportedPlatform,
}
