//! One logical server instance: a coordinator or worker under harness
//! control.
//!
//! A [`DaemonHandle`] owns the process, the data directory, and the status
//! record discovered at startup. Shutdown retains the bound endpoints so a
//! later restart can rebind the exact same addresses, keeping
//! identity-dependent peers oblivious to the bounce.

use std::path::{Path, PathBuf};
use std::time::Duration;

use corral_daemon_types::{HostPort, NodeIdentity, ServerStatus, status_path};
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::probe;
use crate::process::ManagedProcess;

/// Tracing target for daemon lifecycle operations.
const DAEMON_TARGET: &str = "corral::daemon";

/// How long a freshly launched server gets to report its status.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Which kind of node a handle drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRole {
    /// Control-plane node; may carry leader/follower wiring in its extra
    /// flags.
    Coordinator,
    /// Data-plane node that registers with the coordinator quorum.
    Worker {
        /// Full coordinator endpoint set the worker is pointed at.
        coordinator_addresses: Vec<HostPort>,
    },
}

/// Handle to one externally running server process.
#[derive(Debug)]
pub struct DaemonHandle {
    data_dir: PathBuf,
    extra_flags: Vec<String>,
    role: NodeRole,
    requested_rpc_bind: HostPort,
    requested_web_port: u16,
    process: ManagedProcess,
    status: Option<ServerStatus>,
    retained_rpc: Option<HostPort>,
    retained_http: Option<HostPort>,
}

impl DaemonHandle {
    /// Creates an unstarted handle.
    ///
    /// `rpc_bind_address` is the address the server will be asked to bind;
    /// pass [`HostPort::ephemeral_localhost`] to let the kernel pick a
    /// port. `extra_flags` are appended after the role flags so they can
    /// override them.
    #[must_use]
    pub fn new(
        exe: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        role: NodeRole,
        rpc_bind_address: HostPort,
        extra_flags: Vec<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            extra_flags,
            role,
            requested_rpc_bind: rpc_bind_address,
            requested_web_port: 0,
            process: ManagedProcess::new(exe),
            status: None,
            retained_rpc: None,
            retained_http: None,
        }
    }

    /// The node's data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        self.data_dir.as_path()
    }

    /// Whether the handle currently holds a launched process.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.process.is_launched()
    }

    /// Launches the server and waits for it to report its status.
    ///
    /// The final argument vector is the role flags (data directory, bind
    /// addresses), then the caller's extra flags, then the invocation
    /// contract every server receives: the status artefact path and format,
    /// unbuffered stderr logging, and a localhost-only web interface. Any
    /// stale artefact from a previous run is removed before the launch so
    /// discovery cannot succeed spuriously.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` when a process is already attached, or any
    /// launch/probe failure from [`crate::probe::wait_for_status`]. A
    /// failed start never leaves a child behind: whatever was launched is
    /// killed and reaped before the error is returned.
    pub fn start(&mut self) -> Result<(), ClusterError> {
        if self.process.is_launched() {
            return Err(ClusterError::IllegalState {
                operation: "start",
                reason: format!(
                    "daemon for {} is already running",
                    self.data_dir.display()
                ),
            });
        }
        let artifact = status_path(&self.data_dir);
        probe::remove_stale_status(&artifact)?;

        let mut argv = self.role_flags();
        argv.extend(self.extra_flags.iter().cloned());
        argv.push(format!("--status-path={}", artifact.display()));
        argv.push("--status-format=json".to_owned());
        argv.push("--log-to-stderr".to_owned());
        argv.push("--log-flush-immediately".to_owned());
        argv.push("--web-interface=localhost".to_owned());

        let arg0 = self
            .process
            .exe()
            .file_name()
            .and_then(|name| name.to_str())
            .map_or_else(|| "corral-server".to_owned(), ToOwned::to_owned);
        info!(
            target: DAEMON_TARGET,
            binary = %self.process.exe().display(),
            args = %argv.join(" "),
            "launching server"
        );
        self.process.launch(&arg0, &argv)?;

        let status = match probe::wait_for_status(&mut self.process, &artifact, STARTUP_TIMEOUT) {
            Ok(status) => status,
            Err(error) => {
                // The probe only kills on timeout; after a read or parse
                // failure the child is still running and would leak once
                // the handle detaches. Killing is harmless on the other
                // paths: an already-dead child reports success and the
                // wait returns the cached exit.
                if let Err(kill_error) = self.process.kill() {
                    warn!(
                        target: DAEMON_TARGET,
                        error = %kill_error,
                        "kill after failed start did not go through"
                    );
                }
                if let Err(wait_error) = self.process.wait() {
                    warn!(
                        target: DAEMON_TARGET,
                        error = %wait_error,
                        "wait after failed start did not go through"
                    );
                }
                self.process.reset();
                return Err(error);
            }
        };
        info!(
            target: DAEMON_TARGET,
            pid = ?self.process.id(),
            identity = %status.node,
            rpc = ?status.rpc_addresses.first().map(ToString::to_string),
            "server reported ready"
        );
        self.status = Some(status);
        Ok(())
    }

    /// Kills the server, retaining its bound endpoints for a restart.
    ///
    /// No-op when not running. The kill is forceful; a failed wait is
    /// logged, never propagated, because the goal state is already reached.
    pub fn shutdown(&mut self) {
        if !self.process.is_launched() {
            return;
        }
        // Store the addresses before the kill; a later restart reuses them.
        if let Some(status) = &self.status {
            self.retained_rpc = status.rpc_addresses.first().cloned();
            self.retained_http = status.http_addresses.first().cloned();
        }
        info!(
            target: DAEMON_TARGET,
            binary = %self.process.exe().display(),
            pid = ?self.process.id(),
            "killing server"
        );
        if let Err(error) = self.process.kill() {
            warn!(target: DAEMON_TARGET, error = %error, "kill failed");
        }
        if let Err(error) = self.process.wait() {
            warn!(target: DAEMON_TARGET, error = %error, "wait after kill failed");
        }
        self.process.reset();
    }

    /// Suspends the server process without losing its state.
    ///
    /// # Errors
    ///
    /// Returns `Signal` when delivery fails; no-op success when not
    /// running.
    pub fn pause(&self) -> Result<(), ClusterError> {
        if !self.process.is_launched() {
            return Ok(());
        }
        debug!(target: DAEMON_TARGET, pid = ?self.process.id(), "pausing server");
        self.process.suspend()
    }

    /// Resumes a previously paused server process.
    ///
    /// # Errors
    ///
    /// Returns `Signal` when delivery fails; no-op success when not
    /// running.
    pub fn resume(&self) -> Result<(), ClusterError> {
        if !self.process.is_launched() {
            return Ok(());
        }
        debug!(target: DAEMON_TARGET, pid = ?self.process.id(), "resuming server");
        self.process.resume()
    }

    /// Relaunches the server on the exact endpoints it was bound to before
    /// its shutdown.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` when no endpoints were retained, i.e. when
    /// [`DaemonHandle::shutdown`] was never called; identity continuity
    /// cannot be guaranteed otherwise. Otherwise propagates the same
    /// failures as [`DaemonHandle::start`].
    pub fn restart(&mut self) -> Result<(), ClusterError> {
        let Some(rpc) = self.retained_rpc.clone() else {
            return Err(ClusterError::IllegalState {
                operation: "restart",
                reason: "shutdown() must be called before restart()".to_owned(),
            });
        };
        self.requested_rpc_bind = rpc;
        if let Some(http) = &self.retained_http {
            self.requested_web_port = http.port;
        }
        self.start()
    }

    /// The server's bound RPC endpoint.
    ///
    /// # Panics
    ///
    /// Panics when called before the first successful start; that is a
    /// programming error, not a runtime condition.
    #[must_use]
    pub fn bound_rpc_endpoint(&self) -> &HostPort {
        self.require_status()
            .rpc_addresses
            .first()
            .unwrap_or_else(|| panic!("status record for {} has no RPC address", self.data_dir.display()))
    }

    /// The server's bound embedded-web endpoint.
    ///
    /// # Panics
    ///
    /// Panics when called before the first successful start.
    #[must_use]
    pub fn bound_http_endpoint(&self) -> &HostPort {
        self.require_status()
            .http_addresses
            .first()
            .unwrap_or_else(|| panic!("status record for {} has no HTTP address", self.data_dir.display()))
    }

    /// The `(permanent id, start sequence number)` identity of the current
    /// incarnation.
    ///
    /// # Panics
    ///
    /// Panics when called before the first successful start.
    #[must_use]
    pub fn identity(&self) -> &NodeIdentity {
        &self.require_status().node
    }

    fn require_status(&self) -> &ServerStatus {
        self.status.as_ref().unwrap_or_else(|| {
            panic!(
                "no status record for {}; call start() first",
                self.data_dir.display()
            )
        })
    }

    fn role_flags(&self) -> Vec<String> {
        let mut flags = vec![
            format!("--data-dir={}", self.data_dir.display()),
            format!("--rpc-bind-address={}", self.requested_rpc_bind),
            format!("--web-port={}", self.requested_web_port),
        ];
        if let NodeRole::Worker {
            coordinator_addresses,
        } = &self.role
        {
            flags.push(format!(
                "--coordinator-addresses={}",
                HostPort::comma_join(coordinator_addresses)
            ));
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unstarted_handle() -> DaemonHandle {
        DaemonHandle::new(
            "/no/such/corral-workerd",
            "/tmp/corral-test-worker",
            NodeRole::Worker {
                coordinator_addresses: vec![HostPort::localhost(7051)],
            },
            HostPort::ephemeral_localhost(),
            Vec::new(),
        )
    }

    #[test]
    fn restart_without_prior_shutdown_is_illegal() {
        let mut handle = unstarted_handle();
        let error = handle.restart().expect_err("restart must fail");
        assert!(matches!(
            error,
            ClusterError::IllegalState {
                operation: "restart",
                ..
            }
        ));
    }

    #[test]
    fn shutdown_before_start_is_a_noop() {
        let mut handle = unstarted_handle();
        handle.shutdown();
        assert!(!handle.is_running());
    }

    #[test]
    fn pause_and_resume_are_noops_when_not_running() {
        let handle = unstarted_handle();
        handle.pause().expect("pause not running");
        handle.resume().expect("resume not running");
    }

    #[test]
    fn start_surfaces_launch_failure() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let mut handle = DaemonHandle::new(
            dir.path().join("corral-workerd"),
            dir.path().join("worker-0"),
            NodeRole::Coordinator,
            HostPort::ephemeral_localhost(),
            Vec::new(),
        );
        let error = handle.start().expect_err("missing binary");
        assert!(matches!(error, ClusterError::LaunchFailed { .. }));
        assert!(!handle.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn malformed_artifact_kills_the_still_running_server() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().expect("temp dir");
        let data_dir = dir.path().join("worker-0");
        std::fs::create_dir_all(&data_dir).expect("create data dir");
        let pid_path = dir.path().join("server.pid");

        // Publishes garbage where the status record belongs, then lingers
        // like a live server would.
        let script_path = dir.path().join("corral-workerd");
        let script = format!(
            "#!/bin/sh\necho $$ > '{}'\necho not-json > '{}'\nexec /bin/sleep 300\n",
            pid_path.display(),
            corral_daemon_types::status_path(&data_dir).display(),
        );
        std::fs::write(&script_path, script).expect("write stub script");
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .expect("mark script executable");

        let mut handle = DaemonHandle::new(
            script_path,
            data_dir,
            NodeRole::Coordinator,
            HostPort::ephemeral_localhost(),
            Vec::new(),
        );
        let error = handle.start().expect_err("garbage artifact");
        assert!(matches!(error, ClusterError::ParseStatus { .. }));
        assert!(!handle.is_running());

        // The failed start must have killed and reaped the child; its pid
        // may no longer be signalled.
        let pid: i32 = std::fs::read_to_string(&pid_path)
            .expect("read pid file")
            .trim()
            .parse()
            .expect("parse pid");
        // SAFETY: signal 0 only probes for existence.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "server process {pid} outlived the failed start");
    }

    #[test]
    #[should_panic(expected = "no status record")]
    fn identity_before_start_is_a_programming_error() {
        let handle = unstarted_handle();
        let _ = handle.identity();
    }

    #[test]
    fn worker_role_flags_include_coordinator_list() {
        let handle = unstarted_handle();
        let flags = handle.role_flags();
        assert!(
            flags
                .iter()
                .any(|flag| flag == "--coordinator-addresses=127.0.0.1:7051")
        );
        assert!(flags.iter().any(|flag| flag == "--rpc-bind-address=127.0.0.1:0"));
        assert!(flags.iter().any(|flag| flag == "--web-port=0"));
    }
}
