//! Thin ownership wrapper around one external server process.
//!
//! [`ManagedProcess`] covers the capability set the harness needs: launch,
//! suspend/resume/terminate, and blocking or non-blocking exit retrieval.
//! Signal delivery is POSIX-only; other targets surface
//! `UnsupportedPlatform` instead of pretending.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::debug;

use crate::error::ClusterError;

#[cfg(unix)]
use libc::{SIGCONT, SIGSTOP, kill};

/// Tracing target for process control operations.
const PROCESS_TARGET: &str = "corral::process";

/// One OS-level child process owned by exactly one daemon handle.
///
/// The wrapper is single-shot: once launched it refuses a second launch
/// until [`ManagedProcess::reset`] detaches the previous child.
#[derive(Debug)]
pub struct ManagedProcess {
    exe: PathBuf,
    child: Option<Child>,
    exit: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Creates an unlaunched wrapper for the given executable.
    #[must_use]
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            child: None,
            exit: None,
        }
    }

    /// Path of the wrapped executable.
    #[must_use]
    pub fn exe(&self) -> &Path {
        self.exe.as_path()
    }

    /// Whether a child has been launched and not yet reset.
    ///
    /// This tracks handle ownership, not liveness; a child that exited but
    /// has not been reset still counts as launched.
    #[must_use]
    pub fn is_launched(&self) -> bool {
        self.child.is_some()
    }

    /// Pid of the running child, if any.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Spawns the executable with the given argument vector.
    ///
    /// `arg0` is presented to the child as its own name, matching the
    /// convention that servers see their basename rather than the full
    /// launch path. Stdout and stderr are inherited so server logs land in
    /// the test output.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` when a child is already attached and
    /// `LaunchFailed` when the OS refuses the spawn.
    pub fn launch(&mut self, arg0: &str, args: &[String]) -> Result<(), ClusterError> {
        if self.child.is_some() {
            return Err(ClusterError::IllegalState {
                operation: "launch",
                reason: format!("'{}' has already been launched", self.exe.display()),
            });
        }
        let mut command = Command::new(&self.exe);
        command
            .args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.arg0(arg0);
        }
        #[cfg(not(unix))]
        let _ = arg0;
        let child = command.spawn().map_err(|source| ClusterError::LaunchFailed {
            binary: self.exe.clone(),
            source,
        })?;
        debug!(
            target: PROCESS_TARGET,
            binary = %self.exe.display(),
            pid = child.id(),
            "launched process"
        );
        self.child = Some(child);
        self.exit = None;
        Ok(())
    }

    /// Suspends the child with SIGSTOP. No-op success when never launched.
    ///
    /// # Errors
    ///
    /// Returns `Signal` when delivery fails, or `UnsupportedPlatform` on
    /// non-Unix targets.
    pub fn suspend(&self) -> Result<(), ClusterError> {
        match &self.child {
            Some(child) => signal(child.id(), Signal::Stop),
            None => Ok(()),
        }
    }

    /// Resumes a suspended child with SIGCONT. No-op success when never
    /// launched.
    ///
    /// # Errors
    ///
    /// Returns `Signal` when delivery fails, or `UnsupportedPlatform` on
    /// non-Unix targets.
    pub fn resume(&self) -> Result<(), ClusterError> {
        match &self.child {
            Some(child) => signal(child.id(), Signal::Continue),
            None => Ok(()),
        }
    }

    /// Forcefully terminates the child. No-op success when never launched
    /// or when the child has already exited.
    ///
    /// # Errors
    ///
    /// Returns `Signal` when the kill cannot be delivered to a live child.
    pub fn kill(&mut self) -> Result<(), ClusterError> {
        let Some(child) = &mut self.child else {
            return Ok(());
        };
        let pid = child.id();
        match child.kill() {
            Ok(()) => Ok(()),
            // The standard library reports a kill on an already-reaped
            // child as InvalidInput; the goal state is reached either way.
            Err(error) if error.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(source) => Err(ClusterError::Signal { pid, source }),
        }
    }

    /// Blocks until the child exits and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` when never launched and `MonitorProcess` when
    /// the wait itself fails.
    pub fn wait(&mut self) -> Result<ExitStatus, ClusterError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let Some(child) = &mut self.child else {
            return Err(ClusterError::IllegalState {
                operation: "wait",
                reason: format!("'{}' was never launched", self.exe.display()),
            });
        };
        let exit = child.wait().map_err(|source| ClusterError::MonitorProcess {
            binary: self.exe.clone(),
            source,
        })?;
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Non-blocking exit check: `None` while the child is still running,
    /// the exit status once it has terminated.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` when never launched and `MonitorProcess` when
    /// polling fails.
    pub fn poll_exited(&mut self) -> Result<Option<ExitStatus>, ClusterError> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let Some(child) = &mut self.child else {
            return Err(ClusterError::IllegalState {
                operation: "poll_exited",
                reason: format!("'{}' was never launched", self.exe.display()),
            });
        };
        let polled = child
            .try_wait()
            .map_err(|source| ClusterError::MonitorProcess {
                binary: self.exe.clone(),
                source,
            })?;
        if let Some(exit) = polled {
            self.exit = Some(exit);
        }
        Ok(polled)
    }

    /// Detaches the current child so the wrapper can launch again.
    pub fn reset(&mut self) {
        self.child = None;
        self.exit = None;
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Stop,
    Continue,
}

#[cfg(unix)]
fn signal(pid: u32, which: Signal) -> Result<(), ClusterError> {
    let signum = match which {
        Signal::Stop => SIGSTOP,
        Signal::Continue => SIGCONT,
    };
    // SAFETY: `kill(2)` is memory-safe even when the PID is invalid; the
    // kernel simply returns an error.
    let result = unsafe { kill(pid as libc::pid_t, signum) };
    if result == 0 {
        Ok(())
    } else {
        Err(ClusterError::Signal {
            pid,
            source: io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
fn signal(_pid: u32, _which: Signal) -> Result<(), ClusterError> {
    Err(ClusterError::UnsupportedPlatform)
}
