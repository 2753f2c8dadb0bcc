//! Top-level orchestration of an external mini-cluster.
//!
//! [`Cluster`] owns every daemon handle. Bring-up is strictly sequential:
//! coordinators first (single or leader-plus-followers), then workers one
//! by one, because each later node's flags depend on the endpoints
//! discovered for the earlier ones. Nothing runs concurrently inside the
//! harness; the only real concurrency is the external processes
//! themselves.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use corral_daemon_types::{HostPort, NodeIdentity};
use tracing::info;

use crate::convergence;
use crate::daemon::{DaemonHandle, NodeRole};
use crate::error::ClusterError;
use crate::paths::HarnessPaths;
use crate::rpc::{MembershipProxy, RpcClientBuilder, RpcTransport};
use crate::topology::{self, ClusterOptions};

/// Tracing target for cluster orchestration.
const CLUSTER_TARGET: &str = "corral::cluster";

/// Binary name of the coordinator server, looked up under the binary root.
pub const COORDINATOR_BINARY: &str = "corral-coordinatord";

/// Binary name of the worker server, looked up under the binary root.
pub const WORKER_BINARY: &str = "corral-workerd";

/// How long bring-up waits for the full worker set to register.
const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Created, nothing launched yet.
    NotStarted,
    /// Bring-up in progress.
    Starting,
    /// Bring-up finished and the worker set converged.
    Running,
    /// Teardown in progress.
    ShuttingDown,
    /// Everything torn down; terminal.
    Stopped,
}

/// An ad-hoc cluster of external coordinator and worker processes.
#[derive(Debug)]
pub struct Cluster {
    opts: ClusterOptions,
    paths: Option<HarnessPaths>,
    coordinators: Vec<DaemonHandle>,
    workers: Vec<DaemonHandle>,
    state: ClusterState,
    transport: Option<Arc<RpcTransport>>,
}

impl Cluster {
    /// Creates a cluster in the `NotStarted` state.
    #[must_use]
    pub fn new(opts: ClusterOptions) -> Self {
        Self {
            opts,
            paths: None,
            coordinators: Vec::new(),
            workers: Vec::new(),
            state: ClusterState::NotStarted,
            transport: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClusterState {
        self.state
    }

    /// Brings the whole cluster up: coordinators, workers, convergence.
    ///
    /// On failure the partially built cluster is left running for the
    /// caller to inspect; call [`Cluster::shutdown`] to clean up. The
    /// cluster reaches `Running` only when the full worker set converged.
    ///
    /// # Errors
    ///
    /// Propagates configuration, launch, probe, RPC, and convergence
    /// failures unchanged, and returns `IllegalState` when called in any
    /// state other than `NotStarted`; a cluster object is single-use.
    pub fn start(&mut self) -> Result<(), ClusterError> {
        if self.state != ClusterState::NotStarted {
            return Err(ClusterError::IllegalState {
                operation: "start",
                reason: format!("cluster is {:?}, not NotStarted", self.state),
            });
        }
        self.state = ClusterState::Starting;

        let paths = HarnessPaths::resolve(&self.opts)?;
        fs::create_dir_all(paths.data_root()).map_err(|source| ClusterError::CreateDataRoot {
            path: paths.data_root().to_path_buf(),
            source,
        })?;
        info!(
            target: CLUSTER_TARGET,
            bin_root = %paths.bin_root().display(),
            data_root = %paths.data_root().display(),
            coordinators = self.opts.coordinators,
            workers = self.opts.workers,
            "starting cluster"
        );
        self.paths = Some(paths);
        self.transport = Some(Arc::new(RpcTransport::new()));

        if self.opts.coordinators == 1 {
            self.start_single_coordinator()?;
        } else {
            self.start_distributed_coordinators()?;
        }

        for _ in 0..self.opts.workers {
            self.add_worker()?;
        }
        self.wait_for_worker_count(self.opts.workers, CONVERGENCE_TIMEOUT)?;

        self.state = ClusterState::Running;
        info!(target: CLUSTER_TARGET, "cluster running");
        Ok(())
    }

    /// Tears everything down: coordinators, workers, transport.
    ///
    /// Infallible and idempotent; calling it again once stopped is a
    /// no-op. Individual teardown failures are logged by the handles, not
    /// propagated, because the kill is forceful.
    pub fn shutdown(&mut self) {
        if self.state == ClusterState::Stopped {
            return;
        }
        self.state = ClusterState::ShuttingDown;
        info!(target: CLUSTER_TARGET, "shutting down cluster");
        for coordinator in &mut self.coordinators {
            coordinator.shutdown();
        }
        self.coordinators.clear();
        for worker in &mut self.workers {
            worker.shutdown();
        }
        self.workers.clear();
        self.transport = None;
        self.state = ClusterState::Stopped;
    }

    /// Starts one more worker, pointed at the current coordinator set.
    ///
    /// Used by bring-up for every requested worker and available to tests
    /// that grow the cluster afterwards.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` when no coordinator is up yet, otherwise
    /// propagates the worker's start failure.
    pub fn add_worker(&mut self) -> Result<(), ClusterError> {
        if self.coordinators.is_empty() {
            return Err(ClusterError::IllegalState {
                operation: "add_worker",
                reason: "at least one coordinator must be started first".to_owned(),
            });
        }
        let paths = self.require_paths()?;
        let index = self.workers.len();
        let endpoints: Vec<HostPort> = self
            .coordinators
            .iter()
            .map(|coordinator| coordinator.bound_rpc_endpoint().clone())
            .collect();
        let plan = topology::plan_worker(&self.opts, index, endpoints);
        let mut handle = DaemonHandle::new(
            paths.binary_path(WORKER_BINARY),
            paths.data_path(&format!("worker-{index}")),
            NodeRole::Worker {
                coordinator_addresses: plan.coordinator_addresses,
            },
            HostPort::ephemeral_localhost(),
            plan.flags,
        );
        handle.start()?;
        self.workers.push(handle);
        Ok(())
    }

    /// Waits until `expected` locally known workers are registered with
    /// the leader coordinator.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` before any coordinator is up, otherwise the
    /// convergence outcome.
    pub fn wait_for_worker_count(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let proxy = self.leader_proxy()?;
        let local: Vec<NodeIdentity> = self
            .workers
            .iter()
            .map(|worker| worker.identity().clone())
            .collect();
        convergence::wait_for_worker_count(&proxy, &local, expected, timeout)
    }

    /// Membership client for the leader coordinator (index 0).
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` before any coordinator is up or after the
    /// transport has been released by shutdown.
    pub fn leader_proxy(&self) -> Result<MembershipProxy, ClusterError> {
        let Some(leader) = self.coordinators.first() else {
            return Err(ClusterError::IllegalState {
                operation: "leader_proxy",
                reason: "no coordinator is running".to_owned(),
            });
        };
        let transport = self.require_transport()?;
        Ok(MembershipProxy::new(
            transport,
            leader.bound_rpc_endpoint().clone(),
        ))
    }

    /// Constructor for external RPC clients preconfigured to the leader
    /// coordinator's endpoint.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` unless the cluster is `Running`.
    pub fn client_builder(&self) -> Result<RpcClientBuilder, ClusterError> {
        if self.state != ClusterState::Running {
            return Err(ClusterError::IllegalState {
                operation: "client_builder",
                reason: format!("cluster is {:?}, not Running", self.state),
            });
        }
        let Some(leader) = self.coordinators.first() else {
            return Err(ClusterError::IllegalState {
                operation: "client_builder",
                reason: "no coordinator is running".to_owned(),
            });
        };
        Ok(RpcClientBuilder::new(
            self.require_transport()?,
            leader.bound_rpc_endpoint().clone(),
        ))
    }

    /// The coordinator handles, bring-up leader first.
    #[must_use]
    pub fn coordinators(&self) -> &[DaemonHandle] {
        &self.coordinators
    }

    /// The worker handles in start order.
    #[must_use]
    pub fn workers(&self) -> &[DaemonHandle] {
        &self.workers
    }

    /// The bring-up leader coordinator, when any coordinator is up.
    #[must_use]
    pub fn leader_coordinator(&self) -> Option<&DaemonHandle> {
        self.coordinators.first()
    }

    /// Mutable access to one coordinator, for fault injection.
    pub fn coordinator_mut(&mut self, index: usize) -> Option<&mut DaemonHandle> {
        self.coordinators.get_mut(index)
    }

    /// Mutable access to one worker, for fault injection.
    pub fn worker_mut(&mut self, index: usize) -> Option<&mut DaemonHandle> {
        self.workers.get_mut(index)
    }

    fn start_single_coordinator(&mut self) -> Result<(), ClusterError> {
        let paths = self.require_paths()?;
        let plan = topology::plan_single_coordinator(&self.opts);
        let mut handle = DaemonHandle::new(
            paths.binary_path(COORDINATOR_BINARY),
            paths.data_path("coordinator-0"),
            NodeRole::Coordinator,
            plan.rpc_bind_address,
            plan.flags,
        );
        handle.start()?;
        self.coordinators.push(handle);
        Ok(())
    }

    fn start_distributed_coordinators(&mut self) -> Result<(), ClusterError> {
        let paths = self.require_paths()?;
        let exe = paths.binary_path(COORDINATOR_BINARY);
        let plans = topology::plan_distributed_coordinators(&self.opts)?;
        for (index, plan) in plans.into_iter().enumerate() {
            let mut handle = DaemonHandle::new(
                exe.clone(),
                paths.data_path(&format!("coordinator-{index}")),
                NodeRole::Coordinator,
                plan.rpc_bind_address,
                plan.flags,
            );
            handle.start()?;
            self.coordinators.push(handle);
        }
        Ok(())
    }

    fn require_paths(&self) -> Result<HarnessPaths, ClusterError> {
        self.paths
            .clone()
            .ok_or_else(|| ClusterError::IllegalState {
                operation: "require_paths",
                reason: "cluster roots are resolved by start()".to_owned(),
            })
    }

    fn require_transport(&self) -> Result<Arc<RpcTransport>, ClusterError> {
        self.transport
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| ClusterError::IllegalState {
                operation: "require_transport",
                reason: "the transport context has been released".to_owned(),
            })
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if !matches!(self.state, ClusterState::NotStarted | ClusterState::Stopped) {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_idempotent_even_when_never_started() {
        let mut cluster = Cluster::new(ClusterOptions::default());
        assert_eq!(cluster.state(), ClusterState::NotStarted);
        cluster.shutdown();
        assert_eq!(cluster.state(), ClusterState::Stopped);
        cluster.shutdown();
        cluster.shutdown();
        assert_eq!(cluster.state(), ClusterState::Stopped);
    }

    #[test]
    fn a_stopped_cluster_cannot_be_started_again() {
        let mut cluster = Cluster::new(ClusterOptions::default());
        cluster.shutdown();
        let error = cluster.start().expect_err("single-use object");
        assert!(matches!(
            error,
            ClusterError::IllegalState {
                operation: "start",
                ..
            }
        ));
    }

    #[test]
    fn client_builder_requires_a_running_cluster() {
        let cluster = Cluster::new(ClusterOptions::default());
        let error = cluster.client_builder().expect_err("not running");
        assert!(matches!(error, ClusterError::IllegalState { .. }));
    }

    #[test]
    fn worker_cannot_be_added_before_any_coordinator() {
        let mut cluster = Cluster::new(ClusterOptions::default());
        let error = cluster.add_worker().expect_err("no coordinator yet");
        assert!(matches!(
            error,
            ClusterError::IllegalState {
                operation: "add_worker",
                ..
            }
        ));
    }

    #[test]
    fn membership_queries_require_a_coordinator() {
        let cluster = Cluster::new(ClusterOptions::default());
        let error = cluster
            .wait_for_worker_count(1, Duration::from_millis(10))
            .expect_err("no coordinator yet");
        assert!(matches!(error, ClusterError::IllegalState { .. }));
    }

    #[test]
    fn accessors_are_empty_before_start() {
        let mut cluster = Cluster::new(ClusterOptions::default());
        assert!(cluster.coordinators().is_empty());
        assert!(cluster.workers().is_empty());
        assert!(cluster.leader_coordinator().is_none());
        assert!(cluster.coordinator_mut(0).is_none());
        assert!(cluster.worker_mut(0).is_none());
    }
}
