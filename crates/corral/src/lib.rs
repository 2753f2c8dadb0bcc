//! Test harness that runs a real multi-process cluster on one machine.
//!
//! The harness launches externally built coordinator and worker binaries
//! as child processes, waits for each to publish its status artifact,
//! wires the topology flags between them, and confirms over RPC that the
//! worker set has registered with the coordinator quorum. Handles stay
//! available afterwards for fault injection: suspend, resume, kill, and
//! restart of individual nodes.
//!
//! Entry point is [`Cluster`]: configure a [`ClusterOptions`], call
//! [`Cluster::start`], and drive the daemons through the handles it owns.
//! Dropping the cluster kills every remaining child process.

mod cluster;
mod convergence;
mod daemon;
mod error;
mod paths;
mod probe;
mod process;
mod retry;
mod rpc;
mod topology;


pub use cluster::{COORDINATOR_BINARY, Cluster, ClusterState, WORKER_BINARY};
pub use convergence::wait_for_worker_count;
pub use daemon::{DaemonHandle, NodeRole};
pub use error::ClusterError;
pub use paths::{BIN_ROOT_ENV, HarnessPaths};
pub use probe::{remove_stale_status, wait_for_status};
pub use process::ManagedProcess;
pub use rpc::{MembershipClient, MembershipProxy, RpcClientBuilder, RpcTransport};
pub use topology::{ClusterOptions, CoordinatorPlan, INDEX_PLACEHOLDER, WorkerPlan};
