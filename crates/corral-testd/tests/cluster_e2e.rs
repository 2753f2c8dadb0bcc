//! End-to-end tests driving real stub server processes through the
//! harness.
//!
//! The stub binary is staged under both server names inside a temporary
//! binary root, so every cluster in these tests launches genuine child
//! processes, discovers their status artefacts, and talks real TCP to the
//! coordinator.

use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use corral::{
    COORDINATOR_BINARY, Cluster, ClusterError, ClusterOptions, ClusterState, MembershipClient,
    WORKER_BINARY,
};
use rstest::{fixture, rstest};
use tempfile::TempDir;

/// Stages the stub binary under both server names inside a fresh root.
#[fixture]
fn staged_roots() -> TempDir {
    let root = TempDir::new().expect("temp root");
    let bin_root = root.path().join("bin");
    fs::create_dir_all(&bin_root).expect("create bin root");
    let stub = Path::new(env!("CARGO_BIN_EXE_corral-testd"));
    for name in [COORDINATOR_BINARY, WORKER_BINARY] {
        let staged = bin_root.join(name);
        fs::hard_link(stub, &staged)
            .or_else(|_| fs::copy(stub, &staged).map(drop))
            .expect("stage stub binary");
    }
    root
}

fn options(root: &TempDir, workers: usize) -> ClusterOptions {
    ClusterOptions {
        workers,
        bin_root: Some(root.path().join("bin")),
        data_root: Some(root.path().join("data")),
        ..ClusterOptions::default()
    }
}

/// Reserves distinct loopback ports by binding and immediately releasing
/// them. A parallel test could grab one back before the cluster does, but
/// the window is tiny and a collision only fails this test, not the suite.
fn reserve_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind(("127.0.0.1", 0)).expect("reserve port"))
        .collect();
    listeners
        .iter()
        .map(|listener| listener.local_addr().expect("local addr").port())
        .collect()
}

#[rstest]
fn bring_up_converges_and_shutdown_is_idempotent(staged_roots: TempDir) {
    let mut cluster = Cluster::new(options(&staged_roots, 3));
    cluster.start().expect("cluster start");
    assert_eq!(cluster.state(), ClusterState::Running);
    assert_eq!(cluster.coordinators().len(), 1);
    assert_eq!(cluster.workers().len(), 3);

    // The start already waited for convergence; a fresh wait must succeed
    // quickly on the same membership.
    cluster
        .wait_for_worker_count(3, Duration::from_secs(5))
        .expect("converged membership");

    let builder = cluster.client_builder().expect("client builder");
    let workers = builder
        .build()
        .list_workers(Duration::from_secs(5))
        .expect("list workers");
    assert_eq!(workers.len(), 3);

    cluster.shutdown();
    assert_eq!(cluster.state(), ClusterState::Stopped);
    cluster.shutdown();
    assert_eq!(cluster.state(), ClusterState::Stopped);
}

#[rstest]
fn each_worker_reports_a_distinct_identity(staged_roots: TempDir) {
    let mut cluster = Cluster::new(options(&staged_roots, 2));
    cluster.start().expect("cluster start");

    let first = cluster.workers().first().expect("worker 0").identity().clone();
    let second = cluster.workers().get(1).expect("worker 1").identity().clone();
    assert_ne!(first.permanent_id, second.permanent_id);
    assert_eq!(first.start_seqno, 1);
    assert_eq!(second.start_seqno, 1);
}

#[rstest]
fn restart_rebinds_the_same_endpoint_with_a_new_incarnation(staged_roots: TempDir) {
    let mut cluster = Cluster::new(options(&staged_roots, 1));
    cluster.start().expect("cluster start");

    let worker = cluster.worker_mut(0).expect("worker handle");
    let endpoint = worker.bound_rpc_endpoint().clone();
    let identity = worker.identity().clone();

    worker.shutdown();
    worker.restart().expect("worker restart");

    assert_eq!(worker.bound_rpc_endpoint(), &endpoint);
    let reborn = worker.identity().clone();
    assert_eq!(reborn.permanent_id, identity.permanent_id);
    assert_eq!(reborn.start_seqno, identity.start_seqno + 1);

    // The restarted incarnation re-registers and supersedes its stale
    // entry, so convergence on the new identity must succeed.
    cluster
        .wait_for_worker_count(1, Duration::from_secs(5))
        .expect("reconverged membership");
}

#[rstest]
fn paused_workers_stay_up_and_resume(staged_roots: TempDir) {
    let mut cluster = Cluster::new(options(&staged_roots, 1));
    cluster.start().expect("cluster start");

    let worker = cluster.worker_mut(0).expect("worker handle");
    worker.pause().expect("pause worker");
    assert!(worker.is_running());
    worker.resume().expect("resume worker");
    assert!(worker.is_running());

    cluster
        .wait_for_worker_count(1, Duration::from_secs(5))
        .expect("membership unaffected");
}

#[rstest]
fn waiting_for_more_workers_than_exist_times_out(staged_roots: TempDir) {
    let mut cluster = Cluster::new(options(&staged_roots, 1));
    cluster.start().expect("cluster start");

    let error = cluster
        .wait_for_worker_count(2, Duration::from_millis(200))
        .expect_err("one worker cannot satisfy two");
    assert!(matches!(
        error,
        ClusterError::ConvergenceTimeout { expected: 2, .. }
    ));
}

#[rstest]
fn distributed_coordinators_come_up_on_their_assigned_ports(staged_roots: TempDir) {
    let ports = reserve_ports(3);
    let opts = ClusterOptions {
        coordinators: 3,
        coordinator_rpc_ports: ports.clone(),
        ..options(&staged_roots, 1)
    };
    let mut cluster = Cluster::new(opts);
    cluster.start().expect("cluster start");

    assert_eq!(cluster.coordinators().len(), 3);
    for (coordinator, port) in cluster.coordinators().iter().zip(&ports) {
        assert_eq!(coordinator.bound_rpc_endpoint().port, *port);
    }
    let leader = cluster.leader_coordinator().expect("leader");
    assert_eq!(
        Some(leader.bound_rpc_endpoint().port),
        ports.first().copied()
    );
}

#[rstest]
fn index_placeholder_reaches_each_worker(staged_roots: TempDir) {
    let opts = ClusterOptions {
        extra_worker_flags: vec!["--tag=worker-${index}".to_owned()],
        ..options(&staged_roots, 2)
    };
    let mut cluster = Cluster::new(opts);
    cluster.start().expect("cluster start");

    for index in 0..2 {
        let recorded = cluster
            .workers()
            .get(index)
            .map(|worker| worker.data_dir().join("tag.txt"))
            .expect("worker handle");
        let tag = fs::read_to_string(recorded).expect("tag recorded");
        assert_eq!(tag, format!("worker-{index}"));
    }
}

#[rstest]
fn missing_binaries_fail_the_launch(staged_roots: TempDir) {
    let opts = ClusterOptions {
        bin_root: Some(staged_roots.path().join("empty")),
        ..options(&staged_roots, 1)
    };
    let mut cluster = Cluster::new(opts);
    let error = cluster.start().expect_err("no binaries staged");
    assert!(matches!(error, ClusterError::LaunchFailed { .. }));

    cluster.shutdown();
    assert_eq!(cluster.state(), ClusterState::Stopped);
}
