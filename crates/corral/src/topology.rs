//! Flag-set planning for single- and multi-coordinator topologies.
//!
//! The planner is pure: it turns a [`ClusterOptions`] into per-instance
//! bind addresses and flag vectors, leaving the launching to the daemon
//! handles. Peer wiring follows the leader/follower convention: the
//! coordinator at index 0 is the bring-up leader and knows every follower;
//! each follower knows the leader plus every follower except itself.

use std::path::PathBuf;

use corral_daemon_types::HostPort;

use crate::error::ClusterError;

/// Placeholder replaced with the zero-based instance index in per-role
/// extra flags.
pub const INDEX_PLACEHOLDER: &str = "${index}";

/// Desired shape of a cluster.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Number of coordinators; counts above one require
    /// [`ClusterOptions::coordinator_rpc_ports`].
    pub coordinators: usize,
    /// Number of workers started and waited for during bring-up.
    pub workers: usize,
    /// Explicit RPC port per coordinator; must match `coordinators` when
    /// the count is above one.
    pub coordinator_rpc_ports: Vec<u16>,
    /// Extra flags passed to every coordinator; may contain
    /// [`INDEX_PLACEHOLDER`].
    pub extra_coordinator_flags: Vec<String>,
    /// Extra flags passed to every worker; may contain
    /// [`INDEX_PLACEHOLDER`].
    pub extra_worker_flags: Vec<String>,
    /// Directory holding the server binaries; deduced from the running
    /// executable's directory when unset.
    pub bin_root: Option<PathBuf>,
    /// Directory receiving one data subdirectory per node; defaults under
    /// the system temp directory when unset.
    pub data_root: Option<PathBuf>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            coordinators: 1,
            workers: 1,
            coordinator_rpc_ports: Vec::new(),
            extra_coordinator_flags: Vec::new(),
            extra_worker_flags: Vec::new(),
            bin_root: None,
            data_root: None,
        }
    }
}

/// Planned bring-up of one coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorPlan {
    /// Address the coordinator is asked to bind its RPC interface to.
    pub rpc_bind_address: HostPort,
    /// Extra flags for the instance, peer wiring included.
    pub flags: Vec<String>,
}

/// Planned bring-up of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    /// Coordinator endpoints the worker registers with.
    pub coordinator_addresses: Vec<HostPort>,
    /// Extra flags for the instance.
    pub flags: Vec<String>,
}

/// Plans the minimal single-coordinator bring-up: ephemeral loopback bind,
/// extra flags substituted for instance 0.
#[must_use]
pub fn plan_single_coordinator(opts: &ClusterOptions) -> CoordinatorPlan {
    CoordinatorPlan {
        rpc_bind_address: HostPort::ephemeral_localhost(),
        flags: substitute_index_flags(&opts.extra_coordinator_flags, 0),
    }
}

/// Plans a leader-plus-followers coordinator quorum.
///
/// The coordinator at index 0 is the designated leader bound to the first
/// port; it is given the addresses of all followers. Each follower is given
/// the fixed leader address plus the addresses of all other followers,
/// excluding itself.
///
/// # Errors
///
/// Returns `Configuration` when the port list length does not match the
/// requested coordinator count, or when a port is listed twice.
pub fn plan_distributed_coordinators(
    opts: &ClusterOptions,
) -> Result<Vec<CoordinatorPlan>, ClusterError> {
    let count = opts.coordinators;
    if opts.coordinator_rpc_ports.len() != count {
        return Err(ClusterError::Configuration {
            message: format!(
                "{count} coordinators requested, but {} port(s) specified in coordinator_rpc_ports",
                opts.coordinator_rpc_ports.len()
            ),
        });
    }
    let mut seen = std::collections::HashSet::with_capacity(count);
    for port in &opts.coordinator_rpc_ports {
        if !seen.insert(*port) {
            return Err(ClusterError::Configuration {
                message: format!("coordinator port {port} is listed more than once"),
            });
        }
    }
    let addresses: Vec<HostPort> = opts
        .coordinator_rpc_ports
        .iter()
        .map(|port| HostPort::localhost(*port))
        .collect();
    let Some((leader_address, follower_addresses)) = addresses.split_first() else {
        return Err(ClusterError::Configuration {
            message: "at least one coordinator is required".to_owned(),
        });
    };

    let mut plans = Vec::with_capacity(count);

    let mut leader_flags = opts.extra_coordinator_flags.clone();
    leader_flags.push("--leader".to_owned());
    leader_flags.push(format!(
        "--follower-addresses={}",
        HostPort::comma_join(follower_addresses)
    ));
    plans.push(CoordinatorPlan {
        rpc_bind_address: leader_address.clone(),
        flags: substitute_index_flags(&leader_flags, 0),
    });

    for (offset, own_address) in follower_addresses.iter().enumerate() {
        let index = offset + 1;
        // Exclude self by position, not by address.
        let peers: Vec<HostPort> = follower_addresses
            .iter()
            .enumerate()
            .filter(|(peer_offset, _)| *peer_offset != offset)
            .map(|(_, peer)| peer.clone())
            .collect();
        let mut flags = opts.extra_coordinator_flags.clone();
        flags.push(format!("--leader-address={leader_address}"));
        flags.push(format!(
            "--follower-addresses={}",
            HostPort::comma_join(&peers)
        ));
        plans.push(CoordinatorPlan {
            rpc_bind_address: own_address.clone(),
            flags: substitute_index_flags(&flags, index),
        });
    }
    Ok(plans)
}

/// Plans worker `index`, pointing it at the full coordinator endpoint set.
#[must_use]
pub fn plan_worker(
    opts: &ClusterOptions,
    index: usize,
    coordinator_endpoints: Vec<HostPort>,
) -> WorkerPlan {
    WorkerPlan {
        coordinator_addresses: coordinator_endpoints,
        flags: substitute_index_flags(&opts.extra_worker_flags, index),
    }
}

/// Replaces every [`INDEX_PLACEHOLDER`] occurrence with the zero-based
/// instance index.
#[must_use]
pub fn substitute_index_flags(flags: &[String], index: usize) -> Vec<String> {
    let index_text = index.to_string();
    flags
        .iter()
        .map(|flag| flag.replace(INDEX_PLACEHOLDER, &index_text))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_ports(ports: &[u16]) -> ClusterOptions {
        ClusterOptions {
            coordinators: ports.len(),
            coordinator_rpc_ports: ports.to_vec(),
            ..ClusterOptions::default()
        }
    }

    fn follower_list(plan: &CoordinatorPlan) -> Vec<String> {
        let flag = plan
            .flags
            .iter()
            .find_map(|flag| flag.strip_prefix("--follower-addresses="))
            .expect("follower-addresses flag");
        if flag.is_empty() {
            Vec::new()
        } else {
            flag.split(',').map(ToOwned::to_owned).collect()
        }
    }

    #[test]
    fn single_coordinator_binds_ephemeral_loopback() {
        let plan = plan_single_coordinator(&ClusterOptions::default());
        assert_eq!(plan.rpc_bind_address, HostPort::localhost(0));
        assert!(plan.flags.is_empty());
    }

    #[test]
    fn port_count_mismatch_is_a_configuration_error() {
        let opts = ClusterOptions {
            coordinators: 3,
            coordinator_rpc_ports: vec![7051, 7052],
            ..ClusterOptions::default()
        };
        let error = plan_distributed_coordinators(&opts).expect_err("mismatch");
        assert!(matches!(error, ClusterError::Configuration { .. }));
    }

    #[test]
    fn duplicate_coordinator_ports_are_rejected() {
        let error = plan_distributed_coordinators(&options_with_ports(&[7051, 7052, 7051]))
            .expect_err("duplicate port");
        match error {
            ClusterError::Configuration { message } => {
                assert!(message.contains("7051"), "unexpected message: {message}");
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[test]
    fn leader_sees_every_follower_but_itself() {
        for count in 1_u16..=5 {
            let ports: Vec<u16> = (0..count).map(|i| 7051 + i).collect();
            let plans =
                plan_distributed_coordinators(&options_with_ports(&ports)).expect("plan");
            assert_eq!(plans.len(), usize::from(count));

            let leader = plans.first().expect("leader plan");
            let own = leader.rpc_bind_address.to_string();
            let followers = follower_list(leader);
            assert_eq!(followers.len(), usize::from(count) - 1);
            assert!(!followers.contains(&own));
        }
    }

    #[test]
    fn followers_exclude_themselves_and_the_leader() {
        let ports = [7051_u16, 7052, 7053, 7054];
        let plans = plan_distributed_coordinators(&options_with_ports(&ports)).expect("plan");
        let leader_address = plans.first().expect("leader").rpc_bind_address.to_string();

        for plan in plans.iter().skip(1) {
            let own = plan.rpc_bind_address.to_string();
            let peers = follower_list(plan);
            assert_eq!(peers.len(), ports.len() - 2);
            assert!(!peers.contains(&own));
            assert!(!peers.contains(&leader_address));
            assert!(
                plan.flags
                    .iter()
                    .any(|flag| flag == &format!("--leader-address={leader_address}"))
            );
        }
    }

    #[test]
    fn worker_plan_carries_all_coordinator_endpoints() {
        let endpoints = vec![HostPort::localhost(7051), HostPort::localhost(7052)];
        let plan = plan_worker(&ClusterOptions::default(), 0, endpoints.clone());
        assert_eq!(plan.coordinator_addresses, endpoints);
    }

    #[test]
    fn index_placeholder_is_substituted_per_instance() {
        let flags = vec![
            "--tag=node-${index}".to_owned(),
            "--plain".to_owned(),
        ];
        assert_eq!(
            substitute_index_flags(&flags, 2),
            vec!["--tag=node-2".to_owned(), "--plain".to_owned()]
        );
    }

    #[test]
    fn extra_flags_are_substituted_in_coordinator_plans() {
        let opts = ClusterOptions {
            coordinators: 2,
            coordinator_rpc_ports: vec![7051, 7052],
            extra_coordinator_flags: vec!["--tag=co-${index}".to_owned()],
            ..ClusterOptions::default()
        };
        let plans = plan_distributed_coordinators(&opts).expect("plan");
        assert!(plans[0].flags.contains(&"--tag=co-0".to_owned()));
        assert!(plans[1].flags.contains(&"--tag=co-1".to_owned()));
    }
}
