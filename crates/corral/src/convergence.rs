//! Convergence wait: polls the coordinator quorum until the expected
//! worker set is registered.
//!
//! Matching is by durable identity, not by address: a returned entry only
//! counts when its `(permanent id, start sequence number)` pair exactly
//! matches a locally known incarnation. A stale registration left over from
//! a worker that has since restarted shares the permanent id but not the
//! sequence number, so it never counts.

use std::time::{Duration, Instant};

use corral_daemon_types::{NodeIdentity, WorkerEntry};
use tracing::{debug, info};

use crate::error::ClusterError;
use crate::retry::poll_until;
use crate::rpc::MembershipClient;

/// Tracing target for the convergence wait.
const CONVERGENCE_TARGET: &str = "corral::convergence";

/// Interval between membership polls.
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Waits until exactly `expected` locally known workers appear in the
/// coordinator's registration list, or the timeout expires.
///
/// The deadline is computed once at entry. Each round issues a membership
/// call bounded by the remaining time; an RPC failure propagates
/// immediately rather than being retried, because a coordinator that
/// should already be up failing to answer is fatal, not transient. An
/// observed count above `expected` (stale entries not yet pruned) keeps
/// polling until the deadline.
///
/// # Errors
///
/// Returns `ConvergenceTimeout` when the deadline passes, or any error
/// from the membership call verbatim.
pub fn wait_for_worker_count(
    client: &dyn MembershipClient,
    local_workers: &[NodeIdentity],
    expected: usize,
    timeout: Duration,
) -> Result<(), ClusterError> {
    let deadline = Instant::now() + timeout;
    let converged = poll_until(deadline, RETRY_INTERVAL, || {
        // poll_until checked the deadline, but clamp anyway so a last-tick
        // call never gets a zero timeout.
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        let observed = client.list_workers(remaining)?;
        let matched = count_matching(local_workers, &observed);
        debug!(
            target: CONVERGENCE_TARGET,
            matched,
            expected,
            observed = observed.len(),
            "membership poll"
        );
        Ok((matched == expected).then_some(()))
    })?;
    match converged {
        Some(()) => {
            info!(
                target: CONVERGENCE_TARGET,
                expected, "worker(s) registered with the coordinator"
            );
            Ok(())
        }
        None => Err(ClusterError::ConvergenceTimeout { expected, timeout }),
    }
}

/// Counts observed entries whose identity exactly matches a locally known
/// incarnation.
pub(crate) fn count_matching(local: &[NodeIdentity], observed: &[WorkerEntry]) -> usize {
    observed
        .iter()
        .filter(|entry| local.contains(&entry.identity))
        .count()
}
