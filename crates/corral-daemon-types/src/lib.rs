//! Types shared between the corral harness and the server binaries it drives.
//!
//! The harness and the servers never link against each other; they agree on
//! two external artefacts instead. Each server writes a [`ServerStatus`]
//! record to a well-known path inside its data directory once its listeners
//! are bound, and coordinators answer single-line JSON membership requests
//! ([`RpcRequest`]) over TCP. This crate pins down both formats so the two
//! sides cannot drift.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the status artefact inside a server's data directory.
pub const STATUS_FILE_NAME: &str = "status.json";

/// Returns the status artefact path for the given data directory.
#[must_use]
pub fn status_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STATUS_FILE_NAME)
}

/// A resolvable `host:port` network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    /// Host name or literal address.
    pub host: String,
    /// TCP port; `0` requests an ephemeral port from the kernel.
    pub port: u16,
}

impl HostPort {
    /// Builds an endpoint from its parts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Builds a loopback endpoint on the given port.
    #[must_use]
    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    /// Builds the loopback endpoint that asks the kernel for any free port.
    #[must_use]
    pub fn ephemeral_localhost() -> Self {
        Self::localhost(0)
    }

    /// Joins endpoints into the comma-separated form servers accept on the
    /// command line.
    #[must_use]
    pub fn comma_join(endpoints: &[Self]) -> String {
        endpoints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Error raised when parsing a `host:port` string fails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostPortParseError {
    /// The string had no `:` separator.
    #[error("endpoint '{input}' is missing a ':port' suffix")]
    MissingPort {
        /// The offending input.
        input: String,
    },
    /// The port component was not a valid 16-bit integer.
    #[error("endpoint '{input}' has an invalid port: {source}")]
    InvalidPort {
        /// The offending input.
        input: String,
        /// Underlying integer parse failure.
        #[source]
        source: std::num::ParseIntError,
    },
}

impl FromStr for HostPort {
    type Err = HostPortParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = input.rsplit_once(':') else {
            return Err(HostPortParseError::MissingPort {
                input: input.to_owned(),
            });
        };
        let port = port
            .parse::<u16>()
            .map_err(|source| HostPortParseError::InvalidPort {
                input: input.to_owned(),
                source,
            })?;
        Ok(Self::new(host, port))
    }
}

/// Durable identity of one server incarnation.
///
/// The permanent id is assigned to the data directory on first start and
/// survives restarts; the start sequence number is bumped on every fresh
/// process start. Two observations refer to the same live incarnation only
/// when both components match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Durable unique id tied to the data directory.
    pub permanent_id: String,
    /// Counter incremented on every fresh start of the node.
    pub start_seqno: u64,
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.permanent_id, self.start_seqno)
    }
}

/// Self-reported startup record a server writes once its listeners are bound.
///
/// The harness only ever reads this record; the addresses are authoritative
/// because the server binds before writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Identity of this incarnation.
    pub node: NodeIdentity,
    /// Bound RPC endpoints, most-preferred first.
    pub rpc_addresses: Vec<HostPort>,
    /// Bound embedded-web endpoints, most-preferred first.
    pub http_addresses: Vec<HostPort>,
}

/// One registered worker as reported by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    /// Identity the worker registered with.
    pub identity: NodeIdentity,
    /// The worker's bound RPC endpoint.
    pub rpc_address: HostPort,
}

/// A membership request, sent as a single JSON line over TCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Asks a coordinator for its currently registered workers.
    ListWorkers,
    /// Registers (or re-registers) a worker with a coordinator.
    RegisterWorker(WorkerEntry),
}

/// Response to [`RpcRequest::ListWorkers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListWorkersResponse {
    /// Workers currently known to the coordinator, including entries that
    /// may have gone away since they registered.
    pub workers: Vec<WorkerEntry>,
}

/// Response to [`RpcRequest::RegisterWorker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    /// Whether the registration was recorded.
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_round_trips_through_display_and_parse() {
        let endpoint = HostPort::localhost(7051);
        let parsed: HostPort = endpoint.to_string().parse().expect("parse host:port");
        assert_eq!(parsed, endpoint);
    }

    #[test]
    fn host_port_rejects_missing_port() {
        let error = "localhost".parse::<HostPort>().expect_err("missing port");
        assert!(matches!(error, HostPortParseError::MissingPort { .. }));
    }

    #[test]
    fn host_port_rejects_non_numeric_port() {
        let error = "localhost:rpc".parse::<HostPort>().expect_err("bad port");
        assert!(matches!(error, HostPortParseError::InvalidPort { .. }));
    }

    #[test]
    fn comma_join_matches_flag_format() {
        let endpoints = [HostPort::localhost(7051), HostPort::localhost(7052)];
        assert_eq!(
            HostPort::comma_join(&endpoints),
            "127.0.0.1:7051,127.0.0.1:7052"
        );
    }

    #[test]
    fn server_status_deserializes_from_artifact_json() {
        let json = r#"{
            "node": {"permanent_id": "a1b2", "start_seqno": 3},
            "rpc_addresses": [{"host": "127.0.0.1", "port": 7051}],
            "http_addresses": [{"host": "127.0.0.1", "port": 8051}]
        }"#;
        let status: ServerStatus = serde_json::from_str(json).expect("parse status");
        assert_eq!(status.node.permanent_id, "a1b2");
        assert_eq!(status.node.start_seqno, 3);
        assert_eq!(status.rpc_addresses, vec![HostPort::localhost(7051)]);
    }

    #[test]
    fn list_workers_request_has_no_params() {
        let json = serde_json::to_string(&RpcRequest::ListWorkers).expect("serialize");
        assert_eq!(json, r#"{"method":"list_workers"}"#);
        let parsed: RpcRequest = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, RpcRequest::ListWorkers);
    }

    #[test]
    fn register_worker_request_round_trips() {
        let request = RpcRequest::RegisterWorker(WorkerEntry {
            identity: NodeIdentity {
                permanent_id: "a1b2".to_owned(),
                start_seqno: 1,
            },
            rpc_address: HostPort::localhost(7100),
        });
        let json = serde_json::to_string(&request).expect("serialize");
        let parsed: RpcRequest = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, request);
    }
}
