//! Membership RPC plumbing.
//!
//! The servers' wire protocol is an external collaborator; the harness only
//! needs one typed call, the membership listing a coordinator answers. The
//! exchange is a single JSON line each way over a fresh TCP connection.
//! [`RpcTransport`] is the shared, read-only transport context built once
//! per cluster and reused for every client construction.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use corral_daemon_types::{HostPort, ListWorkersResponse, RpcRequest, WorkerEntry};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::ClusterError;

/// Tracing target for membership calls.
const RPC_TARGET: &str = "corral::rpc";

/// Default upper bound on establishing a connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared transport context; read-only after construction and safely
/// reusable across all client constructions.
#[derive(Debug, Clone)]
pub struct RpcTransport {
    connect_timeout: Duration,
}

impl RpcTransport {
    /// Builds a transport with the default connect timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Builds a transport with an explicit connect timeout.
    #[must_use]
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Upper bound on establishing a connection.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for RpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// The one membership call the harness issues against a coordinator.
#[cfg_attr(test, mockall::automock)]
pub trait MembershipClient {
    /// Lists the workers currently registered with the coordinator,
    /// bounding the whole exchange by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Rpc` on transport failures and `RpcProtocol` on malformed
    /// messages.
    fn list_workers(&self, timeout: Duration) -> Result<Vec<WorkerEntry>, ClusterError>;
}

/// Concrete membership client for one coordinator endpoint.
#[derive(Debug, Clone)]
pub struct MembershipProxy {
    transport: Arc<RpcTransport>,
    endpoint: HostPort,
}

impl MembershipProxy {
    /// Builds a proxy speaking to `endpoint` over the shared transport.
    #[must_use]
    pub fn new(transport: Arc<RpcTransport>, endpoint: HostPort) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    /// The coordinator endpoint this proxy calls.
    #[must_use]
    pub fn endpoint(&self) -> &HostPort {
        &self.endpoint
    }

    fn call<R: DeserializeOwned>(
        &self,
        request: &RpcRequest,
        timeout: Duration,
    ) -> Result<R, ClusterError> {
        let endpoint = self.endpoint.to_string();
        let rpc_error = |source| ClusterError::Rpc {
            endpoint: endpoint.clone(),
            source,
        };
        let address = resolve(&self.endpoint).map_err(&rpc_error)?;
        let connect_timeout = self.transport.connect_timeout().min(timeout);
        let stream = TcpStream::connect_timeout(&address, connect_timeout).map_err(&rpc_error)?;
        stream.set_read_timeout(Some(timeout)).map_err(&rpc_error)?;
        stream.set_write_timeout(Some(timeout)).map_err(&rpc_error)?;

        let payload = serde_json::to_string(request).map_err(|source| {
            ClusterError::RpcProtocol {
                endpoint: endpoint.clone(),
                source,
            }
        })?;
        debug!(target: RPC_TARGET, endpoint = %endpoint, request = %payload, "membership call");
        let mut writer = &stream;
        writer.write_all(payload.as_bytes()).map_err(&rpc_error)?;
        writer.write_all(b"\n").map_err(&rpc_error)?;
        writer.flush().map_err(&rpc_error)?;

        let mut line = String::new();
        let read = BufReader::new(&stream)
            .read_line(&mut line)
            .map_err(&rpc_error)?;
        if read == 0 {
            return Err(rpc_error(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "coordinator closed the connection without responding",
            )));
        }
        serde_json::from_str(line.trim()).map_err(|source| ClusterError::RpcProtocol {
            endpoint,
            source,
        })
    }
}

impl MembershipClient for MembershipProxy {
    fn list_workers(&self, timeout: Duration) -> Result<Vec<WorkerEntry>, ClusterError> {
        let response: ListWorkersResponse = self.call(&RpcRequest::ListWorkers, timeout)?;
        Ok(response.workers)
    }
}

/// Constructor for RPC clients preconfigured to a coordinator endpoint,
/// usually the registered leader.
#[derive(Debug, Clone)]
pub struct RpcClientBuilder {
    transport: Arc<RpcTransport>,
    endpoint: HostPort,
}

impl RpcClientBuilder {
    pub(crate) fn new(transport: Arc<RpcTransport>, endpoint: HostPort) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    /// Endpoint the built clients will call.
    #[must_use]
    pub fn endpoint(&self) -> &HostPort {
        &self.endpoint
    }

    /// Builds a membership client for the configured endpoint.
    #[must_use]
    pub fn build(&self) -> MembershipProxy {
        MembershipProxy::new(Arc::clone(&self.transport), self.endpoint.clone())
    }
}

fn resolve(endpoint: &HostPort) -> std::io::Result<SocketAddr> {
    (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "endpoint resolved to no address",
            )
        })
}
