//! Stub coordinator/worker server exercised by the harness end-to-end
//! tests.
//!
//! One binary serves both roles; the presence of
//! `--coordinator-addresses` selects the worker role. The stub honours the
//! full invocation contract: it persists a durable identity in its data
//! directory, bumps the start sequence number on every launch, binds its
//! RPC and web listeners, and only then publishes the status artefact. A
//! coordinator answers single-line JSON membership requests; a worker
//! registers itself with the first coordinator and then idles.

use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, bail};
use clap::Parser;
use corral_daemon_types::{
    HostPort, ListWorkersResponse, NodeIdentity, RegisterAck, RpcRequest, ServerStatus,
    WorkerEntry, status_path,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Tracing target for the stub server.
const TESTD_TARGET: &str = "corral_testd";

/// File persisting the node identity across restarts of one data directory.
const INSTANCE_FILE_NAME: &str = "instance.json";

/// How long a worker keeps retrying its initial registration.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between registration attempts.
const REGISTER_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Command line of the stub server, mirroring the harness's invocation
/// contract.
#[derive(Debug, Parser)]
#[command(name = "corral-testd")]
struct Args {
    /// Directory holding the node's identity and status artefact.
    #[arg(long)]
    data_dir: PathBuf,

    /// Address to bind the RPC listener to; port 0 requests an ephemeral
    /// port.
    #[arg(long)]
    rpc_bind_address: HostPort,

    /// Port for the embedded web listener; 0 requests an ephemeral port.
    #[arg(long, default_value_t = 0)]
    web_port: u16,

    /// Comma-separated coordinator endpoints; presence selects the worker
    /// role.
    #[arg(long)]
    coordinator_addresses: Option<String>,

    /// Marks a coordinator as the bring-up leader of its quorum.
    #[arg(long)]
    leader: bool,

    /// Fixed leader endpoint, passed to follower coordinators.
    #[arg(long)]
    leader_address: Option<HostPort>,

    /// Comma-separated peer follower endpoints.
    #[arg(long)]
    follower_addresses: Option<String>,

    /// Where to publish the status artefact; defaults inside the data
    /// directory.
    #[arg(long)]
    status_path: Option<PathBuf>,

    /// Serialisation of the status artefact; only `json` is supported.
    #[arg(long, default_value = "json")]
    status_format: String,

    /// Log to stderr instead of log files.
    #[arg(long)]
    log_to_stderr: bool,

    /// Flush every log line as it is written.
    #[arg(long)]
    log_flush_immediately: bool,

    /// Interface the web listener binds; only localhost is supported.
    #[arg(long)]
    web_interface: Option<String>,

    /// Free-form label recorded in the data directory, for tests that
    /// check per-instance flag plumbing.
    #[arg(long)]
    tag: Option<String>,
}

/// Durable per-data-directory identity record.
#[derive(Debug, Serialize, Deserialize)]
struct InstanceRecord {
    permanent_id: String,
    start_seqno: u64,
}

type Registry = Arc<Mutex<Vec<WorkerEntry>>>;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    run(&args)
}

fn run(args: &Args) -> anyhow::Result<()> {
    if args.status_format != "json" {
        bail!("unsupported status format '{}'", args.status_format);
    }
    if let Some(interface) = &args.web_interface
        && interface != "localhost"
    {
        bail!("unsupported web interface '{interface}'");
    }
    // stderr is unbuffered, so both logging flags are already the native
    // behaviour here.
    debug!(
        target: TESTD_TARGET,
        to_stderr = args.log_to_stderr,
        flush_immediately = args.log_flush_immediately,
        "logging configured"
    );
    fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("cannot create data directory '{}'", args.data_dir.display())
    })?;
    let identity = next_incarnation(&args.data_dir)?;
    if let Some(tag) = &args.tag {
        let tag_path = args.data_dir.join("tag.txt");
        fs::write(&tag_path, tag)
            .with_context(|| format!("cannot record tag '{}'", tag_path.display()))?;
    }

    let rpc_listener = TcpListener::bind((
        args.rpc_bind_address.host.as_str(),
        args.rpc_bind_address.port,
    ))
    .with_context(|| format!("cannot bind RPC listener on {}", args.rpc_bind_address))?;
    let rpc_address = HostPort::from(rpc_listener.local_addr()?);
    let web_listener = TcpListener::bind(("127.0.0.1", args.web_port))
        .with_context(|| format!("cannot bind web listener on port {}", args.web_port))?;
    let web_address = HostPort::from(web_listener.local_addr()?);

    let status = ServerStatus {
        node: identity.clone(),
        rpc_addresses: vec![rpc_address.clone()],
        http_addresses: vec![web_address],
    };
    let artifact = args
        .status_path
        .clone()
        .unwrap_or_else(|| status_path(&args.data_dir));
    write_status(&artifact, &status)?;
    info!(
        target: TESTD_TARGET,
        identity = %identity,
        rpc = %rpc_address,
        leader = args.leader,
        "listeners bound, status published"
    );

    thread::spawn(move || hold_listener(&web_listener));

    match &args.coordinator_addresses {
        Some(list) => {
            thread::spawn(move || hold_listener(&rpc_listener));
            run_worker(list, identity, rpc_address)
        }
        None => {
            info!(
                target: TESTD_TARGET,
                leader = args.leader,
                leader_address = ?args.leader_address,
                followers = ?args.follower_addresses,
                "coordinator quorum wiring"
            );
            run_coordinator(&rpc_listener)
        }
    }
}

/// Reads the previous incarnation record, bumps the sequence number, and
/// persists the result before anything becomes externally visible.
fn next_incarnation(data_dir: &Path) -> anyhow::Result<NodeIdentity> {
    let path = data_dir.join(INSTANCE_FILE_NAME);
    let record = match fs::read_to_string(&path) {
        Ok(text) => {
            let previous: InstanceRecord = serde_json::from_str(&text)
                .with_context(|| format!("corrupt instance record '{}'", path.display()))?;
            InstanceRecord {
                permanent_id: previous.permanent_id,
                start_seqno: previous.start_seqno + 1,
            }
        }
        Err(error) if error.kind() == ErrorKind::NotFound => InstanceRecord {
            permanent_id: fresh_permanent_id(),
            start_seqno: 1,
        },
        Err(error) => {
            return Err(error)
                .with_context(|| format!("cannot read instance record '{}'", path.display()));
        }
    };
    fs::write(&path, serde_json::to_string_pretty(&record)?)
        .with_context(|| format!("cannot persist instance record '{}'", path.display()))?;
    Ok(NodeIdentity {
        permanent_id: record.permanent_id,
        start_seqno: record.start_seqno,
    })
}

fn fresh_permanent_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    format!("{nanos:x}-{:x}", std::process::id())
}

/// Publishes the status artefact atomically so a reader never observes a
/// partial write.
fn write_status(path: &Path, status: &ServerStatus) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create '{}'", parent.display()))?;
    }
    let staged = path.with_extension("tmp");
    fs::write(&staged, serde_json::to_string_pretty(status)?)
        .with_context(|| format!("cannot stage status artefact '{}'", staged.display()))?;
    fs::rename(&staged, path)
        .with_context(|| format!("cannot publish status artefact '{}'", path.display()))?;
    Ok(())
}

/// Accepts and immediately drops connections, keeping the port bound.
fn hold_listener(listener: &TcpListener) {
    for stream in listener.incoming() {
        drop(stream);
    }
}

/// Serves membership requests forever.
fn run_coordinator(listener: &TcpListener) -> anyhow::Result<()> {
    let registry: Registry = Arc::new(Mutex::new(Vec::new()));
    info!(target: TESTD_TARGET, "coordinator serving membership requests");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(error) = handle_request(stream, &registry) {
                    warn!(target: TESTD_TARGET, error = %error, "membership request failed");
                }
            }
            Err(error) => warn!(target: TESTD_TARGET, error = %error, "accept failed"),
        }
    }
    Ok(())
}

fn handle_request(stream: TcpStream, registry: &Registry) -> anyhow::Result<()> {
    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line)?;
    let request: RpcRequest =
        serde_json::from_str(line.trim()).context("malformed membership request")?;
    let response = match request {
        RpcRequest::ListWorkers => {
            let workers = registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            serde_json::to_string(&ListWorkersResponse { workers })?
        }
        RpcRequest::RegisterWorker(entry) => {
            info!(target: TESTD_TARGET, worker = %entry.identity, "worker registered");
            upsert(registry, entry);
            serde_json::to_string(&RegisterAck { ok: true })?
        }
    };
    let mut writer = &stream;
    writer.write_all(response.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Replaces any previous registration of the same permanent id so a
/// restarted worker supersedes its stale entry.
fn upsert(registry: &Registry, entry: WorkerEntry) {
    let mut workers = registry.lock().unwrap_or_else(PoisonError::into_inner);
    match workers
        .iter_mut()
        .find(|known| known.identity.permanent_id == entry.identity.permanent_id)
    {
        Some(known) => *known = entry,
        None => workers.push(entry),
    }
}

/// Registers with the first coordinator, then idles holding the listeners.
fn run_worker(
    coordinator_list: &str,
    identity: NodeIdentity,
    rpc_address: HostPort,
) -> anyhow::Result<()> {
    let coordinators = parse_endpoints(coordinator_list)?;
    let target = coordinators
        .first()
        .context("worker started with an empty coordinator list")?;
    let entry = WorkerEntry {
        identity,
        rpc_address,
    };
    register_with_retry(target, &entry)?;
    info!(target: TESTD_TARGET, coordinator = %target, "registration acknowledged");
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

fn parse_endpoints(list: &str) -> anyhow::Result<Vec<HostPort>> {
    list.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<HostPort>()
                .with_context(|| format!("invalid endpoint '{part}'"))
        })
        .collect()
}

/// The coordinator is expected to be up already; the retry only covers the
/// window between its status publication and its accept loop.
fn register_with_retry(target: &HostPort, entry: &WorkerEntry) -> anyhow::Result<()> {
    let deadline = Instant::now() + REGISTER_TIMEOUT;
    loop {
        match register_once(target, entry) {
            Ok(ack) if ack.ok => return Ok(()),
            Ok(_) => bail!("coordinator {target} rejected the registration"),
            Err(error) => {
                if Instant::now() >= deadline {
                    return Err(error)
                        .with_context(|| format!("cannot register with coordinator {target}"));
                }
                warn!(target: TESTD_TARGET, error = %error, "registration attempt failed");
                thread::sleep(REGISTER_RETRY_INTERVAL);
            }
        }
    }
}

fn register_once(target: &HostPort, entry: &WorkerEntry) -> anyhow::Result<RegisterAck> {
    let stream = TcpStream::connect((target.host.as_str(), target.port))?;
    let request = serde_json::to_string(&RpcRequest::RegisterWorker(entry.clone()))?;
    let mut writer = &stream;
    writer.write_all(request.as_bytes())?;
    writer.write_all(b"\n")?;
    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line)?;
    let ack: RegisterAck =
        serde_json::from_str(line.trim()).context("malformed registration acknowledgement")?;
    Ok(ack)
}
