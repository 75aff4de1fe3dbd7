//! Client side of the control protocol
//!
//! A connector locates the daemon through the discovery record. For
//! `ensure tunnel` it starts a daemon when none answers and retries with a
//! fixed backoff; every other request is sent exactly once.

use crate::spawner::DaemonSpawner;
use bastion_proto::{CodecError, ControlCodec, ControlRequest, ControlResponse, HostPort, Reply, StateRecord};
use bastion_tunnel::TunnelParams;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default number of attempts made by [`ClientConnector::ensure_tunnel`]
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default pause between attempts
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Connect timeout of the liveness probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Client connector errors
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Cannot connect to server after {attempts} attempt(s)")]
    Unreachable { attempts: u32 },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Unexpected reply to '{request}': {reply}")]
    UnexpectedReply { request: &'static str, reply: String },

    #[error("Failed to start daemon: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Client connector configuration
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Discovery record of the daemon
    pub state_file: PathBuf,
    pub attempts: u32,
    pub backoff: Duration,
    pub probe_timeout: Duration,
}

impl ConnectorConfig {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            attempts: DEFAULT_CONNECT_ATTEMPTS,
            backoff: DEFAULT_RETRY_BACKOFF,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

pub struct ClientConnector {
    config: ConnectorConfig,
    spawner: Arc<dyn DaemonSpawner>,
}

impl ClientConnector {
    pub fn new(config: ConnectorConfig, spawner: Arc<dyn DaemonSpawner>) -> Self {
        Self { config, spawner }
    }

    /// Ask the daemon for a tunnel, starting the daemon if needed
    ///
    /// Only failures to reach the daemon are retried. A rejected request is
    /// returned at once.
    pub async fn ensure_tunnel(&self, params: &TunnelParams) -> Result<HostPort, ConnectError> {
        let request = ControlRequest::EnsureTunnel {
            public_address: params.public_address.clone(),
            username: params.username.clone(),
            private_key: params.private_key.clone(),
            remote_bind: params.remote_bind.clone(),
            local_bind: params.local_bind.clone(),
        };

        let mut spawned = false;
        let attempts = self.config.attempts.max(1);

        for attempt in 1..=attempts {
            match self.locate().await {
                Some(addr) => match exchange(addr, &request).await {
                    Ok(ControlResponse::Processed(Reply::LocalBind(local_bind))) => {
                        return Ok(local_bind)
                    }
                    Ok(ControlResponse::BadRequest { reason }) => {
                        return Err(ConnectError::Rejected(reason))
                    }
                    Ok(other) => return Err(unexpected(&request, &other)),
                    Err(CodecError::IoError(e)) => {
                        debug!("Attempt {}/{}: daemon at {} unreachable: {}", attempt, attempts, addr, e);
                    }
                    Err(e) => return Err(e.into()),
                },
                None if !spawned => {
                    self.spawner
                        .spawn(&self.config.state_file)
                        .map_err(ConnectError::Spawn)?;
                    spawned = true;
                    info!("Started tunnel daemon for {:?}", self.config.state_file);
                }
                None => {
                    debug!("Attempt {}/{}: daemon not up yet", attempt, attempts);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.backoff).await;
            }
        }

        Err(ConnectError::Unreachable { attempts })
    }

    /// Send one request to a running daemon, without retries or spawning
    pub async fn message(&self, request: &ControlRequest) -> Result<ControlResponse, ConnectError> {
        let unreachable = ConnectError::Unreachable { attempts: 1 };

        let addr = self.locate().await.ok_or(unreachable)?;
        match exchange(addr, request).await {
            Ok(response) => Ok(response),
            Err(CodecError::IoError(e)) => {
                debug!("Daemon at {} unreachable: {}", addr, e);
                Err(ConnectError::Unreachable { attempts: 1 })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Summaries of the daemon's active tunnels
    pub async fn status(&self) -> Result<Vec<String>, ConnectError> {
        let request = ControlRequest::GetStatus;
        match self.message(&request).await? {
            ControlResponse::Processed(Reply::Status(tunnels)) => Ok(tunnels),
            ControlResponse::BadRequest { reason } => Err(ConnectError::Rejected(reason)),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Ask the daemon to stop; returns its acknowledgement
    pub async fn stop_server(&self) -> Result<String, ConnectError> {
        let request = ControlRequest::StopServer;
        match self.message(&request).await? {
            ControlResponse::Processed(Reply::Stopped(ack)) => Ok(ack),
            ControlResponse::BadRequest { reason } => Err(ConnectError::Rejected(reason)),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Address of a daemon that accepts connections, if any
    async fn locate(&self) -> Option<SocketAddr> {
        let record = match StateRecord::read(&self.config.state_file) {
            Ok(record) => record,
            Err(e) => {
                debug!("No usable discovery record: {}", e);
                return None;
            }
        };

        let addr = record.socket_addr();
        match timeout(self.config.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_probe)) => Some(addr),
            Ok(Err(e)) => {
                debug!("Stale discovery record {}: {}", record, e);
                None
            }
            Err(_) => {
                debug!("Probe of {} timed out", addr);
                None
            }
        }
    }
}

/// Send `request` on a fresh connection and read the single response
async fn exchange(addr: SocketAddr, request: &ControlRequest) -> Result<ControlResponse, CodecError> {
    let mut stream = TcpStream::connect(addr).await?;
    ControlCodec::write_message(&mut stream, request).await?;

    match ControlCodec::read_message(&mut stream).await? {
        Some(response) => Ok(response),
        None => Err(CodecError::IoError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before a reply",
        ))),
    }
}

fn unexpected(request: &ControlRequest, response: &ControlResponse) -> ConnectError {
    ConnectError::UnexpectedReply {
        request: request.kind(),
        reply: format!("{:?}", response),
    }
}
