//! Control server
//!
//! Binds a loopback control endpoint, records it in the discovery record and
//! answers one request per connection against the tunnel registry. A
//! `stop server` request drains the daemon: the listener is closed and every
//! tunnel is stopped.

use bastion_proto::{
    CodecError, ControlCodec, ControlRequest, ControlResponse, Reply, StateFileError, StateRecord,
    CONTROL_HOST, DEFAULT_CONTROL_BASE_PORT,
};
use bastion_tunnel::{find_free_port, PortError, TunnelParams, TunnelRegistry, TunnelTransport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Reply text of a processed stop request
pub const STOPPED: &str = "stopped";

/// Reason given for frames that do not decode to a request
pub const INVALID_MESSAGE: &str = "invalid message";

/// Pause after a failed `accept()` before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Control server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind control endpoint {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No free control port: {0}")]
    NoFreePort(#[from] PortError),

    #[error("State file error: {0}")]
    StateFile(#[from] StateFileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where the discovery record is written
    pub state_file: PathBuf,
    pub host: String,
    /// First port tried for the control endpoint
    pub base_port: u16,
}

impl ServerConfig {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            host: CONTROL_HOST.to_string(),
            base_port: DEFAULT_CONTROL_BASE_PORT,
        }
    }

    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }
}

/// Requests a running server to drain
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // A full channel means a shutdown is already pending
        let _ = self.tx.try_send(());
    }
}

pub struct ControlServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ControlServer {
    /// Bind the control endpoint and write the discovery record
    ///
    /// On failure the discovery record is removed, so clients do not find a
    /// daemon that never came up.
    pub async fn bind(
        config: &ServerConfig,
        transport: Arc<dyn TunnelTransport>,
    ) -> Result<Self, ServerError> {
        let listener = match Self::bind_listener(config).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Control server failed to start: {}", e);
                StateRecord::remove(&config.state_file);
                return Err(e);
            }
        };

        let local_addr = listener.local_addr()?;
        StateRecord::from_socket_addr(local_addr).write(&config.state_file)?;

        info!("✅ Control server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(Self {
            listener,
            local_addr,
            registry: Arc::new(TunnelRegistry::new(transport)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    async fn bind_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
        let port = find_free_port(&config.host, config.base_port).await?;
        TcpListener::bind((config.host.as_str(), port))
            .await
            .map_err(|source| ServerError::Bind {
                address: format!("{}:{}", config.host, port),
                source,
            })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Serve control connections until a shutdown is requested
    pub async fn run(self) -> Result<(), ServerError> {
        let ControlServer {
            listener,
            local_addr,
            registry,
            shutdown_tx,
            mut shutdown_rx,
        } = self;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested, draining control server");
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted control connection from {}", peer_addr);

                            let registry = registry.clone();
                            let shutdown = ShutdownHandle { tx: shutdown_tx.clone() };
                            tokio::spawn(async move {
                                handle_connection(stream, peer_addr, registry, shutdown).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept control connection: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        drop(listener);
        registry.stop_all().await;

        info!("Control server on {} stopped", local_addr);
        Ok(())
    }
}

/// Serve one control connection
///
/// The stream is dropped, and so closed, on every path out of this function.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    shutdown: ShutdownHandle,
) {
    let request = match ControlCodec::read_message::<_, ControlRequest>(&mut stream).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("Connection from {} closed without a request", peer_addr);
            return;
        }
        Err(e) if e.is_eof() => {
            debug!("Connection from {} closed mid-request", peer_addr);
            return;
        }
        Err(e) => {
            warn!("Invalid message from {}: {}", peer_addr, e);
            send_response(&mut stream, peer_addr, &ControlResponse::bad_request(INVALID_MESSAGE))
                .await;
            return;
        }
    };

    debug!("Request '{}' from {}", request.kind(), peer_addr);
    let stopping = matches!(request, ControlRequest::StopServer);

    let response = handle_request(&registry, request).await;
    debug!("Responding '{}' to {}", response.status(), peer_addr);
    send_response(&mut stream, peer_addr, &response).await;

    if stopping {
        shutdown.shutdown();
    }
}

/// Carry out one control request against the registry
pub async fn handle_request(registry: &TunnelRegistry, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::EnsureTunnel {
            public_address,
            username,
            private_key,
            remote_bind,
            local_bind,
        } => {
            let params = TunnelParams {
                public_address,
                username,
                private_key,
                remote_bind,
                local_bind,
            };
            match registry.ensure(&params).await {
                Ok(tunnel) => ControlResponse::Processed(Reply::LocalBind(tunnel.local_bind().clone())),
                Err(e) => {
                    warn!("Cannot ensure tunnel to {}: {}", params.remote_bind, e);
                    ControlResponse::bad_request(e.to_string())
                }
            }
        }
        ControlRequest::GetStatus => ControlResponse::Processed(Reply::Status(registry.status().await)),
        ControlRequest::StopServer => ControlResponse::Processed(Reply::Stopped(STOPPED.to_string())),
    }
}

async fn send_response(stream: &mut TcpStream, peer_addr: SocketAddr, response: &ControlResponse) {
    if let Err(e) = ControlCodec::write_message(stream, response).await {
        match e {
            CodecError::IoError(_) => debug!("Client {} went away before the reply: {}", peer_addr, e),
            _ => error!("Failed to send reply to {}: {}", peer_addr, e),
        }
    }
}
