//! SSH local port forwarding through a bastion host
//!
//! Each tunnel owns one SSH session. Connections accepted on the local bind
//! are forwarded to the remote bind over their own `direct-tcpip` channel.

use crate::socks;
use crate::transport::{OpenRequest, TransportError, TransportHandle, TunnelTransport};
use async_trait::async_trait;
use bastion_proto::HostPort;
use russh::client;
use russh::Disconnect;
use russh_keys::key;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval between SSH keep-alive requests
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

/// Pause after a failed `accept()` before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// SSH transport settings
#[derive(Debug, Clone)]
pub struct SshTransportConfig {
    pub keepalive: Option<Duration>,
    /// Reach the bastion through this SOCKS5 proxy
    pub socks_proxy: Option<HostPort>,
}

impl Default for SshTransportConfig {
    fn default() -> Self {
        Self {
            keepalive: Some(DEFAULT_KEEPALIVE),
            socks_proxy: None,
        }
    }
}

/// Opens tunnels as SSH sessions with local port forwarding
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    config: SshTransportConfig,
}

impl SshTransport {
    pub fn new(config: SshTransportConfig) -> Self {
        Self { config }
    }

    fn client_config(&self) -> Arc<client::Config> {
        let config = client::Config {
            keepalive_interval: self.config.keepalive,
            ..Default::default()
        };
        Arc::new(config)
    }

    async fn connect(
        &self,
        request: &OpenRequest,
    ) -> Result<client::Handle<BastionHandler>, TransportError> {
        let address = request.public_address.to_string();
        let handler = BastionHandler {
            address: address.clone(),
        };
        let connect_failed = |e: russh::Error| TransportError::Connect {
            address: address.clone(),
            reason: e.to_string(),
        };

        match &self.config.socks_proxy {
            Some(proxy) => {
                debug!("Connecting to {} through SOCKS proxy {}", address, proxy);
                let stream = socks::connect(proxy, &request.public_address).await?;
                client::connect_stream(self.client_config(), stream, handler)
                    .await
                    .map_err(connect_failed)
            }
            None => {
                let stream = TcpStream::connect(request.public_address.as_tuple())
                    .await
                    .map_err(|e| TransportError::Connect {
                        address: address.clone(),
                        reason: e.to_string(),
                    })?;
                client::connect_stream(self.client_config(), stream, handler)
                    .await
                    .map_err(connect_failed)
            }
        }
    }
}

#[async_trait]
impl TunnelTransport for SshTransport {
    async fn open(&self, request: &OpenRequest) -> Result<Box<dyn TransportHandle>, TransportError> {
        // Bind first so a lost port race fails before any network round-trip
        let listener = TcpListener::bind(request.local_bind.as_tuple())
            .await
            .map_err(|e| TransportError::Bind {
                address: request.local_bind.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        let key_pair = russh_keys::load_secret_key(&request.private_key, None).map_err(|e| {
            TransportError::Key {
                path: request.private_key.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut session = self.connect(request).await?;

        let authenticated = session
            .authenticate_publickey(&request.username, Arc::new(key_pair))
            .await
            .map_err(|e| TransportError::Connect {
                address: request.public_address.to_string(),
                reason: e.to_string(),
            })?;
        if !authenticated {
            return Err(TransportError::AuthenticationRejected {
                username: request.username.clone(),
                address: request.public_address.to_string(),
            });
        }

        info!(
            "Authenticated to {} as {}",
            request.public_address, request.username
        );

        let session = Arc::new(session);
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let forwarder = tokio::spawn(run_forwarder(
            listener,
            session.clone(),
            request.remote_bind.clone(),
            running.clone(),
            shutdown_rx,
        ));

        Ok(Box::new(SshTunnelHandle {
            local_addr,
            session,
            running,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            forwarder: Mutex::new(Some(forwarder)),
        }))
    }
}

async fn run_forwarder(
    listener: TcpListener,
    session: Arc<client::Handle<BastionHandler>>,
    remote_bind: HostPort,
    running: Arc<AtomicBool>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received, closing forwarder for {}", remote_bind);
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((socket, peer_addr)) => {
                        if session.is_closed() {
                            warn!("SSH session to bastion closed, dropping connection from {}", peer_addr);
                            break;
                        }
                        debug!("Accepted connection from {} for {}", peer_addr, remote_bind);

                        let session = session.clone();
                        let remote_bind = remote_bind.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forward_connection(socket, peer_addr, &session, &remote_bind).await {
                                warn!("Forwarding {} => {} failed: {}", peer_addr, remote_bind, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept local connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}

async fn forward_connection(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    session: &client::Handle<BastionHandler>,
    remote_bind: &HostPort,
) -> Result<(), TransportError> {
    let channel = session
        .channel_open_direct_tcpip(
            remote_bind.host.clone(),
            remote_bind.port as u32,
            peer_addr.ip().to_string(),
            peer_addr.port() as u32,
        )
        .await
        .map_err(|e| TransportError::Channel {
            target: remote_bind.to_string(),
            reason: e.to_string(),
        })?;

    let mut remote = channel.into_stream();
    let (sent, received) = tokio::io::copy_bidirectional(&mut socket, &mut remote).await?;
    debug!(
        "Connection {} => {} closed ({} bytes out, {} bytes in)",
        peer_addr, remote_bind, sent, received
    );
    Ok(())
}

/// A live SSH tunnel
struct SshTunnelHandle {
    local_addr: SocketAddr,
    session: Arc<client::Handle<BastionHandler>>,
    running: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TransportHandle for SshTunnelHandle {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.session.is_closed()
    }

    async fn stop(&self) {
        let Some(tx) = self.shutdown_tx.lock().await.take() else {
            return;
        };
        let _ = tx.send(()).await;

        // Wait for the forwarder so the local port is released on return
        if let Some(forwarder) = self.forwarder.lock().await.take() {
            if let Err(e) = forwarder.await {
                warn!("Forwarder task for {} ended abnormally: {}", self.local_addr, e);
            }
        }
        self.running.store(false, Ordering::SeqCst);

        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
            .await
        {
            debug!("Disconnect from bastion failed: {}", e);
        }

        info!("Tunnel on {} stopped", self.local_addr);
    }
}

/// Client handler that accepts any bastion host key
pub struct BastionHandler {
    address: String,
}

#[async_trait]
impl client::Handler for BastionHandler {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        server_public_key: &key::PublicKey,
    ) -> Result<(Self, bool), Self::Error> {
        debug!(
            "Host key fingerprint for {}: {}",
            self.address,
            server_public_key.fingerprint()
        );
        Ok((self, true))
    }
}
