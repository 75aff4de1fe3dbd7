//! Shared fixtures for control plane tests

#![allow(dead_code)]

use async_trait::async_trait;
use bastion_control::{ControlServer, DaemonSpawner, ServerConfig, ShutdownHandle};
use bastion_tunnel::{OpenRequest, TransportError, TransportHandle, TunnelParams, TunnelTransport};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Forwards local connections straight to the remote bind over plain TCP
#[derive(Default)]
pub struct ForwardingTransport {
    pub opens: AtomicUsize,
}

struct ForwardingHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    shutdown_tx: std::sync::Mutex<Option<mpsc::Sender<()>>>,
    forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TransportHandle for ForwardingHandle {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        let tx = self.shutdown_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        let forwarder = self.forwarder.lock().unwrap().take();
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl TunnelTransport for ForwardingTransport {
    async fn open(&self, request: &OpenRequest) -> Result<Box<dyn TransportHandle>, TransportError> {
        let listener = TcpListener::bind(request.local_bind.as_tuple())
            .await
            .map_err(|e| TransportError::Bind {
                address: request.local_bind.to_string(),
                reason: e.to_string(),
            })?;
        self.opens.fetch_add(1, Ordering::SeqCst);

        let addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let remote = request.remote_bind.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => {
                        let Ok((mut local, _)) = accepted else { continue };
                        let remote = remote.clone();
                        tokio::spawn(async move {
                            if let Ok(mut upstream) = TcpStream::connect(remote.as_tuple()).await {
                                let _ = tokio::io::copy_bidirectional(&mut local, &mut upstream).await;
                            }
                        });
                    }
                }
            }
        });

        Ok(Box::new(ForwardingHandle {
            addr,
            running,
            shutdown_tx: std::sync::Mutex::new(Some(shutdown_tx)),
            forwarder: std::sync::Mutex::new(Some(forwarder)),
        }))
    }
}

pub struct RunningServer {
    pub addr: SocketAddr,
    pub shutdown: ShutdownHandle,
    pub task: JoinHandle<()>,
}

/// A loopback port that was free a moment ago
pub async fn released_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub async fn server_config(state_file: &Path) -> ServerConfig {
    ServerConfig::new(state_file).with_base_port(released_port().await)
}

/// Bind a control server and run it in the background
pub async fn start_server(
    config: &ServerConfig,
    transport: Arc<dyn TunnelTransport>,
) -> RunningServer {
    let server = ControlServer::bind(config, transport).await.unwrap();
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(async move {
        server.run().await.unwrap();
    });

    RunningServer {
        addr,
        shutdown,
        task,
    }
}

/// Starts a control server inside the test process instead of a new process
pub struct InProcessSpawner {
    pub spawns: AtomicUsize,
    pub base_port: u16,
    pub transport: Arc<ForwardingTransport>,
}

impl InProcessSpawner {
    pub async fn new(transport: Arc<ForwardingTransport>) -> Self {
        Self {
            spawns: AtomicUsize::new(0),
            base_port: released_port().await,
            transport,
        }
    }
}

impl DaemonSpawner for InProcessSpawner {
    fn spawn(&self, state_file: &Path) -> io::Result<()> {
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let config = ServerConfig::new(state_file).with_base_port(self.base_port);
        let transport: Arc<dyn TunnelTransport> = self.transport.clone();
        tokio::spawn(async move {
            // Come up a little late, like a freshly started process would
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            if let Ok(server) = ControlServer::bind(&config, transport).await {
                let _ = server.run().await;
            }
        });
        Ok(())
    }
}

/// Records spawn requests without starting anything
#[derive(Default)]
pub struct NoopSpawner {
    pub spawns: AtomicUsize,
}

impl DaemonSpawner for NoopSpawner {
    fn spawn(&self, _state_file: &Path) -> io::Result<()> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

pub async fn tunnel_params(remote: SocketAddr, username: &str) -> TunnelParams {
    TunnelParams {
        public_address: "localhost".to_string(),
        username: username.to_string(),
        private_key: "~/.ssh/id_ed25519".to_string(),
        remote_bind: remote.to_string(),
        local_bind: format!("127.0.0.1:{}", released_port().await),
    }
}
