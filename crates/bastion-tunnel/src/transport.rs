//! Seam between tunnel bookkeeping and the secure channel that carries bytes

use async_trait::async_trait;
use bastion_proto::HostPort;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to load private key {path}: {reason}")]
    Key { path: String, reason: String },

    #[error("Failed to connect to bastion {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Authentication as '{username}' rejected by {address}")]
    AuthenticationRejected { username: String, address: String },

    #[error("SOCKS proxy {proxy} failed: {reason}")]
    Proxy { proxy: String, reason: String },

    #[error("Failed to bind local address {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Failed to open channel to {target}: {reason}")]
    Channel { target: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Everything a transport needs to bring one tunnel up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub public_address: HostPort,
    pub username: String,
    pub private_key: PathBuf,
    pub remote_bind: HostPort,
    pub local_bind: HostPort,
}

/// Opens tunnels
///
/// `open` returns once the tunnel accepts connections on `local_bind`, or
/// fails if the bastion cannot be reached, rejects the key, or the local
/// bind is taken.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    async fn open(&self, request: &OpenRequest) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// A live tunnel owned by the transport
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Address the tunnel accepts local connections on
    fn local_addr(&self) -> SocketAddr;

    /// True only while the tunnel is established and forwarding
    fn is_active(&self) -> bool;

    /// Tear the tunnel down; calling it again is a no-op
    async fn stop(&self);
}
