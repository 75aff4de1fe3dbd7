//! A single SSH tunnel: its endpoints, its identity, and its live handle

use crate::address::{normalize_key_path, parse_resolved};
use crate::port::{find_free_port, PortError};
use crate::transport::{OpenRequest, TransportError, TransportHandle, TunnelTransport};
use crate::{DEFAULT_LOCAL_BIND_PORT, DEFAULT_SSH_PORT};
use bastion_proto::{AddressError, HostPort};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How many times a lost race for the allocated local port is retried
const BIND_RETRIES: usize = 8;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("No free local port on {host} at or above {start}")]
    PortsExhausted { host: String, start: u16 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Server is shutting down")]
    ShuttingDown,
}

impl From<AddressError> for TunnelError {
    fn from(err: AddressError) -> Self {
        TunnelError::InvalidAddress(err.to_string())
    }
}

impl From<PortError> for TunnelError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Exhausted { host, start } => TunnelError::PortsExhausted { host, start },
        }
    }
}

/// Raw tunnel parameters as they arrive from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    pub public_address: String,
    pub username: String,
    pub private_key: String,
    pub remote_bind: String,
    pub local_bind: String,
}

/// Identity of a logical tunnel
///
/// The local bind port is left out: it is allocated, not requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub public_address: HostPort,
    pub username: String,
    pub private_key: PathBuf,
    pub remote_bind: HostPort,
    pub local_host: String,
}

pub struct Tunnel {
    public_address: HostPort,
    username: String,
    private_key: PathBuf,
    remote_bind: HostPort,
    local_bind: HostPort,
    handle: Option<Box<dyn TransportHandle>>,
}

impl Tunnel {
    /// Validate and normalize `params` into a tunnel that is not started yet
    pub async fn describe(params: &TunnelParams) -> Result<Self, TunnelError> {
        let public_address = parse_resolved(&params.public_address, DEFAULT_SSH_PORT).await?;
        let remote_bind = parse_resolved(&params.remote_bind, DEFAULT_SSH_PORT).await?;
        let local_bind = parse_resolved(&params.local_bind, DEFAULT_LOCAL_BIND_PORT).await?;

        Ok(Self {
            public_address,
            username: params.username.clone(),
            private_key: normalize_key_path(&params.private_key),
            remote_bind,
            local_bind,
            handle: None,
        })
    }

    /// Allocate a local port and open the tunnel through `transport`
    ///
    /// Returns once the tunnel accepts local connections.
    pub async fn start(&mut self, transport: &dyn TunnelTransport) -> Result<(), TunnelError> {
        let mut search_from = self.local_bind.port;
        let mut attempt = 0;

        loop {
            let port = find_free_port(&self.local_bind.host, search_from).await?;
            self.local_bind.port = port;

            match transport.open(&self.open_request()).await {
                Ok(handle) => {
                    // Port 0 lets the OS pick; report what was actually bound
                    self.local_bind.port = handle.local_addr().port();
                    info!("✅ Tunnel up: {}", self);
                    self.handle = Some(handle);
                    return Ok(());
                }
                Err(TransportError::Bind { address, reason })
                    if attempt < BIND_RETRIES && port < u16::MAX =>
                {
                    // Someone else took the port between the probe and the bind
                    debug!("Lost port {} ({}), searching again", address, reason);
                    attempt += 1;
                    search_from = port + 1;
                }
                Err(e) => {
                    warn!("Failed to start tunnel {}: {}", self, e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Tear the tunnel down; safe to call any number of times
    pub async fn stop(&self) {
        if let Some(handle) = &self.handle {
            handle.stop().await;
        }
    }

    /// True while the underlying transport is up and forwarding
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_active())
    }

    pub fn key(&self) -> TunnelKey {
        TunnelKey {
            public_address: self.public_address.clone(),
            username: self.username.clone(),
            private_key: self.private_key.clone(),
            remote_bind: self.remote_bind.clone(),
            local_host: self.local_bind.host.clone(),
        }
    }

    /// Address clients should connect to
    pub fn local_bind(&self) -> &HostPort {
        &self.local_bind
    }

    pub fn public_address(&self) -> &HostPort {
        &self.public_address
    }

    pub fn remote_bind(&self) -> &HostPort {
        &self.remote_bind
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn private_key(&self) -> &PathBuf {
        &self.private_key
    }

    fn open_request(&self) -> OpenRequest {
        OpenRequest {
            public_address: self.public_address.clone(),
            username: self.username.clone(),
            private_key: self.private_key.clone(),
            remote_bind: self.remote_bind.clone(),
            local_bind: self.local_bind.clone(),
        }
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} => [{}@{}] => {}",
            self.local_bind, self.username, self.public_address, self.remote_bind
        )
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("public_address", &self.public_address)
            .field("username", &self.username)
            .field("private_key", &self.private_key)
            .field("remote_bind", &self.remote_bind)
            .field("local_bind", &self.local_bind)
            .field("active", &self.is_active())
            .finish()
    }
}
