//! Tunnel management for the bastion daemon
//!
//! Describes SSH tunnels, finds free local ports for them, opens them through
//! a pluggable [`TunnelTransport`], and keeps the daemon's set of live
//! tunnels deduplicated in a [`TunnelRegistry`].

pub mod address;
pub mod port;
pub mod registry;
pub mod socks;
pub mod ssh;
pub mod transport;
pub mod tunnel;

pub use bastion_proto::HostPort;
pub use port::{find_free_port, PortError};
pub use registry::TunnelRegistry;
pub use ssh::{SshTransport, SshTransportConfig};
pub use transport::{OpenRequest, TransportError, TransportHandle, TunnelTransport};
pub use tunnel::{Tunnel, TunnelError, TunnelKey, TunnelParams};

/// Port assumed for the bastion and the remote bind when none is given
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Port the local bind search starts from when none is given
pub const DEFAULT_LOCAL_BIND_PORT: u16 = 10022;
