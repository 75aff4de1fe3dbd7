//! Control plane of the bastion tunnel daemon
//!
//! The [`ControlServer`] is the resident side: it owns the tunnel registry and
//! answers one control request per local connection. The [`ClientConnector`]
//! runs inside short-lived client invocations; it finds the daemon through the
//! discovery record, starts one when none is running, and retries until the
//! daemon answers.

pub mod connector;
pub mod server;
pub mod spawner;

pub use connector::{ClientConnector, ConnectError, ConnectorConfig};
pub use server::{ControlServer, ServerConfig, ServerError, ShutdownHandle};
pub use spawner::{DaemonSpawner, ProcessSpawner};
