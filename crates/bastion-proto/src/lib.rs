//! Control protocol definitions
//!
//! This crate defines the messages exchanged between `bastion` client
//! invocations and the tunnel daemon, the frame codec used to carry them over
//! the local control connection, and the discovery record clients use to
//! find a running daemon.

pub mod address;
pub mod codec;
pub mod messages;
pub mod state;

pub use address::{AddressError, HostPort};
pub use codec::{CodecError, ControlCodec};
pub use messages::{ControlRequest, ControlResponse, Reply};
pub use state::{AddressFamily, StateFileError, StateRecord};

/// Loopback host the control endpoint binds to
pub const CONTROL_HOST: &str = "127.0.0.1";

/// First port probed when allocating the control endpoint
pub const DEFAULT_CONTROL_BASE_PORT: u16 = 6000;
