//! Control protocol message types

use crate::address::HostPort;
use serde::{Deserialize, Serialize};

/// Request sent by a client invocation to the daemon
///
/// Exactly one request is sent per control connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlRequest {
    /// Make sure a tunnel matching these parameters is up and return its
    /// local bind address
    EnsureTunnel {
        public_address: String,
        username: String,
        private_key: String,
        remote_bind: String,
        local_bind: String,
    },

    /// List the active tunnels
    GetStatus,

    /// Stop every tunnel and shut the daemon down
    StopServer,
}

impl ControlRequest {
    /// Wire-level kind name, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlRequest::EnsureTunnel { .. } => "ensure tunnel",
            ControlRequest::GetStatus => "get status",
            ControlRequest::StopServer => "stop server",
        }
    }
}

/// Response sent by the daemon, one per request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlResponse {
    /// The request was carried out
    Processed(Reply),

    /// The request was malformed or could not be carried out
    BadRequest { reason: String },
}

impl ControlResponse {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        ControlResponse::BadRequest {
            reason: reason.into(),
        }
    }

    /// Wire-level status name, used in logs
    pub fn status(&self) -> &'static str {
        match self {
            ControlResponse::Processed(_) => "processed",
            ControlResponse::BadRequest { .. } => "bad request",
        }
    }
}

/// Payload of a processed request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reply {
    /// Concrete local bind of the ensured tunnel
    LocalBind(HostPort),

    /// One human-readable summary per active tunnel
    Status(Vec<String>),

    /// Acknowledgement of a stop request
    Stopped(String),
}
