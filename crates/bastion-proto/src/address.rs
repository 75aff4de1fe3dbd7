//! Host/port pairs as written on the command line and carried in replies

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Address parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address: empty host in '{0}'")]
    EmptyHost(String),

    #[error("Invalid address: bad port '{port}' in '{input}'")]
    InvalidPort { input: String, port: String },

    #[error("Invalid address: unterminated IPv6 literal in '{0}'")]
    UnterminatedIpv6(String),
}

/// A host name (or IP literal) plus port
///
/// Host names are kept as written (lower-cased) so that two descriptions of
/// the same endpoint compare equal without a DNS round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]:port` or `scheme://host:port`
    ///
    /// A missing (or empty) port falls back to `default_port`.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, AddressError> {
        let trimmed = input.trim();

        // Scheme and path are accepted but carry no meaning here
        let without_scheme = match trimmed.split_once("://") {
            Some((_, rest)) => rest,
            None => trimmed.trim_start_matches("//"),
        };
        let authority = without_scheme
            .split('/')
            .next()
            .unwrap_or(without_scheme);
        let authority = match authority.rsplit_once('@') {
            Some((_, host_part)) => host_part,
            None => authority,
        };

        let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| AddressError::UnterminatedIpv6(input.to_string()))?;
            let port_str = match after {
                "" => None,
                other => match other.strip_prefix(':') {
                    Some(port) => Some(port),
                    None => {
                        return Err(AddressError::InvalidPort {
                            input: input.to_string(),
                            port: other.to_string(),
                        })
                    }
                },
            };
            (host, port_str)
        } else if authority.matches(':').count() == 1 {
            let (host, port) = authority.split_once(':').unwrap_or((authority, ""));
            (host, Some(port))
        } else {
            // No colon, or a bare IPv6 literal without brackets
            (authority, None)
        };

        if host.is_empty() {
            return Err(AddressError::EmptyHost(input.to_string()));
        }

        let port = match port_str {
            None | Some("") => default_port,
            Some(port) => port.parse().map_err(|_| AddressError::InvalidPort {
                input: input.to_string(),
                port: port.to_string(),
            })?,
        };

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// `(host, port)` tuple suitable for `ToSocketAddrs`
    pub fn as_tuple(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
