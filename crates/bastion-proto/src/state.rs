//! Daemon discovery record
//!
//! A single line `family host port` written next to the caller's working
//! files. It only says where a daemon *was* listening; a failed connection to
//! the recorded endpoint means the record is stale.

use std::fmt;
use std::fs;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Discovery record errors
#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed state record: {0}")]
    Malformed(String),
}

/// Address family of the control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Inet => "AF_INET",
            AddressFamily::Inet6 => "AF_INET6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressFamily {
    type Err = StateFileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AF_INET" => Ok(AddressFamily::Inet),
            "AF_INET6" => Ok(AddressFamily::Inet6),
            other => Err(StateFileError::Malformed(format!(
                "unknown address family '{}'",
                other
            ))),
        }
    }
}

/// Where the running daemon's control endpoint lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub family: AddressFamily,
    pub host: IpAddr,
    pub port: u16,
}

impl StateRecord {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            family: AddressFamily::of(&addr.ip()),
            host: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Load the record from disk
    pub fn read(path: &Path) -> Result<Self, StateFileError> {
        let content = fs::read_to_string(path).map_err(|source| StateFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let line = content.lines().next().unwrap_or("");
        line.parse()
    }

    /// Write the record to disk, replacing any previous one
    ///
    /// The record is written to a sibling temp file and renamed into place,
    /// so readers see either the old record or the new one, never a partial
    /// file.
    pub fn write(&self, path: &Path) -> Result<(), StateFileError> {
        let io_error = |source: std::io::Error| StateFileError::Io {
            path: path.display().to_string(),
            source,
        };

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|source| StateFileError::Io {
            path: parent.display().to_string(),
            source,
        })?;

        let mut staged = NamedTempFile::new_in(parent).map_err(io_error)?;
        staged
            .write_all(self.to_string().as_bytes())
            .map_err(io_error)?;
        staged.persist(path).map_err(|e| io_error(e.error))?;

        debug!("Wrote state record {} to {:?}", self, path);
        Ok(())
    }

    /// Remove the record; a missing file is not an error
    pub fn remove(path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed state record {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Could not remove state record {:?}: {}", path, e),
        }
    }
}

impl fmt::Display for StateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.family, self.host, self.port)
    }
}

impl FromStr for StateRecord {
    type Err = StateFileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [family, host, port] = fields.as_slice() else {
            return Err(StateFileError::Malformed(format!(
                "expected 'family host port', got '{}'",
                s.trim()
            )));
        };

        let family: AddressFamily = family.parse()?;
        let host: IpAddr = host
            .parse()
            .map_err(|_| StateFileError::Malformed(format!("bad host '{}'", host)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| StateFileError::Malformed(format!("bad port '{}'", port)))?;

        Ok(Self { family, host, port })
    }
}
