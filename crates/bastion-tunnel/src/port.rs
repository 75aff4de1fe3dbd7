//! Best-effort local port allocation
//!
//! Ports are probed with a short connect attempt instead of a bind, so the
//! answer is only a hint: nothing is reserved, and the transport's own bind
//! is the authoritative check.

use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// How long a single probe connect may take before the port counts as free
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Port allocation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("No free port on {host} at or above {start}")]
    Exhausted { host: String, start: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Free,
    Busy,
}

/// Find the first port at or above `start_port` that nothing answers on
pub async fn find_free_port(host: &str, start_port: u16) -> Result<u16, PortError> {
    find_free_port_with_timeout(host, start_port, PROBE_TIMEOUT).await
}

/// Scan upwards from `start_port`, giving each probe `probe_timeout`
async fn find_free_port_with_timeout(
    host: &str,
    start_port: u16,
    probe_timeout: Duration,
) -> Result<u16, PortError> {
    for port in start_port..=u16::MAX {
        if probe(host, port, probe_timeout).await == Probe::Free {
            debug!("Port {}:{} looks free", host, port);
            return Ok(port);
        }
    }

    Err(PortError::Exhausted {
        host: host.to_string(),
        start: start_port,
    })
}

async fn probe(host: &str, port: u16, probe_timeout: Duration) -> Probe {
    match tokio::time::timeout(probe_timeout, TcpStream::connect((host, port))).await {
        // Nobody answered in time
        Err(_) => Probe::Free,
        // Nothing listening
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Probe::Free,
        Ok(Ok(stream)) => {
            drop(stream);
            trace!("Port {}:{} is taken", host, port);
            Probe::Busy
        }
        Ok(Err(e)) => {
            trace!("Probe of {}:{} inconclusive: {}", host, port, e);
            Probe::Busy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_skips_occupied_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = listener.local_addr().unwrap().port();

        let port = find_free_port("127.0.0.1", taken).await.unwrap();
        assert!(port > taken);
    }

    #[tokio::test]
    async fn test_returns_start_when_free() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let released = listener.local_addr().unwrap().port();
        drop(listener);

        let port = find_free_port("127.0.0.1", released).await.unwrap();
        assert_eq!(port, released);
    }

    #[tokio::test]
    async fn test_never_below_start() {
        for start in [10022u16, 20000, 40000] {
            let port = find_free_port("127.0.0.1", start).await.unwrap();
            assert!(port >= start);
        }
    }

    #[tokio::test]
    async fn test_skips_consecutive_occupied_ports() {
        // Hold a run of listeners and check the allocator walks past all of them
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = first.local_addr().unwrap().port();
        let mut held = vec![first];
        for offset in 1..3u16 {
            match base.checked_add(offset) {
                Some(port) => match TcpListener::bind(("127.0.0.1", port)).await {
                    Ok(listener) => held.push(listener),
                    Err(_) => break,
                },
                None => break,
            }
        }

        let port = find_free_port("127.0.0.1", base).await.unwrap();
        assert!(port >= base + held.len() as u16);
    }
}
