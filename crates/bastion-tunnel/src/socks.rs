//! Minimal SOCKS5 client used to reach a bastion from behind a proxy
//!
//! Only the no-authentication method and the CONNECT command are supported.

use crate::transport::TransportError;
use bastion_proto::HostPort;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Default port of a SOCKS proxy given without one
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Open a TCP stream to `target` through the SOCKS5 proxy at `proxy`
pub async fn connect(proxy: &HostPort, target: &HostPort) -> Result<TcpStream, TransportError> {
    let fail = |reason: String| TransportError::Proxy {
        proxy: proxy.to_string(),
        reason,
    };

    let mut stream = TcpStream::connect(proxy.as_tuple())
        .await
        .map_err(|e| fail(e.to_string()))?;

    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await
        .map_err(|e| fail(e.to_string()))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| fail(e.to_string()))?;
    if choice != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(fail(format!(
            "proxy refused unauthenticated access (reply {:02x} {:02x})",
            choice[0], choice[1]
        )));
    }

    let request = connect_request(target).map_err(fail)?;
    stream
        .write_all(&request)
        .await
        .map_err(|e| fail(e.to_string()))?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| fail(e.to_string()))?;
    if head[1] != 0x00 {
        return Err(fail(format!("CONNECT to {} refused with code {}", target, head[1])));
    }

    // Skip the bound address the proxy reports back
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| fail(e.to_string()))?;
            len[0] as usize
        }
        other => return Err(fail(format!("unknown address type {}", other))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| fail(e.to_string()))?;

    debug!("SOCKS proxy {} connected to {}", proxy, target);
    Ok(stream)
}

fn connect_request(target: &HostPort) -> Result<Vec<u8>, String> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];

    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host = target.host.as_bytes();
            if host.len() > u8::MAX as usize {
                return Err(format!("host name too long: {}", target.host));
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host);
        }
    }

    request.extend_from_slice(&target.port.to_be_bytes());
    Ok(request)
}
