//! Address resolution and key path normalization

use crate::tunnel::TunnelError;
use bastion_proto::HostPort;
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Parse `input` and check that its host name resolves
pub async fn parse_resolved(input: &str, default_port: u16) -> Result<HostPort, TunnelError> {
    let addr = HostPort::parse(input, default_port)?;
    resolve(&addr).await?;
    Ok(addr)
}

/// Check that the host name of `addr` resolves to at least one address
pub async fn resolve(addr: &HostPort) -> Result<(), TunnelError> {
    let not_found = || {
        TunnelError::InvalidAddress(format!("hostname \"{}\" does not exist", addr.host))
    };

    let mut resolved = tokio::net::lookup_host(addr.as_tuple())
        .await
        .map_err(|_| not_found())?;

    match resolved.next() {
        Some(first) => {
            trace!("Resolved {} to {}", addr, first);
            Ok(())
        }
        None => Err(not_found()),
    }
}

/// Expand `~`, make absolute and lexically normalize a key file path
pub fn normalize_key_path(raw: &str) -> PathBuf {
    let expanded = expand_home(raw);

    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(expanded),
            Err(_) => expanded,
        }
    };

    normalize_lexically(&absolute)
}

fn expand_home(raw: &str) -> PathBuf {
    let rest = if raw == "~" {
        Some("")
    } else {
        raw.strip_prefix("~/")
    };

    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(raw),
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `/..` stays `/`
                let at_root = matches!(
                    normalized.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_root {
                    normalized.pop();
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
