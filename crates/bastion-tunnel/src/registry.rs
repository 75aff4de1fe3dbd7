//! Registry of the tunnels owned by a running daemon
//!
//! `ensure` hands back an existing tunnel when an active, equivalent one is
//! already registered, so each logical tunnel has at most one transport.
//! Setup is serialized per [`TunnelKey`]: a second request for the same key
//! waits for the first one to finish and then reuses its tunnel, while
//! requests for unrelated keys set up concurrently.

use crate::transport::TunnelTransport;
use crate::tunnel::{Tunnel, TunnelError, TunnelKey, TunnelParams};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Default)]
struct RegistryState {
    tunnels: Vec<Arc<Tunnel>>,
    /// Set once the daemon starts draining; nothing is appended afterwards
    closed: bool,
}

/// Tunnel registry owned by the control server
pub struct TunnelRegistry {
    transport: Arc<dyn TunnelTransport>,
    state: Mutex<RegistryState>,
    setup_gates: DashMap<TunnelKey, Arc<Mutex<()>>>,
}

impl TunnelRegistry {
    pub fn new(transport: Arc<dyn TunnelTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(RegistryState::default()),
            setup_gates: DashMap::new(),
        }
    }

    /// Return an active tunnel matching `params`, starting one if needed
    pub async fn ensure(&self, params: &TunnelParams) -> Result<Arc<Tunnel>, TunnelError> {
        let candidate = Tunnel::describe(params).await?;
        let key = candidate.key();

        if let Some(existing) = self.find_active(&key).await? {
            debug!("Reusing tunnel {}", existing);
            return Ok(existing);
        }

        let gate = self.setup_gates.entry(key.clone()).or_default().clone();
        let result = {
            let _setup = gate.lock().await;
            self.start_and_register(candidate, &key).await
        };

        // The last request through the gate removes it
        drop(gate);
        self.setup_gates
            .remove_if(&key, |_, gate| Arc::strong_count(gate) == 1);

        result
    }

    async fn start_and_register(
        &self,
        mut candidate: Tunnel,
        key: &TunnelKey,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        // Another request may have finished setting this key up while we waited
        if let Some(existing) = self.find_active(key).await? {
            debug!("Reusing tunnel {}", existing);
            return Ok(existing);
        }

        candidate.start(self.transport.as_ref()).await?;
        let tunnel = Arc::new(candidate);

        let mut state = self.state.lock().await;
        if state.closed {
            drop(state);
            tunnel.stop().await;
            return Err(TunnelError::ShuttingDown);
        }
        state.tunnels.push(tunnel.clone());
        debug!("Registered tunnel {} ({} total)", tunnel, state.tunnels.len());

        Ok(tunnel)
    }

    /// Summaries of the active tunnels, in registration order
    pub async fn status(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .tunnels
            .iter()
            .filter(|t| t.is_active())
            .map(|t| t.to_string())
            .collect()
    }

    /// Stop every tunnel and refuse new ones
    pub async fn stop_all(&self) {
        let tunnels = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.tunnels)
        };

        for tunnel in &tunnels {
            tunnel.stop().await;
        }
        self.setup_gates.clear();

        info!("Stopped {} tunnel(s)", tunnels.len());
    }

    /// Number of registered tunnels, active or not
    pub async fn len(&self) -> usize {
        self.state.lock().await.tunnels.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Find an active tunnel for `key`, dropping dead entries on the way
    async fn find_active(&self, key: &TunnelKey) -> Result<Option<Arc<Tunnel>>, TunnelError> {
        let (found, dead) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(TunnelError::ShuttingDown);
            }

            let (alive, dead): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.tunnels)
                    .into_iter()
                    .partition(|t| t.is_active());
            state.tunnels = alive;

            let found = state.tunnels.iter().find(|t| &t.key() == key).cloned();
            (found, dead)
        };

        for tunnel in dead {
            debug!("Dropping inactive tunnel {}", tunnel);
            tunnel.stop().await;
        }

        Ok(found)
    }
}
