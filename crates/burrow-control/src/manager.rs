//! Tenant registry
//!
//! The manager creates one client/agent pair per tenant, hands back the port
//! the remote tunnel client must dial, and forgets tenants when they close,
//! whether they expired on their own or were removed explicitly.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use burrow_agent::{AgentConfig, TunnelAgent, DEFAULT_MAX_SOCKETS};
use burrow_client::{Client, DEFAULT_GRACE_PERIOD};

use crate::error::ControlError;
use crate::ids::generate_tenant_id;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-tenant cap on connected tunnel sockets
    pub max_sockets: usize,
    /// How long a tenant may go without any tunnel socket
    pub grace_period: Duration,
    /// Address tunnel listeners bind on
    pub tunnel_bind_addr: IpAddr,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
            grace_period: DEFAULT_GRACE_PERIOD,
            tunnel_bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Result of creating a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    /// Port the remote tunnel client must connect to
    pub port: u16,
    pub max_conn_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub tunnels: usize,
}

struct Registered {
    client: Client,
    /// Set once the tunnel listener is bound; only these count as tunnels
    listening: bool,
}

struct ManagerState {
    config: ManagerConfig,
    clients: DashMap<String, Registered>,
    tunnels: AtomicUsize,
}

#[derive(Clone)]
pub struct ClientManager {
    state: Arc<ManagerState>,
}

impl ClientManager {
    pub fn new(config: ManagerConfig) -> Self {
        info!(
            max_sockets = config.max_sockets,
            grace_ms = config.grace_period.as_millis() as u64,
            "Creating client manager"
        );
        Self {
            state: Arc::new(ManagerState {
                config,
                clients: DashMap::new(),
                tunnels: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.state.config
    }

    /// Create and start a tenant.
    ///
    /// A requested id that is already taken is silently replaced by a
    /// generated one, so callers must use the id in the returned info.
    pub async fn new_client(&self, requested_id: Option<&str>) -> Result<TunnelInfo, ControlError> {
        let (id, client, agent) = self.reserve(requested_id);

        let port = match agent.listen().await {
            Ok(port) => port,
            Err(e) => {
                warn!(tenant = %id, error = %e, "Failed to start tunnel listener");
                self.discard(&id, &client);
                client.close();
                return Err(e.into());
            }
        };

        // The tenant may have expired or been removed while binding.
        let counted = match self.state.clients.get_mut(&id) {
            Some(mut entry) if entry.client.same(&client) => {
                entry.listening = true;
                self.state.tunnels.fetch_add(1, Ordering::SeqCst);
                true
            }
            _ => false,
        };
        if !counted {
            client.close();
            return Err(ControlError::Agent(burrow_agent::AgentError::Closed));
        }

        let manager = self.clone();
        let watched_id = id.clone();
        tokio::spawn(async move {
            client.closed().await;
            manager.expire(&watched_id, &client);
        });

        info!(tenant = %id, port, "Tenant created");
        Ok(TunnelInfo {
            id,
            port,
            max_conn_count: agent.max_sockets(),
        })
    }

    /// Claim an id atomically and register a fresh client under it
    fn reserve(&self, requested_id: Option<&str>) -> (String, Client, TunnelAgent) {
        let mut candidate = requested_id.map(str::to_owned);
        loop {
            let id = candidate.take().unwrap_or_else(generate_tenant_id);
            match self.state.clients.entry(id.clone()) {
                Entry::Occupied(_) => {
                    debug!(tenant = %id, "Tenant id taken, generating another");
                }
                Entry::Vacant(slot) => {
                    let config = AgentConfig::new(id.clone())
                        .with_max_sockets(self.state.config.max_sockets)
                        .with_bind_addr(self.state.config.tunnel_bind_addr);
                    let (agent, events) = TunnelAgent::new(config);
                    let client = Client::new(
                        id.clone(),
                        agent.clone(),
                        events,
                        self.state.config.grace_period,
                    );
                    slot.insert(Registered {
                        client: client.clone(),
                        listening: false,
                    });
                    return (id, client, agent);
                }
            }
        }
    }

    /// Remove a tenant and close it. Returns false if it was not registered.
    pub fn remove_client(&self, id: &str) -> bool {
        match self.state.clients.remove(id) {
            Some((id, registered)) => {
                self.retire(&id, registered);
                true
            }
            None => false,
        }
    }

    pub fn has_client(&self, id: &str) -> bool {
        self.state.clients.contains_key(id)
    }

    pub fn get_client(&self, id: &str) -> Option<Client> {
        self.state.clients.get(id).map(|entry| entry.client.clone())
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            tunnels: self.state.tunnels.load(Ordering::SeqCst),
        }
    }

    /// Drop a registration only if it still belongs to `client`
    fn discard(&self, id: &str, client: &Client) -> Option<Registered> {
        self.state
            .clients
            .remove_if(id, |_, registered| registered.client.same(client))
            .map(|(_, registered)| registered)
    }

    fn expire(&self, id: &str, client: &Client) {
        if let Some(registered) = self.discard(id, client) {
            info!(tenant = %id, "Tenant expired");
            self.retire(id, registered);
        }
    }

    fn retire(&self, id: &str, registered: Registered) {
        if registered.listening {
            self.state.tunnels.fetch_sub(1, Ordering::SeqCst);
        }
        registered.client.close();
        debug!(tenant = %id, tunnels = self.stats().tunnels, "Tenant removed");
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_info_serializes_wire_names() {
        let info = TunnelInfo {
            id: "brave-otter-42".to_string(),
            port: 40123,
            max_conn_count: 10,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], "brave-otter-42");
        assert_eq!(json["port"], 40123);
        assert_eq!(json["max_conn_count"], 10);
    }

    #[tokio::test]
    async fn test_default_manager_is_empty() {
        let manager = ClientManager::default();
        assert_eq!(manager.stats(), ManagerStats { tunnels: 0 });
        assert!(!manager.has_client("anything"));
        assert!(manager.get_client("anything").is_none());
        assert!(!manager.remove_client("anything"));
        assert!(manager.client_ids().is_empty());
    }
}
