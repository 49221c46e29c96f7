//! Discovery/registry (spec §4.7/§6, C7).
//!
//! Generalizes the teacher's consul-backed `AuthorityType::Consul`
//! (`readyset/src/lib.rs` resolves `--authority consul` into a
//! `consulrs`-backed authority) from "where is the current controller" to
//! "which addresses currently serve `interfaceName#serverId`": ephemeral
//! registration under a root path, watch-driven cache refresh, and
//! reconnect-triggers-re-register recovery.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use citadel_config::DiscoveryConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Up,
    Draining,
    Down,
    Unhealthy,
}

/// One registered RPC service instance (spec §3). `service_key` is always
/// `interfaceName#serverId`; uniqueness of one instance per `service_key`
/// per process is enforced by the registering side, not by this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_key: String,
    pub address: String,
    pub server_id: u64,
    pub weight: u32,
    pub status: ServiceStatus,
    pub metadata: HashMap<String, String>,
    pub register_time: i64,
}

impl ServiceInstance {
    pub fn interface_name(&self) -> &str {
        self.service_key.split('#').next().unwrap_or(&self.service_key)
    }
}

/// `interfaceName#serverId` per spec §3/§6.
pub fn service_key(interface: &str, server_id: u64) -> String {
    format!("{interface}#{server_id}")
}

/// Replaces `.`, `#`, `:` with `_` so a serviceKey can be used as a single
/// path segment (spec §6).
pub fn path_safe(service_key: &str) -> String {
    service_key.chars().map(|c| if c == '.' || c == '#' || c == ':' { '_' } else { c }).collect()
}

/// Recovers the `serverId` suffix from a path-safe node name by splitting
/// on the *last* `_`, per spec §6's "restoration splits on last `_`".
pub fn server_id_from_node_name(node_name: &str) -> Option<u64> {
    let (_, suffix) = node_name.rsplit_once('_')?;
    suffix.parse().ok()
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("consul transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no instance registered for {0}")]
    NotFound(String),
}

/// What C5 (RPC client) and C6 (RPC server) need from discovery: register
/// on startup, drain-then-unregister on shutdown, resolve candidates for a
/// call, and be told about address-list changes without polling.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn register(&self, instance: ServiceInstance) -> Result<(), DiscoveryError>;

    /// Flips the instance to DRAINING, waits the configured drain time,
    /// then deletes the node (spec §4.7's graceful unregister).
    async fn unregister(&self, service_key: &str) -> Result<(), DiscoveryError>;

    /// `server_id == 0` is a wildcard: returns every UP instance of
    /// `interface`. Otherwise reads the exact node.
    async fn discover(&self, interface: &str, server_id: u64) -> Result<Vec<ServiceInstance>, DiscoveryError>;

    /// A live-updated view of `discover(interface, 0)`, refreshed whenever
    /// the watch fires. Subscribers get the full address list on each
    /// change, matching spec §4.7.
    fn subscribe(&self, interface: &str) -> watch::Receiver<Vec<ServiceInstance>>;

    /// Fires with the departed `service_key` exactly once per deletion.
    fn offline_events(&self) -> broadcast::Receiver<String>;
}

struct WatchedInterface {
    tx: watch::Sender<Vec<ServiceInstance>>,
}

/// `consulrs`-backed implementation. Keeps a local cache per interface
/// refreshed by a background long-poll task (consul blocking queries via
/// `QueryOptions::index`), the same "watch drives re-read, re-read notifies
/// subscribers" shape spec §4.7 describes for the source's ZK-style watches.
///
/// The state every async method and the background refresh task needs to
/// share lives behind one `Arc<Inner>`, so `ConsulDiscovery` itself is a
/// cheap, cloneable handle and `subscribe` can spawn its refresh loop from
/// a plain `&self` without requiring callers to hold `Arc<ConsulDiscovery>`.
#[derive(Clone)]
pub struct ConsulDiscovery {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    config: DiscoveryConfig,
    client: consulrs::client::ConsulClient,
    watches: DashMap<String, WatchedInterface>,
    offline_tx: broadcast::Sender<String>,
    registered: DashMap<String, ServiceInstance>,
}

impl ConsulDiscovery {
    pub fn new(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let settings = consulrs::client::ConsulClientSettingsBuilder::default()
            .address(format!("http://{}", config.consul_addr))
            .build()
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        let client = consulrs::client::ConsulClient::new(settings)
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        Ok(Self {
            inner: std::sync::Arc::new(Inner {
                config,
                client,
                watches: DashMap::new(),
                offline_tx: broadcast::channel(256).0,
                registered: DashMap::new(),
            }),
        })
    }

    fn node_path(&self, service_key: &str) -> String {
        format!("{}/{}", self.inner.config.root.trim_end_matches('/'), path_safe(service_key))
    }

    /// Spawns the background refresh loop for one interface prefix the
    /// first time anyone asks to watch it.
    fn ensure_watch(&self, interface: &str) -> watch::Receiver<Vec<ServiceInstance>> {
        if let Some(existing) = self.inner.watches.get(interface) {
            return existing.tx.subscribe();
        }
        let (tx, rx) = watch::channel(Vec::new());
        self.inner.watches.insert(interface.to_string(), WatchedInterface { tx: tx.clone() });

        let this = self.clone();
        let interface = interface.to_string();
        tokio::spawn(async move {
            this.refresh_loop(interface, tx).await;
        });
        rx
    }

    #[instrument(skip(self, tx))]
    async fn refresh_loop(self, interface: String, tx: watch::Sender<Vec<ServiceInstance>>) {
        let mut known: Vec<String> = Vec::new();
        loop {
            match self.discover(&interface, 0).await {
                Ok(instances) => {
                    let now_keys: Vec<String> = instances.iter().map(|i| i.service_key.clone()).collect();
                    for departed in known.iter().filter(|k| !now_keys.contains(k)) {
                        let _ = self.inner.offline_tx.send(departed.clone());
                        info!(service_key = %departed, "service instance went offline");
                    }
                    known = now_keys;
                    let _ = tx.send(instances);
                }
                Err(error) => warn!(%error, interface, "discovery refresh failed"),
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Re-registers every locally-registered instance. Called after a
    /// session loss is detected, per spec §4.7's failure-handling note.
    pub async fn reregister_all(&self) {
        let instances: Vec<ServiceInstance> = self.inner.registered.iter().map(|e| e.value().clone()).collect();
        for instance in instances {
            if let Err(error) = self.register(instance.clone()).await {
                warn!(%error, service_key = %instance.service_key, "failed to re-register after session loss");
            }
        }
    }
}

#[async_trait]
impl Discovery for ConsulDiscovery {
    #[instrument(skip(self, instance))]
    async fn register(&self, instance: ServiceInstance) -> Result<(), DiscoveryError> {
        let path = self.node_path(&instance.service_key);
        let value = serde_json::to_vec(&instance)?;
        consulrs::kv::set(&self.inner.client, &path, &value, None)
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        self.inner.registered.insert(instance.service_key.clone(), instance);
        debug!(path, "registered service instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unregister(&self, service_key: &str) -> Result<(), DiscoveryError> {
        if let Some(mut entry) = self.inner.registered.get_mut(service_key) {
            entry.status = ServiceStatus::Draining;
            let path = self.node_path(service_key);
            let value = serde_json::to_vec(&*entry)?;
            consulrs::kv::set(&self.inner.client, &path, &value, None)
                .await
                .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        }
        tokio::time::sleep(self.inner.config.drain_time()).await;

        let path = self.node_path(service_key);
        consulrs::kv::delete(&self.inner.client, &path, None)
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        self.inner.registered.remove(service_key);
        info!(service_key, "unregistered service instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn discover(&self, interface: &str, server_id: u64) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        if server_id != 0 {
            let key = service_key(interface, server_id);
            let path = self.node_path(&key);
            let response = consulrs::kv::read(&self.inner.client, &path, None)
                .await
                .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
            let entries = response.response;
            let entry = entries.first().ok_or_else(|| DiscoveryError::NotFound(key.clone()))?;
            let value = entry.value.clone().ok_or_else(|| DiscoveryError::NotFound(key.clone()))?;
            let instance: ServiceInstance = serde_json::from_slice(&value)?;
            return Ok(vec![instance]);
        }

        let prefix = format!("{}/", self.inner.config.root.trim_end_matches('/'));
        let response = consulrs::kv::read(&self.inner.client, &format!("{prefix}?recurse"), None)
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        let wanted_prefix = format!("{interface}#");
        let mut out = Vec::new();
        for entry in response.response {
            let Some(value) = entry.value else { continue };
            let instance: ServiceInstance = match serde_json::from_slice(&value) {
                Ok(i) => i,
                Err(_) => continue,
            };
            if instance.service_key.starts_with(&wanted_prefix) && instance.status == ServiceStatus::Up {
                out.push(instance);
            }
        }
        Ok(out)
    }

    fn subscribe(&self, interface: &str) -> watch::Receiver<Vec<ServiceInstance>> {
        self.ensure_watch(interface)
    }

    fn offline_events(&self) -> broadcast::Receiver<String> {
        self.inner.offline_tx.subscribe()
    }
}

/// In-memory [`Discovery`] used by tests and single-process deployments:
/// no consul, just a shared map plus the same watch/broadcast surface.
#[derive(Default)]
pub struct InMemoryDiscovery {
    instances: DashMap<String, ServiceInstance>,
    watches: DashMap<String, watch::Sender<Vec<ServiceInstance>>>,
    offline_tx: std::sync::OnceLock<broadcast::Sender<String>>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    fn offline_tx(&self) -> &broadcast::Sender<String> {
        self.offline_tx.get_or_init(|| broadcast::channel(256).0)
    }

    fn notify(&self, interface: &str) {
        if let Some(tx) = self.watches.get(interface) {
            let _ = tx.send(self.list_interface(interface));
        }
    }

    fn list_interface(&self, interface: &str) -> Vec<ServiceInstance> {
        let prefix = format!("{interface}#");
        self.instances
            .iter()
            .filter(|e| e.key().starts_with(&prefix) && e.value().status == ServiceStatus::Up)
            .map(|e| e.value().clone())
            .collect()
    }
}

#[async_trait]
impl Discovery for InMemoryDiscovery {
    async fn register(&self, instance: ServiceInstance) -> Result<(), DiscoveryError> {
        let interface = instance.interface_name().to_string();
        self.instances.insert(instance.service_key.clone(), instance);
        self.notify(&interface);
        Ok(())
    }

    async fn unregister(&self, service_key: &str) -> Result<(), DiscoveryError> {
        if let Some((_, instance)) = self.instances.remove(service_key) {
            self.notify(instance.interface_name());
            let _ = self.offline_tx().send(service_key.to_string());
        }
        Ok(())
    }

    async fn discover(&self, interface: &str, server_id: u64) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        if server_id != 0 {
            let key = service_key(interface, server_id);
            return self
                .instances
                .get(&key)
                .map(|e| vec![e.value().clone()])
                .ok_or(DiscoveryError::NotFound(key));
        }
        Ok(self.list_interface(interface))
    }

    fn subscribe(&self, interface: &str) -> watch::Receiver<Vec<ServiceInstance>> {
        let rx = self
            .watches
            .entry(interface.to_string())
            .or_insert_with(|| watch::channel(self.list_interface(interface)).0)
            .subscribe();
        rx
    }

    fn offline_events(&self) -> broadcast::Receiver<String> {
        self.offline_tx().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_safe_replaces_reserved_characters() {
        assert_eq!(path_safe("com.x.IGameService#2"), "com_x_IGameService_2");
    }

    #[test]
    fn server_id_recovered_from_last_underscore() {
        assert_eq!(server_id_from_node_name("com_x_IGameService_2"), Some(2));
    }

    #[tokio::test]
    async fn in_memory_discovery_wildcard_returns_only_up_instances() {
        let discovery = InMemoryDiscovery::new();
        discovery
            .register(ServiceInstance {
                service_key: service_key("IGameService", 1),
                address: "10.0.0.1:9000".to_string(),
                server_id: 1,
                weight: 1,
                status: ServiceStatus::Up,
                metadata: HashMap::new(),
                register_time: 0,
            })
            .await
            .unwrap();
        discovery
            .register(ServiceInstance {
                service_key: service_key("IGameService", 2),
                address: "10.0.0.2:9000".to_string(),
                server_id: 2,
                weight: 1,
                status: ServiceStatus::Draining,
                metadata: HashMap::new(),
                register_time: 0,
            })
            .await
            .unwrap();

        let found = discovery.discover("IGameService", 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].server_id, 1);
    }

    #[tokio::test]
    async fn unregister_fires_offline_event_exactly_once() {
        let discovery = InMemoryDiscovery::new();
        let key = service_key("IGameService", 2);
        discovery
            .register(ServiceInstance {
                service_key: key.clone(),
                address: "10.0.0.2:9000".to_string(),
                server_id: 2,
                weight: 1,
                status: ServiceStatus::Up,
                metadata: HashMap::new(),
                register_time: 0,
            })
            .await
            .unwrap();
        let mut offline = discovery.offline_events();
        discovery.unregister(&key).await.unwrap();
        assert_eq!(offline.recv().await.unwrap(), key);
    }
}
