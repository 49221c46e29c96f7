//! Service registry (spec §4.6): maps `interfaceName#serverId` to the
//! handler that serves it, the server-side mirror of the client's
//! discovery cache.

use std::sync::Arc;

use async_trait::async_trait;
use citadel_wire::{RpcRequest, RpcResponse};
use dashmap::DashMap;

/// One RPC-reachable interface implementation. Dispatch calls `handle` on
/// the shared worker executor (bounded by `RpcServerConfig::worker_concurrency`
/// in the accept loop), never on the connection's read task directly, so a
/// slow handler can't stall other connections' heartbeats.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: RpcRequest) -> RpcResponse;
}

struct Registered {
    interface: String,
    server_id: u64,
    handler: Arc<dyn Handler>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Registered>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, interface: impl Into<String>, server_id: u64, handler: Arc<dyn Handler>) {
        let interface = interface.into();
        let key = citadel_discovery::service_key(&interface, server_id);
        self.services.insert(key, Registered { interface, server_id, handler });
    }

    pub fn resolve(&self, interface: &str, server_id: u64) -> Option<Arc<dyn Handler>> {
        let key = citadel_discovery::service_key(interface, server_id);
        self.services.get(&key).map(|entry| entry.handler.clone())
    }

    /// `(interfaceName, serverId)` pairs to advertise to discovery on
    /// startup and withdraw on shutdown.
    pub fn instances(&self) -> Vec<(String, u64)> {
        self.services.iter().map(|entry| (entry.interface.clone(), entry.server_id)).collect()
    }
}
