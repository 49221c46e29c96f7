//! RPC client core (spec §4.5, C5): proxy dispatch over discovery + load
//! balancing + a pooled multiplexed connection per remote address, with
//! timed futures, callbacks, one-way calls, and transport-level retry.
//!
//! Generalizes `readyset-client::table::{Table, TableRpc, Discover}` —
//! balance-over-candidates, then call through a pooled connection — but
//! keeps request/response correlation as an explicit pending-request table
//! (`connection`/`pending` modules) instead of a `tower::Service`, so the
//! callback/cancel surface spec §3 describes is a concrete API rather than
//! hidden inside `tower::Buffer`.

pub mod balancer;
pub mod connection;
pub mod pending;
pub mod pool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use citadel_config::RpcClientConfig;
use citadel_discovery::Discovery;
use citadel_errors::CitadelError;
use citadel_wire::{Frame, MsgType, RpcRequest};
use tracing::{instrument, warn};

use balancer::{LoadBalanceStrategy, LoadBalancer};
use pending::{CallResult, RpcFuture, TimingWheel};
use pool::ConnectionPool;

/// Per-method call configuration, the Rust stand-in for the source's
/// `@Timeout(ms, retries)` annotation (spec §6) — resolved once when a
/// [`ServiceProxy`] is built instead of reflected on every call.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub one_way: bool,
}

impl CallOptions {
    pub fn from_config(config: &RpcClientConfig) -> Self {
        Self { timeout: config.timeout(), retries: config.retries, one_way: false }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }
}

/// Shared client state: discovery handle, load balancer, connection pool,
/// and the monotonic reqId counter spec §4.5 step 1 describes.
pub struct RpcClient {
    discovery: Arc<dyn Discovery>,
    balancer: LoadBalancer,
    pool: ConnectionPool,
    timing_wheel: TimingWheel,
    next_req_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: &RpcClientConfig, discovery: Arc<dyn Discovery>, strategy: LoadBalanceStrategy) -> Arc<Self> {
        let timing_wheel = TimingWheel::spawn();
        let client = Arc::new(Self {
            discovery: discovery.clone(),
            balancer: LoadBalancer::new(strategy),
            pool: ConnectionPool::new(config.max_conn_per_addr, config.connect_timeout(), timing_wheel.clone()),
            timing_wheel,
            next_req_id: AtomicU64::new(1),
        });
        client.clone().spawn_offline_watcher();
        client
    }

    /// Invalidates pooled connections and the balancer's ring cache for any
    /// address whose service instance just went offline (spec §4.5's
    /// "service-offline hook").
    fn spawn_offline_watcher(self: Arc<Self>) {
        let mut offline = self.discovery.offline_events();
        tokio::spawn(async move {
            while let Ok(service_key) = offline.recv().await {
                warn!(service_key, "invalidating routes after service-offline notification");
                self.balancer.invalidate();
            }
        });
    }

    fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolves candidates for `interface#server_id` (`server_id == 0` is
    /// the wildcard) and picks one via the configured load-balance strategy,
    /// using `routing_key` only for consistent hashing (spec §4.5 steps 2-3).
    /// `excluded` addresses are filtered out first, so a retry after a
    /// transport failure reselects a different instance when more than one
    /// is available (spec §4.5's retry step).
    async fn resolve(&self, interface: &str, server_id: u64, routing_key: &str, excluded: &[String]) -> Result<String, CitadelError> {
        let mut candidates = self
            .discovery
            .discover(interface, server_id)
            .await
            .map_err(|e| CitadelError::Protocol(e.to_string()))?;
        if !excluded.is_empty() {
            let filtered: Vec<_> = candidates.iter().filter(|i| !excluded.contains(&i.address)).cloned().collect();
            if !filtered.is_empty() {
                candidates = filtered;
            }
        }
        self.balancer
            .select(&candidates, routing_key)
            .map(|i| i.address.clone())
            .ok_or_else(|| CitadelError::Protocol(format!("no instance available for {interface}#{server_id}")))
    }

    /// The full call path (spec §4.5 steps 1-6): build the request frame,
    /// resolve + balance a target, acquire a pooled connection, register the
    /// pending future with an armed timeout, write, and await it — retrying
    /// up to `options.retries` times on transport-level failure only
    /// (business errors never retry).
    #[instrument(skip(self, params))]
    pub async fn call(
        &self,
        interface: &str,
        method: &str,
        server_id: u64,
        routing_key: &str,
        params: Vec<u8>,
        options: CallOptions,
    ) -> Result<Vec<u8>, CitadelError> {
        let req_id = self.next_req_id();
        let request = RpcRequest {
            req_id,
            interface_name: interface.to_string(),
            method_name: method.to_string(),
            param_types: Vec::new(),
            params,
            server_id,
            one_way: options.one_way,
        };

        if options.one_way {
            let addr = self.resolve(interface, server_id, routing_key, &[]).await?;
            let frame = self.encode_request(req_id, &request)?;
            let conn = self.pool.get(&addr).await?;
            conn.send_one_way(frame).await?;
            return Ok(Vec::new());
        }

        let mut attempt = 0u32;
        let mut excluded: Vec<String> = Vec::new();
        loop {
            let result = self.call_once(&request, server_id, routing_key, &excluded, options.timeout).await;
            match result {
                Ok((data, _)) => return Ok(data),
                Err((error, tried_addr)) if error.is_retryable() && attempt < options.retries => {
                    attempt += 1;
                    if let Some(addr) = tried_addr {
                        excluded.push(addr);
                    }
                    warn!(interface, method, attempt, %error, "retrying rpc call after transport failure");
                }
                Err((error, _)) => return Err(error),
            }
        }
    }

    /// Returns the address a failed attempt was made against (so the caller
    /// can exclude it on retry) alongside the error.
    async fn call_once(
        &self,
        request: &RpcRequest,
        server_id: u64,
        routing_key: &str,
        excluded: &[String],
        timeout: Duration,
    ) -> Result<(Vec<u8>, String), (CitadelError, Option<String>)> {
        let addr = self.resolve(&request.interface_name, server_id, routing_key, excluded).await.map_err(|e| (e, None))?;
        let frame = self.encode_request(request.req_id, request).map_err(|e| (e, Some(addr.clone())))?;
        let conn = match self.pool.get(&addr).await {
            Ok(conn) => conn,
            Err(e) => return Err((e, Some(addr))),
        };

        let (future, completer) = RpcFuture::new();
        self.timing_wheel.arm(request.req_id, timeout, completer.clone());
        if let Err(e) = conn.send_request(request.req_id, frame, completer).await {
            return Err((e, Some(addr)));
        }

        let result: CallResult = future.await;
        self.timing_wheel.cancel(request.req_id);
        match result {
            Ok(resp) if resp.is_success() => Ok((resp.data, addr)),
            Ok(resp) => match resp.exception_class {
                Some(class) => Err((CitadelError::Business { class, message: resp.message }, Some(addr))),
                None => Err((CitadelError::Protocol(resp.message), Some(addr))),
            },
            Err(error) => Err((error, Some(addr))),
        }
    }

    fn encode_request(&self, req_id: u64, request: &RpcRequest) -> Result<Frame, CitadelError> {
        let (serializer_id, payload) =
            citadel_wire::serialize(request).map_err(|e| CitadelError::Transport(e.to_string()))?;
        Ok(Frame {
            serializer_id,
            compress_id: citadel_wire::CompressId::None as u8,
            msg_type: MsgType::Request,
            msg_id: req_id,
            payload: payload.into(),
        })
    }
}

/// A typed, interface-scoped handle over [`RpcClient`] — the "typed stub
/// instead of a dynamic proxy" REDESIGN FLAGS calls for. Method ids (really
/// just the method name plus its [`CallOptions`]) are resolved once, at
/// proxy construction, instead of per call.
pub struct ServiceProxy {
    client: Arc<RpcClient>,
    interface: String,
    server_id: u64,
}

impl ServiceProxy {
    pub fn new(client: Arc<RpcClient>, interface: impl Into<String>, server_id: u64) -> Self {
        Self { client, interface: interface.into(), server_id }
    }

    /// Invokes `method` with pre-serialized `params`, blocking until the
    /// timed future resolves. `routing_key` drives consistent-hash
    /// balancing (e.g. a stringified player id) when the proxy's balancer
    /// is configured for it; otherwise it's ignored.
    pub async fn call(&self, method: &str, routing_key: &str, params: Vec<u8>, options: CallOptions) -> Result<Vec<u8>, CitadelError> {
        self.client.call(&self.interface, method, self.server_id, routing_key, params, options).await
    }

    /// Same call, but returns the timed future immediately instead of
    /// awaiting it — the async variant spec §4.5 describes for interface
    /// methods whose declared return type is the future type.
    pub fn call_async(&self, method: &str, routing_key: &str, params: Vec<u8>, options: CallOptions) -> RpcFuture {
        let client = self.client.clone();
        let interface = self.interface.clone();
        let method = method.to_string();
        let routing_key = routing_key.to_string();
        let server_id = self.server_id;
        let (future, completer) = RpcFuture::new();
        tokio::spawn(async move {
            let result = client.call(&interface, &method, server_id, &routing_key, params, options).await;
            let resp: CallResult = result.map(|data| citadel_wire::RpcResponse::ok(0, data));
            completer.complete(resp);
        });
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use citadel_discovery::{service_key, InMemoryDiscovery, ServiceInstance, ServiceStatus};

    #[tokio::test]
    async fn call_fails_fast_when_no_instance_is_registered() {
        let discovery: Arc<dyn Discovery> = Arc::new(InMemoryDiscovery::new());
        let config = RpcClientConfig::default();
        let client = RpcClient::new(&config, discovery, LoadBalanceStrategy::Random);

        let result = client
            .call("IGameService", "enterGame", 0, "player-1", vec![], CallOptions::from_config(&config))
            .await;
        assert!(matches!(result, Err(CitadelError::Protocol(_))));
    }

    #[tokio::test]
    async fn resolve_picks_an_up_instance() {
        let discovery = Arc::new(InMemoryDiscovery::new());
        discovery
            .register(ServiceInstance {
                service_key: service_key("IGameService", 1),
                address: "127.0.0.1:1".to_string(),
                server_id: 1,
                weight: 1,
                status: ServiceStatus::Up,
                metadata: Default::default(),
                register_time: 0,
            })
            .await
            .unwrap();
        let discovery: Arc<dyn Discovery> = discovery;
        let config = RpcClientConfig::default();
        let client = RpcClient::new(&config, discovery, LoadBalanceStrategy::Random);
        let addr = client.resolve("IGameService", 0, "x", &[]).await.unwrap();
        assert_eq!(addr, "127.0.0.1:1");
    }
}
