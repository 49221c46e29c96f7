//! RPC server core (spec §4.6, C6): an accept loop that registers itself
//! with discovery on startup, dispatches frames to a bounded worker
//! executor, answers heartbeats inline on the read task, and drains
//! in-flight connections during a graceful shutdown.
//!
//! Generalizes `readyset`'s `TcpListenerStream` + per-connection spawn
//! accept loop (`readyset/src/lib.rs`) from "decode a SQL wire protocol
//! frame" to this toolkit's own framed RPC protocol.

pub mod registry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use citadel_config::RpcServerConfig;
use citadel_discovery::{service_key, Discovery, ServiceInstance, ServiceStatus};
use citadel_errors::CitadelError;
use citadel_wire::{CompressId, Frame, FrameCodec, MsgType, ResponseCode, RpcRequest, RpcResponse};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

pub use registry::{Handler, ServiceRegistry};

/// Accepts connections, dispatches requests, and owns this process's
/// lifecycle in discovery. One per listening address.
pub struct RpcServer {
    config: RpcServerConfig,
    registry: ServiceRegistry,
    discovery: Arc<dyn Discovery>,
    advertise_addr: String,
    active_connections: AtomicUsize,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, discovery: Arc<dyn Discovery>, advertise_addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: ServiceRegistry::new(),
            discovery,
            advertise_addr: advertise_addr.into(),
            active_connections: AtomicUsize::new(0),
        })
    }

    /// Registers `handler` under `interface#serverId`; call before [`serve`]
    /// so the startup registration pass (spec §4.6) advertises it.
    pub fn register(&self, interface: impl Into<String>, server_id: u64, handler: Arc<dyn Handler>) {
        self.registry.register(interface, server_id, handler);
    }

    /// Binds `bind_addr`, registers every handler with discovery, and
    /// accepts connections until `shutdown` is set to `true`. Returns once
    /// discovery has been withdrawn and in-flight connections have either
    /// drained or `shutdown_timeout_sec` has elapsed.
    #[instrument(skip(self, shutdown))]
    pub async fn serve(self: Arc<Self>, bind_addr: &str, mut shutdown: watch::Receiver<bool>) -> Result<(), CitadelError> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| CitadelError::Transport(e.to_string()))?;
        self.register_all().await?;
        info!(bind_addr, advertise = %self.advertise_addr, "rpc server listening");

        let semaphore = Arc::new(Semaphore::new(self.config.worker_concurrency));
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if self.config.tcp_nodelay {
                                let _ = stream.set_nodelay(true);
                            }
                            let this = self.clone();
                            let sem = semaphore.clone();
                            tokio::spawn(async move { this.handle_connection(stream, peer, sem).await });
                        }
                        Err(error) => warn!(%error, "accept failed"),
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutting down: withdrawing from discovery and draining connections");
        self.unregister_all().await;
        self.wait_for_drain().await;
        Ok(())
    }

    async fn register_all(&self) -> Result<(), CitadelError> {
        let register_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        for (interface, server_id) in self.registry.instances() {
            let instance = ServiceInstance {
                service_key: service_key(&interface, server_id),
                address: self.advertise_addr.clone(),
                server_id,
                weight: 1,
                status: ServiceStatus::Up,
                metadata: Default::default(),
                register_time,
            };
            self.discovery.register(instance).await.map_err(|e| CitadelError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    async fn unregister_all(&self) {
        for (interface, server_id) in self.registry.instances() {
            let key = service_key(&interface, server_id);
            if let Err(error) = self.discovery.unregister(&key).await {
                warn!(%error, key, "failed to unregister service on shutdown");
            }
        }
    }

    async fn wait_for_drain(&self) {
        let deadline = Instant::now() + self.config.shutdown_timeout();
        while self.active_connections.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.active_connections.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "shutdown timeout elapsed with connections still open");
        }
    }

    #[instrument(skip(self, stream, semaphore), fields(%peer))]
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, semaphore: Arc<Semaphore>) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        let framed = Framed::new(stream, FrameCodec);
        let (mut sink, mut stream) = framed.split();
        let (write_tx, mut write_rx) = mpsc::channel::<Frame>(64);

        let write_task = tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let idle = self.config.reader_idle();
        loop {
            match tokio::time::timeout(idle, stream.next()).await {
                Ok(Some(Ok(frame))) => {
                    if frame.msg_type.is_heartbeat() {
                        let reply = Frame {
                            serializer_id: frame.serializer_id,
                            compress_id: CompressId::None as u8,
                            msg_type: MsgType::HeartbeatResponse,
                            msg_id: frame.msg_id,
                            payload: Bytes::new(),
                        };
                        if write_tx.send(reply).await.is_err() {
                            break;
                        }
                        continue;
                    }

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let this = self.clone();
                    let reply_tx = write_tx.clone();
                    tokio::spawn(async move {
                        this.dispatch(frame, reply_tx).await;
                        drop(permit);
                    });
                }
                Ok(Some(Err(error))) => {
                    warn!(%error, "frame decode error, closing connection");
                    break;
                }
                Ok(None) => {
                    debug!("connection closed by peer");
                    break;
                }
                Err(_) => {
                    debug!("idle timeout, closing connection");
                    break;
                }
            }
        }

        drop(write_tx);
        let _ = write_task.await;
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    async fn dispatch(&self, frame: Frame, reply_tx: mpsc::Sender<Frame>) {
        let request: RpcRequest = match citadel_wire::deserialize(frame.serializer_id, &frame.payload) {
            Ok(request) => request,
            Err(error) => {
                warn!(%error, "failed to decode request frame");
                return;
            }
        };
        let req_id = request.req_id;
        let one_way = request.one_way;
        let interface = request.interface_name.clone();
        let server_id = request.server_id;

        let response = match self.registry.resolve(&interface, server_id) {
            Some(handler) => handler.handle(request).await,
            None => RpcResponse::with_code(
                req_id,
                ResponseCode::NotFound,
                format!("no handler registered for {}", service_key(&interface, server_id)),
            ),
        };
        metrics::counter!("citadel_rpc_server_requests_total", "interface" => interface).increment(1);

        if one_way {
            return;
        }
        match citadel_wire::serialize(&response) {
            Ok((serializer_id, payload)) => {
                let frame = Frame {
                    serializer_id,
                    compress_id: CompressId::None as u8,
                    msg_type: MsgType::Response,
                    msg_id: req_id,
                    payload: payload.into(),
                };
                if reply_tx.send(frame).await.is_err() {
                    debug!(req_id, "dropped response, connection already closing");
                }
            }
            Err(error) => warn!(%error, req_id, "failed to encode response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use citadel_discovery::InMemoryDiscovery;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            RpcResponse::ok(request.req_id, request.params)
        }
    }

    #[tokio::test]
    async fn serves_a_request_and_answers_with_the_echoed_payload() {
        let discovery: Arc<dyn Discovery> = Arc::new(InMemoryDiscovery::new());
        let config = RpcServerConfig::default();
        let server = RpcServer::new(config, discovery, "127.0.0.1:0");
        server.register("IGameService", 1, Arc::new(Echo));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bind_addr = addr.to_string();
        let server_task = tokio::spawn({
            let server = server.clone();
            let bind_addr = bind_addr.clone();
            async move { server.serve(&bind_addr, shutdown_rx).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stream = TcpStream::connect(&bind_addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec);
        let request = RpcRequest {
            req_id: 1,
            interface_name: "IGameService".to_string(),
            method_name: "ping".to_string(),
            param_types: Vec::new(),
            params: vec![9, 9],
            server_id: 1,
            one_way: false,
        };
        let (serializer_id, payload) = citadel_wire::serialize(&request).unwrap();
        framed
            .send(Frame {
                serializer_id,
                compress_id: CompressId::None as u8,
                msg_type: MsgType::Request,
                msg_id: 1,
                payload: payload.into(),
            })
            .await
            .unwrap();

        let reply = framed.next().await.unwrap().unwrap();
        let response: RpcResponse = citadel_wire::deserialize(reply.serializer_id, &reply.payload).unwrap();
        assert!(response.is_success());
        assert_eq!(response.data, vec![9, 9]);

        let _ = shutdown_tx.send(true);
        let _ = server_task.await;
    }
}
