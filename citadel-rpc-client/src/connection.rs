//! One pooled, multiplexed TCP connection (spec §4.4/§4.5 C4/C5).
//!
//! Generalizes the framing half of the teacher's transport
//! (`AsyncBincodeStream` + `tokio_tower::multiplex::MultiplexTransport`,
//! `readyset-client::table`) but keeps the tag-correlation table explicit
//! instead of hiding it inside a `tower::Service`, since spec §3's "pending
//! request" data model (`reqId`, `startTime`, `completedFlag`,
//! `cancelledFlag`, `callbacks`, `timerHandle`) wants to be an inspectable
//! struct a caller can cancel, not an opaque future.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use citadel_errors::CitadelError;
use citadel_wire::{Frame, FrameCodec, MsgType, RpcResponse};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

use crate::pending::{Completer, RpcFuture, TimingWheel};

/// Consecutive missed heartbeat replies before a connection is declared
/// dead (spec §4.5: "missing several replies closes the channel").
const MAX_MISSED_HEARTBEATS: u32 = 3;
const HEARTBEAT_IDLE: Duration = Duration::from_secs(15);

/// One multiplexed TCP connection: a write half fed by an mpsc channel, a
/// read half dispatching by `msgId` into this connection's pending-request
/// table, and a heartbeat task watching for idle writes.
pub struct Connection {
    write_tx: mpsc::Sender<Frame>,
    pending: Arc<DashMap<u64, Completer>>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    #[instrument(skip(timing_wheel))]
    pub async fn connect(addr: &str, connect_timeout: Duration, timing_wheel: TimingWheel) -> Result<Self, CitadelError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CitadelError::Transport(format!("connect to {addr} timed out")))?
            .map_err(|e| CitadelError::Transport(format!("connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true).ok();

        let framed = Framed::new(stream, FrameCodec);
        let (mut sink, mut stream) = framed.split();
        let (write_tx, mut write_rx) = mpsc::channel::<Frame>(256);
        let pending: Arc<DashMap<u64, Completer>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        {
            let pending = pending.clone();
            let closed = closed.clone();
            let addr = addr.to_string();
            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(frame) => Self::dispatch(&pending, frame),
                        Err(error) => {
                            warn!(%error, addr, "connection read error");
                            break;
                        }
                    }
                }
                Self::close_all(&pending, &closed, &addr);
            });
        }

        {
            let write_tx = write_tx.clone();
            let pending = pending.clone();
            let closed = closed.clone();
            let addr = addr.to_string();
            tokio::spawn(Self::heartbeat_loop(write_tx, pending, closed, addr));
        }

        Ok(Self { write_tx, pending, closed })
    }

    fn dispatch(pending: &DashMap<u64, Completer>, frame: Frame) {
        if frame.msg_type.is_heartbeat() {
            if let Some((_, completer)) = pending.remove(&frame.msg_id) {
                completer.complete(Ok(RpcResponse::ok(frame.msg_id, Vec::new())));
            }
            return;
        }
        let Some((_, completer)) = pending.remove(&frame.msg_id) else {
            debug!(msg_id = frame.msg_id, "response for unknown or already-completed request, dropping");
            return;
        };
        match citadel_wire::deserialize::<RpcResponse>(frame.serializer_id, &frame.payload) {
            Ok(resp) => completer.complete(Ok(resp)),
            Err(error) => completer.complete(Err(CitadelError::Transport(error.to_string()))),
        }
    }

    /// Channel closed: every still-pending request on this connection
    /// completes with a transport error (spec §4.5).
    fn close_all(pending: &DashMap<u64, Completer>, closed: &AtomicBool, addr: &str) {
        closed.store(true, Ordering::SeqCst);
        for entry in pending.iter() {
            entry.value().complete(Err(CitadelError::Transport(format!("channel to {addr} closed"))));
        }
        pending.clear();
    }

    async fn heartbeat_loop(write_tx: mpsc::Sender<Frame>, pending: Arc<DashMap<u64, Completer>>, closed: Arc<AtomicBool>, addr: String) {
        let mut missed = 0u32;
        let mut next_id = 1u64;
        loop {
            tokio::time::sleep(HEARTBEAT_IDLE).await;
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let msg_id = next_id;
            next_id += 1;
            let (future, completer) = RpcFuture::new();
            pending.insert(msg_id, completer);
            let frame = Frame {
                serializer_id: citadel_wire::SERIALIZER_BINCODE,
                compress_id: citadel_wire::CompressId::None as u8,
                msg_type: MsgType::HeartbeatRequest,
                msg_id,
                payload: bytes::Bytes::new(),
            };
            if write_tx.send(frame).await.is_err() {
                return;
            }
            match tokio::time::timeout(Duration::from_secs(5), future).await {
                Ok(Ok(_)) => missed = 0,
                _ => {
                    missed += 1;
                    if missed >= MAX_MISSED_HEARTBEATS {
                        warn!(addr, missed, "closing connection after missed heartbeats");
                        Self::close_all(&pending, &closed, &addr);
                        return;
                    }
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registers `req_id` in the pending table and writes `frame`. The
    /// caller is expected to have already armed a timeout on the shared
    /// [`TimingWheel`] for this `req_id`.
    pub async fn send_request(&self, req_id: u64, frame: Frame, completer: Completer) -> Result<(), CitadelError> {
        self.pending.insert(req_id, completer.clone());
        if self.write_tx.send(frame).await.is_err() {
            self.pending.remove(&req_id);
            return Err(CitadelError::Transport("connection write channel closed".to_string()));
        }
        Ok(())
    }

    /// One-way call: writes the frame, registers nothing, returns as soon as
    /// the write is accepted (spec §4.5's "no future is created").
    pub async fn send_one_way(&self, frame: Frame) -> Result<(), CitadelError> {
        self.write_tx
            .send(frame)
            .await
            .map_err(|_| CitadelError::Transport("connection write channel closed".to_string()))
    }
}
