//! Pending-request table (spec §3/§4.5/§5): a timed future per in-flight
//! call, completed exactly once by whichever of {response, timeout,
//! channel-close, cancel} happens first.
//!
//! The source's dynamic-proxy callers get a plain future back; this spec
//! additionally wants `onSuccess`/`onFail`/`whenComplete` callbacks that fire
//! immediately if the response already arrived. Modeled as a small shared
//! state machine behind an `Arc`, with a single background task driving all
//! timeouts off one `DelayQueue` — the "client timing wheel" of spec §5 —
//! rather than a `tokio::time::sleep` per call.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use citadel_errors::CitadelError;
use citadel_wire::RpcResponse;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::warn;

pub type CallResult = Result<RpcResponse, CitadelError>;
type Callback = Box<dyn FnOnce(&CallResult) + Send>;

struct Shared {
    completed: AtomicBool,
    cancelled: AtomicBool,
    result: Mutex<Option<CallResult>>,
    callbacks: Mutex<Vec<Callback>>,
    notify: Notify,
}

impl Shared {
    /// Completes exactly once; later callers are ignored, matching spec
    /// §3's "completed exactly once" pending-request lifecycle.
    ///
    /// Takes the callbacks lock before flipping `completed` and stores the
    /// result while still holding it, so a concurrent `when_complete` either
    /// gets its callback appended to the snapshot drained below, or observes
    /// `completed == true` only once the result is already in place — there
    /// is no window where it sees one without the other.
    fn complete(&self, result: CallResult) -> bool {
        let callbacks = {
            let mut callbacks = self.callbacks.lock();
            if self.completed.swap(true, Ordering::SeqCst) {
                return false;
            }
            *self.result.lock() = Some(result);
            std::mem::take(&mut *callbacks)
        };
        let guard = self.result.lock();
        let outcome = guard.as_ref().expect("result just set");
        for cb in callbacks {
            cb(outcome);
        }
        drop(guard);
        self.notify.notify_waiters();
        true
    }
}

/// Handed to whoever owns the wire-level side of a call (the connection's
/// read loop, or the timing wheel) so they can resolve it without holding a
/// reference to the whole [`RpcFuture`].
#[derive(Clone)]
pub struct Completer {
    shared: Arc<Shared>,
}

impl Completer {
    pub fn complete(&self, result: CallResult) {
        self.shared.complete(result);
    }
}

/// The future an RPC call returns. Can be `.await`ed directly (it resolves
/// once `complete` is called from any source), or driven purely through
/// `on_success`/`on_fail`/`when_complete` for the async/callback calling
/// style spec §4.5 describes.
pub struct RpcFuture {
    shared: Arc<Shared>,
}

impl RpcFuture {
    pub fn new() -> (Self, Completer) {
        let shared = Arc::new(Shared {
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            result: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        (Self { shared: shared.clone() }, Completer { shared })
    }

    /// Registers a callback that fires at most once, in attachment order. If
    /// the call has already completed it fires immediately, under the same
    /// lock a concurrent `complete` would take, so there is no window where
    /// a late attach misses a result that already landed.
    pub fn when_complete(&self, f: impl FnOnce(&CallResult) + Send + 'static) {
        let boxed: Callback = Box::new(f);
        let mut callbacks = self.shared.callbacks.lock();
        if self.shared.completed.load(Ordering::SeqCst) {
            drop(callbacks);
            let guard = self.shared.result.lock();
            if let Some(result) = guard.as_ref() {
                boxed(result);
            }
        } else {
            callbacks.push(boxed);
        }
    }

    pub fn on_success(&self, f: impl FnOnce(&RpcResponse) + Send + 'static) {
        self.when_complete(move |r| {
            if let Ok(resp) = r {
                f(resp);
            }
        });
    }

    pub fn on_fail(&self, f: impl FnOnce(&CitadelError) + Send + 'static) {
        self.when_complete(move |r| {
            if let Err(e) = r {
                f(e);
            }
        });
    }

    /// Succeeds only if the future is not yet completed (spec §5): flips
    /// `cancelled`, completes with a cancellation error, and lets the
    /// timing wheel's own cancel path (driven by the caller dropping its
    /// `CallHandle`) reclaim the armed timer.
    pub fn cancel(&self) -> bool {
        if self.shared.completed.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.complete(Err(CitadelError::Transport("request cancelled".to_string())))
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

impl Future for RpcFuture {
    type Output = CallResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared.completed.load(Ordering::SeqCst) {
            let mut guard = self.shared.result.lock();
            return Poll::Ready(guard.take().unwrap_or_else(|| Err(CitadelError::Transport("result taken twice".to_string()))));
        }
        let notified = self.shared.notify.notified();
        tokio::pin!(notified);
        match notified.poll(cx) {
            Poll::Ready(()) => self.poll(cx),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum WheelCmd {
    Arm { key: u64, timeout: Duration, completer: Completer },
    Cancel { key: u64 },
}

/// The single background task every pending request's timeout is armed
/// against, per spec §5's "client timing wheel (single thread)". Backed by
/// a `DelayQueue` rather than one `sleep` per call so the cost of tracking
/// thousands of in-flight timeouts stays O(log n) per arm/cancel.
#[derive(Clone)]
pub struct TimingWheel {
    tx: mpsc::UnboundedSender<WheelCmd>,
}

impl TimingWheel {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(rx));
        Self { tx }
    }

    pub fn arm(&self, key: u64, timeout: Duration, completer: Completer) {
        let _ = self.tx.send(WheelCmd::Arm { key, timeout, completer });
    }

    pub fn cancel(&self, key: u64) {
        let _ = self.tx.send(WheelCmd::Cancel { key });
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<WheelCmd>) {
        let mut queue: DelayQueue<u64> = DelayQueue::new();
        let mut keys: HashMap<u64, delay_queue::Key> = HashMap::new();
        let mut completers: HashMap<u64, (Duration, Completer)> = HashMap::new();

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(WheelCmd::Arm { key, timeout, completer }) => {
                            if let Some(old) = keys.remove(&key) {
                                queue.remove(&old);
                            }
                            let delay_key = queue.insert(key, timeout);
                            keys.insert(key, delay_key);
                            completers.insert(key, (timeout, completer));
                        }
                        Some(WheelCmd::Cancel { key }) => {
                            if let Some(delay_key) = keys.remove(&key) {
                                queue.remove(&delay_key);
                            }
                            completers.remove(&key);
                        }
                        None => break,
                    }
                }
                Some(expired) = futures_util::StreamExt::next(&mut queue), if !queue.is_empty() => {
                    let key = expired.into_inner();
                    keys.remove(&key);
                    if let Some((timeout, completer)) = completers.remove(&key) {
                        completer.complete(Err(CitadelError::Timeout(timeout)));
                    }
                }
            }
        }
        warn!("timing wheel sender dropped, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_complete_fires_immediately_if_already_resolved() {
        let (future, completer) = RpcFuture::new();
        completer.complete(Ok(RpcResponse::ok(1, vec![])));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        future.when_complete(move |r| {
            flag.store(r.is_ok(), Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn complete_is_idempotent() {
        let (future, completer) = RpcFuture::new();
        assert!(Shared::complete(&completer.shared, Ok(RpcResponse::ok(1, vec![]))));
        assert!(!Shared::complete(&completer.shared, Ok(RpcResponse::ok(1, vec![]))));
        let _ = future;
    }

    #[tokio::test]
    async fn timing_wheel_times_out_an_unresolved_call() {
        let wheel = TimingWheel::spawn();
        let (future, completer) = RpcFuture::new();
        wheel.arm(1, Duration::from_millis(20), completer);
        let result = future.await;
        assert!(matches!(result, Err(CitadelError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancel_only_succeeds_once() {
        let (future, _completer) = RpcFuture::new();
        assert!(future.cancel());
        assert!(!future.cancel());
        let result = future.await;
        assert!(result.is_err());
    }
}
