//! Per-address connection pool (spec §4.5): up to `maxConnectionsPerAddress`
//! connections, round-robin assignment of outbound calls, lazy connect.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use citadel_errors::CitadelError;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::Connection;
use crate::pending::TimingWheel;

struct AddressPool {
    connections: Mutex<Vec<Arc<Connection>>>,
    next: AtomicUsize,
}

/// Lazily establishes and round-robins connections to each remote address,
/// pruning dead ones as they're discovered.
pub struct ConnectionPool {
    max_per_addr: usize,
    connect_timeout: Duration,
    timing_wheel: TimingWheel,
    pools: DashMap<String, Arc<AddressPool>>,
}

impl ConnectionPool {
    pub fn new(max_per_addr: usize, connect_timeout: Duration, timing_wheel: TimingWheel) -> Self {
        Self { max_per_addr, connect_timeout, timing_wheel, pools: DashMap::new() }
    }

    pub async fn get(&self, addr: &str) -> Result<Arc<Connection>, CitadelError> {
        let pool = self
            .pools
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(AddressPool { connections: Mutex::new(Vec::new()), next: AtomicUsize::new(0) }))
            .clone();

        let mut conns = pool.connections.lock().await;
        conns.retain(|c| !c.is_closed());

        if conns.len() < self.max_per_addr {
            let conn = Arc::new(Connection::connect(addr, self.connect_timeout, self.timing_wheel.clone()).await?);
            debug!(addr, total = conns.len() + 1, "opened pooled connection");
            conns.push(conn.clone());
            return Ok(conn);
        }

        let idx = pool.next.fetch_add(1, Ordering::Relaxed) % conns.len();
        Ok(conns[idx].clone())
    }

    /// Drops every connection pooled for `addr` without closing their
    /// sockets explicitly — dropping the last `Arc` tears down their tasks
    /// via channel closure. Used on a discovery service-offline event (spec
    /// §4.5's "invalidates cached instance lists and connections").
    pub fn invalidate(&self, addr: &str) {
        self.pools.remove(addr);
    }
}
