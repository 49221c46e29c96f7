//! Async-writeback manager (spec §4.3, C3).
//!
//! Generalizes the teacher's worker-per-shard ownership model
//! (`readyset-dataflow`'s sharded domains, each owning a disjoint slice of
//! state) into "every entity is owned by exactly one land worker, selected
//! by a hash of its class and key", and its batching cadence from the
//! fintick-streams `db-writer` example's `Batch::should_flush` gating.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use citadel_config::WritebackConfig;
use citadel_entity::EntityState;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

pub type EntityKey = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Delete,
    Insert,
    Update,
}

impl Op {
    /// Batches within a worker's collected set are processed
    /// DELETE -> INSERT -> UPDATE so a delete that raced an insert for the
    /// same key always wins.
    fn order(self) -> u8 {
        match self {
            Op::Delete => 0,
            Op::Insert => 1,
            Op::Update => 2,
        }
    }
}

/// The writeback manager's view of a queued entity. Business types hold
/// their state behind a [`citadel_entity::EntityHandle`]; this trait is the
/// narrow slice of that handle the worker loop needs, so the manager stays
/// generic over entity type.
pub trait LandableEntity: Send + Sync {
    fn class(&self) -> &'static str;
    fn key(&self) -> EntityKey;
    fn state(&self) -> EntityState;
    fn business_version(&self) -> u64;
    /// Called after a task for this entity lands successfully, with the
    /// version that was captured when the task was enqueued.
    fn mark_synced(&self, landed_version: u64);
}

pub struct LandTask {
    pub entity: Arc<dyn LandableEntity>,
    pub op: Op,
    pub enqueued_at: Instant,
    pub captured_version: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Retry,
    FinalFailure,
}

/// Persists one (op, class) group of tasks. Implemented by the business
/// layer on top of `citadel-sql`; the manager only knows how to schedule and
/// retry, never how to build or run a statement.
#[async_trait]
pub trait Lander: Send + Sync {
    async fn land_batch(&self, op: Op, class: &'static str, tasks: &[Arc<LandTask>]) -> Vec<TaskOutcome>;
}

enum WorkerMsg {
    Task(Arc<LandTask>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Idle,
    Normal,
    Backlog,
}

fn poll_interval(load: LoadState, config: &WritebackConfig) -> Duration {
    let base = config.land_interval();
    match load {
        LoadState::Backlog => (base / 2).max(Duration::from_millis(1)),
        LoadState::Normal => base,
        LoadState::Idle => base * 4,
    }
}

/// The other half of the adaptive state machine (spec §4.3): BACKLOG
/// doubles the per-poll drain cap, IDLE halves it, both floored at 1 task.
fn batch_cap(load: LoadState, config: &WritebackConfig) -> usize {
    let base = config.batch_size;
    match load {
        LoadState::Backlog => base.saturating_mul(2).max(1),
        LoadState::Normal => base.max(1),
        LoadState::Idle => (base / 2).max(1),
    }
}

/// Hysteresis: enters BACKLOG at the configured threshold, but only leaves
/// it once depth drops below half that, so a worker sitting right at the
/// line doesn't flap between intervals every poll.
fn next_load_state(current: LoadState, depth: usize, config: &WritebackConfig) -> LoadState {
    if depth >= config.backlog_threshold {
        return LoadState::Backlog;
    }
    if current == LoadState::Backlog && depth >= config.backlog_threshold / 2 {
        return LoadState::Backlog;
    }
    if depth <= config.idle_threshold {
        return LoadState::Idle;
    }
    LoadState::Normal
}

/// `worker_of(class) = annotatedIndex(class) if 0<=i<W else hash(class) % W`
/// (spec §4.3): a class is pinned to a worker wholesale, never split by key,
/// so that worker is the sole writer for everything in that class.
fn worker_index(class: &'static str, worker_count: usize, overrides: &DashMap<&'static str, usize>) -> usize {
    if let Some(pinned) = overrides.get(class) {
        if *pinned < worker_count {
            return *pinned;
        }
    }
    let mut hasher = DefaultHasher::new();
    class.hash(&mut hasher);
    ((hasher.finish() & 0x7FFF_FFFF) as usize) % worker_count.max(1)
}

struct DirtyCache {
    // (class, key) -> version captured by the currently-queued task for it.
    entries: DashMap<(&'static str, EntityKey), u64>,
}

impl DirtyCache {
    fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if a task for `(class, key)` is already queued; on success,
    /// bumps the tracked version to the latest submission so a worker that
    /// later lands the already-queued task reads this submission's version
    /// too (coalescing).
    fn mark_pending(&self, class: &'static str, key: EntityKey, version: u64) -> bool {
        let mut already_pending = true;
        self.entries
            .entry((class, key))
            .and_modify(|v| *v = version)
            .or_insert_with(|| {
                already_pending = false;
                version
            });
        already_pending
    }

    /// Removes the entry only if nothing queued a newer version since the
    /// task we just landed was captured (conditional, CAS-style removal).
    fn remove_if_stale(&self, class: &'static str, key: &EntityKey, landed_version: u64) {
        let k = (class, key.clone());
        self.entries.remove_if(&k, |_, v| *v <= landed_version);
    }

    fn force_remove(&self, class: &'static str, key: &EntityKey) {
        self.entries.remove(&(class, key.clone()));
    }
}

struct WritebackMetrics;

impl WritebackMetrics {
    fn task_enqueued(class: &'static str) {
        metrics::counter!("citadel_writeback_tasks_total", "class" => class).increment(1);
    }
    fn task_succeeded(class: &'static str) {
        metrics::counter!("citadel_writeback_tasks_succeeded", "class" => class).increment(1);
    }
    fn task_retried(class: &'static str) {
        metrics::counter!("citadel_writeback_tasks_retried", "class" => class).increment(1);
    }
    fn task_final_failure(class: &'static str) {
        metrics::counter!("citadel_writeback_tasks_final_failure", "class" => class).increment(1);
    }
}

/// Owns the worker pool and the dirty cache; `submit_*` is the only
/// business-facing surface.
pub struct WritebackManager {
    config: WritebackConfig,
    senders: Vec<mpsc::Sender<WorkerMsg>>,
    depths: Vec<Arc<AtomicUsize>>,
    dirty: Arc<DirtyCache>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    class_overrides: Arc<DashMap<&'static str, usize>>,
}

impl WritebackManager {
    pub fn start(config: WritebackConfig, lander: Arc<dyn Lander>) -> Self {
        metrics::describe_counter!("citadel_writeback_tasks_total", "land tasks submitted, by entity class");
        metrics::describe_counter!("citadel_writeback_tasks_succeeded", "land tasks that committed successfully");
        metrics::describe_counter!("citadel_writeback_tasks_retried", "land tasks re-enqueued after a transient failure");
        metrics::describe_counter!("citadel_writeback_tasks_final_failure", "land tasks dropped after exhausting retries");

        let dirty = Arc::new(DirtyCache::new());
        let class_overrides = Arc::new(DashMap::new());
        let mut senders = Vec::with_capacity(config.land_threads);
        let mut depths = Vec::with_capacity(config.land_threads);
        let mut handles = Vec::with_capacity(config.land_threads);

        for worker_id in 0..config.land_threads {
            let (tx, rx) = mpsc::channel(config.backlog_threshold.max(config.batch_size));
            let depth = Arc::new(AtomicUsize::new(0));
            let worker = Worker {
                worker_id,
                config: config.clone(),
                lander: lander.clone(),
                dirty: dirty.clone(),
                depth: depth.clone(),
                load: LoadState::Normal,
                self_tx: tx.clone(),
                rx,
            };
            handles.push(tokio::spawn(worker.run()));
            senders.push(tx);
            depths.push(depth);
        }

        Self { config, senders, depths, dirty, handles, class_overrides }
    }

    /// Pins `class` to a fixed worker index, the `annotatedIndex` override
    /// spec §4.3 names; a class without one falls back to a hash of its
    /// name. Call before any `submit_*` for the class — it only takes
    /// effect for tasks enqueued after the override is registered.
    pub fn pin_class(&self, class: &'static str, worker: usize) {
        self.class_overrides.insert(class, worker);
    }

    fn route(&self, class: &'static str) -> usize {
        worker_index(class, self.senders.len(), &self.class_overrides)
    }

    async fn enqueue(&self, class: &'static str, _key: EntityKey, op: Op, entity: Arc<dyn LandableEntity>, version: u64) {
        let worker = self.route(class);
        let task = Arc::new(LandTask {
            entity,
            op,
            enqueued_at: Instant::now(),
            captured_version: version,
            retry_count: 0,
        });
        WritebackMetrics::task_enqueued(class);
        self.depths[worker].fetch_add(1, Ordering::Relaxed);
        if self.senders[worker].send(WorkerMsg::Task(task)).await.is_err() {
            warn!(class, "land worker {worker} channel closed, dropping task");
            self.depths[worker].fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Schedules a not-yet-persisted entity for its first INSERT. A second
    /// `submit_insert` for a key still pending is a coalesced no-op: the
    /// entity hasn't landed yet, there is nothing new to tell the worker.
    #[instrument(skip(self, entity))]
    pub async fn submit_insert(&self, entity: Arc<dyn LandableEntity>) {
        let class = entity.class();
        let key = entity.key();
        let version = entity.business_version();
        if self.dirty.mark_pending(class, key.clone(), version) {
            debug!(class, key, "insert already pending, coalesced");
            return;
        }
        self.enqueue(class, key, Op::Insert, entity, version).await;
    }

    /// Schedules an UPDATE. If a task for this entity is already queued
    /// (insert or update), this call coalesces into it: the worker reads
    /// current entity state at land time, so no second task is needed.
    #[instrument(skip(self, entity))]
    pub async fn submit_update(&self, entity: Arc<dyn LandableEntity>) {
        let class = entity.class();
        let key = entity.key();
        let version = entity.business_version();
        if self.dirty.mark_pending(class, key.clone(), version) {
            debug!(class, key, "update coalesced into pending task");
            return;
        }
        self.enqueue(class, key, Op::Update, entity, version).await;
    }

    /// Always force-enqueues a DELETE, even over an already-queued
    /// insert/update for the same key: a stale INSERT is skipped at land
    /// time once the worker observes the entity has moved to `Deleted`.
    #[instrument(skip(self, entity))]
    pub async fn submit_delete(&self, entity: Arc<dyn LandableEntity>) {
        let class = entity.class();
        let key = entity.key();
        let version = entity.business_version();
        self.dirty.entries.insert((class, key.clone()), version);
        self.enqueue(class, key, Op::Delete, entity, version).await;
    }

    pub fn pending_depth(&self) -> usize {
        self.depths.iter().map(|d| d.load(Ordering::Relaxed)).sum()
    }

    pub fn dirty_cache_size(&self) -> usize {
        self.dirty.len()
    }

    /// Sends a poison pill to every worker and waits for them to drain and
    /// exit. Uninterruptible: a caller that needs a hard deadline should
    /// wrap this in `tokio::time::timeout` itself.
    pub async fn shutdown(mut self) {
        for tx in &self.senders {
            let _ = tx.send(WorkerMsg::Shutdown).await;
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("writeback manager shut down");
    }
}

struct Worker {
    worker_id: usize,
    config: WritebackConfig,
    lander: Arc<dyn Lander>,
    dirty: Arc<DirtyCache>,
    depth: Arc<AtomicUsize>,
    load: LoadState,
    self_tx: mpsc::Sender<WorkerMsg>,
    rx: mpsc::Receiver<WorkerMsg>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let interval = poll_interval(self.load, &self.config);
            tokio::time::sleep(interval).await;

            match self.collect_batch().await {
                None => break, // poison pill, or sender side dropped
                Some(tasks) if tasks.is_empty() => {
                    self.load = next_load_state(self.load, 0, &self.config);
                }
                Some(tasks) => {
                    self.process_batch(tasks).await;
                    let depth = self.depth.load(Ordering::Relaxed);
                    self.load = next_load_state(self.load, depth, &self.config);
                }
            }
        }
        debug!(worker_id = self.worker_id, "land worker exiting");
    }

    /// Drains up to the adaptive batch cap's worth of queued tasks without
    /// blocking past the first receive. Returns `None` on shutdown.
    async fn collect_batch(&mut self) -> Option<Vec<Arc<LandTask>>> {
        let first = match self.rx.recv().await {
            Some(WorkerMsg::Task(t)) => t,
            Some(WorkerMsg::Shutdown) | None => return None,
        };
        self.depth.fetch_sub(1, Ordering::Relaxed);
        let cap = batch_cap(self.load, &self.config);
        let mut batch = vec![first];
        while batch.len() < cap {
            match self.rx.try_recv() {
                Ok(WorkerMsg::Task(t)) => {
                    self.depth.fetch_sub(1, Ordering::Relaxed);
                    batch.push(t);
                }
                Ok(WorkerMsg::Shutdown) | Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Groups the batch by `(op, class)`, processes DELETE groups first,
    /// then INSERT, then UPDATE, and hands each group to the injected
    /// [`Lander`].
    async fn process_batch(&self, mut tasks: Vec<Arc<LandTask>>) {
        tasks.sort_by_key(|t| t.op.order());

        let mut start = 0;
        while start < tasks.len() {
            let op = tasks[start].op;
            let class = tasks[start].entity.class();
            let mut end = start + 1;
            while end < tasks.len() && tasks[end].op == op && tasks[end].entity.class() == class {
                end += 1;
            }
            self.process_group(op, class, &tasks[start..end]).await;
            start = end;
        }
    }

    async fn process_group(&self, op: Op, class: &'static str, group: &[Arc<LandTask>]) {
        // A stale INSERT/UPDATE whose entity has already been deleted is a
        // no-op win for the DELETE, not a failure.
        let (skip, live): (Vec<_>, Vec<_>) = group.iter().cloned().partition(|t| {
            op != Op::Delete && t.entity.state() == EntityState::Deleted
        });
        for task in &skip {
            self.dirty.remove_if_stale(class, &task.entity.key(), task.captured_version);
        }
        if live.is_empty() {
            return;
        }

        let outcomes = self.lander.land_batch(op, class, &live).await;
        for (task, outcome) in live.iter().zip(outcomes) {
            match outcome {
                TaskOutcome::Success => {
                    WritebackMetrics::task_succeeded(class);
                    self.dirty.remove_if_stale(class, &task.entity.key(), task.captured_version);
                    task.entity.mark_synced(task.captured_version);
                }
                TaskOutcome::Retry if task.retry_count < self.config.max_retries => {
                    WritebackMetrics::task_retried(class);
                    let retried = Arc::new(LandTask {
                        entity: task.entity.clone(),
                        op: task.op,
                        enqueued_at: task.enqueued_at,
                        captured_version: task.captured_version,
                        retry_count: task.retry_count + 1,
                    });
                    self.depth.fetch_add(1, Ordering::Relaxed);
                    if self.self_tx.send(WorkerMsg::Task(retried)).await.is_err() {
                        self.final_failure(class, task);
                    }
                }
                TaskOutcome::Retry | TaskOutcome::FinalFailure => {
                    self.final_failure(class, task);
                }
            }
        }
    }

    fn final_failure(&self, class: &'static str, task: &Arc<LandTask>) {
        WritebackMetrics::task_final_failure(class);
        self.dirty.force_remove(class, &task.entity.key());
        warn!(
            class,
            key = %task.entity.key(),
            op = ?task.op,
            retry_count = task.retry_count,
            "land task failed permanently"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct TestEntity {
        class: &'static str,
        key: EntityKey,
        state: std::sync::Mutex<EntityState>,
        business_version: AtomicU64,
        db_version: AtomicU64,
    }

    impl LandableEntity for TestEntity {
        fn class(&self) -> &'static str {
            self.class
        }
        fn key(&self) -> EntityKey {
            self.key.clone()
        }
        fn state(&self) -> EntityState {
            *self.state.lock().unwrap()
        }
        fn business_version(&self) -> u64 {
            self.business_version.load(Ordering::Relaxed)
        }
        fn mark_synced(&self, landed_version: u64) {
            self.db_version.store(landed_version, Ordering::Relaxed);
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl Lander for AlwaysSucceeds {
        async fn land_batch(&self, _op: Op, _class: &'static str, tasks: &[Arc<LandTask>]) -> Vec<TaskOutcome> {
            vec![TaskOutcome::Success; tasks.len()]
        }
    }

    #[tokio::test]
    async fn insert_then_update_lands_and_syncs_version() {
        let config = WritebackConfig { land_threads: 1, land_interval_ms: 1, ..Default::default() };
        let manager = WritebackManager::start(config, Arc::new(AlwaysSucceeds));

        let entity = Arc::new(TestEntity {
            class: "players",
            key: "1".to_string(),
            state: std::sync::Mutex::new(EntityState::New),
            business_version: AtomicU64::new(1),
            db_version: AtomicU64::new(0),
        });
        manager.submit_insert(entity.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(entity.db_version.load(Ordering::Relaxed), 1);
        assert_eq!(manager.dirty_cache_size(), 0);

        manager.shutdown().await;
    }

    #[test]
    fn worker_routing_is_stable_for_a_class() {
        let overrides = DashMap::new();
        let a = worker_index("players", 4, &overrides);
        let b = worker_index("players", 4, &overrides);
        assert_eq!(a, b);
    }

    #[test]
    fn annotated_index_override_wins_over_the_hash() {
        let overrides = DashMap::new();
        overrides.insert("players", 2);
        assert_eq!(worker_index("players", 4, &overrides), 2);
    }

    #[test]
    fn out_of_range_override_falls_back_to_the_hash() {
        let overrides = DashMap::new();
        overrides.insert("players", 99);
        let hashed = worker_index("players", 4, &DashMap::new());
        assert_eq!(worker_index("players", 4, &overrides), hashed);
    }

    #[test]
    fn batch_cap_scales_with_load() {
        let config = WritebackConfig { batch_size: 400, ..Default::default() };
        assert_eq!(batch_cap(LoadState::Normal, &config), 400);
        assert_eq!(batch_cap(LoadState::Backlog, &config), 800);
        assert_eq!(batch_cap(LoadState::Idle, &config), 200);
    }

    #[test]
    fn batch_cap_floors_at_one() {
        let config = WritebackConfig { batch_size: 1, ..Default::default() };
        assert_eq!(batch_cap(LoadState::Idle, &config), 1);
    }

    #[test]
    fn backlog_state_has_hysteresis() {
        let config = WritebackConfig { backlog_threshold: 100, idle_threshold: 5, ..Default::default() };
        let mut load = LoadState::Normal;
        load = next_load_state(load, 100, &config);
        assert_eq!(load, LoadState::Backlog);
        // Dropping just under the enter threshold should not exit backlog yet.
        load = next_load_state(load, 60, &config);
        assert_eq!(load, LoadState::Backlog);
        // Dropping below half the threshold does exit it.
        load = next_load_state(load, 40, &config);
        assert_eq!(load, LoadState::Normal);
    }
}
