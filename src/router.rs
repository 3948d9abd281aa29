use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::bucket::BucketManager;
use crate::client::ClientManager;
use crate::error::Error;
use crate::gateway_util::now_ms;
use crate::instance::{InstanceHandle, InstanceSnapshot, InstanceStore};
use crate::settings::{Algorithm, Settings};
use crate::strategy::{build_strategy, AcquireOutcome, Strategy, StrategyStats};

/// Lifecycle of a strategy runtime. RETIRED runtimes are removed from the
/// registry and never observed again.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeState {
    Active,
    Draining,
    Retired,
}

const STATE_ACTIVE: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_RETIRED: u8 = 2;

/// An executing load-balancing strategy bound to one pool, with its queue
/// gate and reject counters.
pub struct StrategyRuntime {
    pub runtime_id: Uuid,
    pub pool_key: String,
    pub algorithm: Algorithm,
    pub activated_at_ms: i64,
    state: AtomicU8,
    drain_started_ms: AtomicI64,
    queue_depth: AtomicU32,
    queue_capacity: AtomicU32,
    pub reject_queue_full: AtomicU64,
    pub reject_budget: AtomicU64,
    pub reject_sampling: AtomicU64,
    pub strategy: Box<dyn Strategy>,
}

impl std::fmt::Debug for StrategyRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRuntime")
            .field("runtime_id", &self.runtime_id)
            .field("pool_key", &self.pool_key)
            .field("algorithm", &self.algorithm)
            .field("state", &self.state())
            .finish()
    }
}

impl StrategyRuntime {
    fn new(pool_key: String, settings: &Settings) -> Arc<Self> {
        let strategy = build_strategy(settings.algorithm, settings);
        let runtime = Arc::new(StrategyRuntime {
            runtime_id: Uuid::now_v7(),
            pool_key,
            algorithm: settings.algorithm,
            activated_at_ms: now_ms(),
            state: AtomicU8::new(STATE_ACTIVE),
            drain_started_ms: AtomicI64::new(0),
            queue_depth: AtomicU32::new(0),
            queue_capacity: AtomicU32::new(settings.queue_capacity),
            reject_queue_full: AtomicU64::new(0),
            reject_budget: AtomicU64::new(0),
            reject_sampling: AtomicU64::new(0),
            strategy,
        });
        runtime.strategy.on_activate();
        runtime
    }

    pub fn state(&self) -> RuntimeState {
        match self.state.load(Ordering::Acquire) {
            STATE_ACTIVE => RuntimeState::Active,
            STATE_DRAINING => RuntimeState::Draining,
            _ => RuntimeState::Retired,
        }
    }

    fn mark_draining(&self, now: i64) {
        if self
            .state
            .compare_exchange(
                STATE_ACTIVE,
                STATE_DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.drain_started_ms.store(now, Ordering::Release);
        }
    }

    fn retire(&self) {
        self.strategy.on_deactivate();
        self.state.store(STATE_RETIRED, Ordering::Release);
    }

    /// Bounded in-flight gate: admit while depth < capacity. Lock-free CAS
    /// loop; the gate never parks.
    pub fn enter_queue(&self, capacity: u32) -> bool {
        self.queue_capacity.store(capacity, Ordering::Release);
        loop {
            let depth = self.queue_depth.load(Ordering::Acquire);
            if depth >= capacity {
                return false;
            }
            if self
                .queue_depth
                .compare_exchange(depth, depth + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Decrement the in-flight depth, never below zero.
    pub fn leave_queue(&self) {
        loop {
            let depth = self.queue_depth.load(Ordering::Acquire);
            if depth == 0 {
                return;
            }
            if self
                .queue_depth
                .compare_exchange(depth, depth - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth.load(Ordering::Acquire)
    }

    pub fn queue_capacity(&self) -> u32 {
        self.queue_capacity.load(Ordering::Acquire)
    }
}

/// A successful admission: the selected instance plus the queue slot held on
/// its runtime. The slot is released exactly once, on `release` or drop,
/// so cancellation paths cannot leak it.
pub struct Admission {
    instance: Arc<InstanceHandle>,
    runtime: Arc<StrategyRuntime>,
    released: AtomicBool,
}

impl Admission {
    fn new(instance: Arc<InstanceHandle>, runtime: Arc<StrategyRuntime>) -> Self {
        instance.runtime.inflight.fetch_add(1, Ordering::AcqRel);
        Admission {
            instance,
            runtime,
            released: AtomicBool::new(false),
        }
    }

    pub fn instance(&self) -> &Arc<InstanceHandle> {
        &self.instance
    }

    pub fn pool_key(&self) -> &str {
        &self.runtime.pool_key
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.runtime.leave_queue();
            let _ = self
                .instance
                .runtime
                .inflight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.release();
    }
}

/// One admin status entry per live runtime.
#[derive(Clone, Debug, Serialize)]
pub struct RuntimeStatus {
    pub runtime_id: Uuid,
    pub pool_key: String,
    pub algorithm: Algorithm,
    pub state: RuntimeState,
    pub activated_at_ms: i64,
    pub queue_depth: u32,
    pub queue_capacity: u32,
    pub reject_queue_full: u64,
    pub reject_budget: u64,
    pub reject_sampling: u64,
    pub bucket_boundaries: Vec<u32>,
    pub bucket_weights: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain_duration_ms: Option<i64>,
    pub stats: StrategyStats,
}

#[derive(Default)]
struct Registry {
    pool_order: Vec<String>,
    by_pool: HashMap<String, Arc<StrategyRuntime>>,
}

/// Dispatches each request through the configured pools in order and manages
/// the runtime lifecycle across settings changes and instance refreshes.
pub struct Router {
    /// Serializes `update_settings` and `refresh`
    update_lock: tokio::sync::Mutex<()>,
    registry: RwLock<Arc<Registry>>,
    settings: RwLock<Arc<Settings>>,
    buckets: BucketManager,
    store: InstanceStore,
    clients: Arc<ClientManager>,
    draining: Mutex<Vec<Arc<StrategyRuntime>>>,
    shutdown: AtomicBool,
}

impl Router {
    pub async fn new(
        settings: Settings,
        store: InstanceStore,
        clients: Arc<ClientManager>,
    ) -> Result<Self, Error> {
        let settings = settings.clamped();
        let buckets = BucketManager::new(&settings);
        let registry = build_registry(&settings);
        let router = Router {
            update_lock: tokio::sync::Mutex::new(()),
            registry: RwLock::new(Arc::new(registry)),
            settings: RwLock::new(Arc::new(settings)),
            buckets,
            store,
            clients,
            draining: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        };
        if let Err(e) = router.refresh().await {
            // Startup proceeds with empty runtimes; a later refresh can
            // repopulate them
            e.log();
        }
        Ok(router)
    }

    pub fn settings(&self) -> Arc<Settings> {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish_settings(&self, settings: Settings) {
        let mut guard = match self.settings.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(settings);
    }

    fn registry_snapshot(&self) -> Arc<Registry> {
        match self.registry.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish_registry(&self, registry: Registry) {
        let mut guard = match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(registry);
    }

    /// Select an instance for a request of `estimated_tokens`, walking the
    /// pools in configured order. `None` means no pool could admit it.
    pub fn acquire(&self, estimated_tokens: u32) -> Option<Admission> {
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        let tokens = estimated_tokens.max(1);
        let settings = self.settings();
        let bucket_index = self.buckets.observe(tokens, &settings);
        let registry = self.registry_snapshot();

        for pool_key in &registry.pool_order {
            let Some(runtime) = registry.by_pool.get(pool_key) else {
                continue;
            };
            if runtime.state() != RuntimeState::Active {
                continue;
            }
            if !runtime.enter_queue(settings.queue_capacity) {
                runtime.reject_queue_full.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match runtime.strategy.acquire(tokens, bucket_index) {
                AcquireOutcome::Admitted(instance) => {
                    return Some(Admission::new(instance, runtime.clone()));
                }
                AcquireOutcome::RejectedBudget => {
                    runtime.reject_budget.fetch_add(1, Ordering::Relaxed);
                    runtime.leave_queue();
                }
                AcquireOutcome::RejectedSampling => {
                    runtime.reject_sampling.fetch_add(1, Ordering::Relaxed);
                    runtime.leave_queue();
                }
            }
        }
        None
    }

    /// Apply a new settings snapshot. A change to the algorithm or the pool
    /// ordering hot-swaps every runtime: current ones drain, fresh ones take
    /// over, and the drained ones are retired at the end of the same update.
    pub async fn update_settings(&self, new_settings: Settings) -> Result<(), Error> {
        let new_settings = new_settings.clamped();
        let _guard = self.update_lock.lock().await;

        let old_settings = self.settings();
        let structural = old_settings.algorithm != new_settings.algorithm
            || old_settings.ordered_pool_keys() != new_settings.ordered_pool_keys();
        let bucket_change = old_settings.bucket_count != new_settings.bucket_count
            || old_settings.bucket_ranges != new_settings.bucket_ranges
            || old_settings.bucket_weights != new_settings.bucket_weights
            || old_settings.max_context_k != new_settings.max_context_k;

        self.publish_settings(new_settings.clone());
        if bucket_change {
            self.buckets.apply_settings(&new_settings);
        }

        if structural {
            let now = now_ms();
            let old_registry = self.registry_snapshot();
            for runtime in old_registry.by_pool.values() {
                runtime.mark_draining(now);
            }
            self.push_draining(old_registry.by_pool.values().cloned());

            self.publish_registry(build_registry(&new_settings));
            let refresh_result = self.refresh_locked().await;
            self.cleanup_draining_runtimes();
            refresh_result
        } else {
            let registry = self.registry_snapshot();
            for runtime in registry.by_pool.values() {
                runtime.strategy.on_settings_changed(&new_settings);
            }
            Ok(())
        }
    }

    /// Reload the instance list from the store, preserving runtime counters
    /// for every instance id that survives the reload.
    pub async fn refresh(&self) -> Result<(), Error> {
        let _guard = self.update_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<(), Error> {
        let instances = self.store.load().await?;
        if instances.is_empty() {
            tracing::warn!("Instance store returned an empty list; accepting zero requests");
        }

        let registry = self.registry_snapshot();

        // Counters from every runtime, draining included
        let mut snapshots: HashMap<String, InstanceSnapshot> = HashMap::new();
        for runtime in registry.by_pool.values() {
            snapshots.extend(runtime.strategy.snapshot_metrics());
        }
        for runtime in self.draining_snapshot() {
            for (id, snapshot) in runtime.strategy.snapshot_metrics() {
                snapshots.entry(id).or_insert(snapshot);
            }
        }

        let mut groups: HashMap<String, Vec<Arc<InstanceHandle>>> = HashMap::new();
        let mut active_ids: HashSet<String> = HashSet::new();
        for config in instances {
            let pool_key = config.effective_pool_key().to_string();
            active_ids.insert(config.id.clone());
            let handle = Arc::new(InstanceHandle::new(config));
            if let Some(snapshot) = snapshots.get(&handle.config.id) {
                handle.restore(snapshot);
            }
            groups.entry(pool_key).or_default().push(handle);
        }

        for (pool_key, runtime) in &registry.by_pool {
            runtime
                .strategy
                .refresh_instances(groups.remove(pool_key).unwrap_or_default());
        }
        for (pool_key, orphans) in groups {
            tracing::warn!(
                "{} instance(s) reference pool `{pool_key}` which is not in the configured ordering",
                orphans.len()
            );
        }

        self.clients.refresh(&active_ids).await;
        Ok(())
    }

    /// Move every draining runtime to RETIRED and release its strategy
    /// resources.
    fn cleanup_draining_runtimes(&self) {
        let drained = {
            let mut guard = match self.draining.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for runtime in drained {
            tracing::info!(
                "Retiring runtime {} for pool `{}`",
                runtime.runtime_id,
                runtime.pool_key
            );
            runtime.retire();
        }
    }

    fn push_draining(&self, runtimes: impl Iterator<Item = Arc<StrategyRuntime>>) {
        let mut guard = match self.draining.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend(runtimes);
    }

    fn draining_snapshot(&self) -> Vec<Arc<StrategyRuntime>> {
        let guard = match self.draining.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    /// One status entry per live runtime (active first, then draining).
    pub fn statuses(&self) -> Vec<RuntimeStatus> {
        let boundaries = self.buckets.boundaries();
        let weights = self.buckets.weights();
        let registry = self.registry_snapshot();
        let now = now_ms();

        let mut statuses = Vec::new();
        for pool_key in &registry.pool_order {
            if let Some(runtime) = registry.by_pool.get(pool_key) {
                statuses.push(status_of(runtime, &boundaries, &weights, now));
            }
        }
        for runtime in self.draining_snapshot() {
            statuses.push(status_of(&runtime, &boundaries, &weights, now));
        }
        statuses
    }

    pub fn has_healthy_instance(&self) -> bool {
        let registry = self.registry_snapshot();
        registry
            .by_pool
            .values()
            .any(|runtime| runtime.strategy.get_stats().healthy_count > 0)
    }

    /// Stop admitting requests and dispose every connection pool.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.clients.shutdown().await;
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }
}

fn status_of(
    runtime: &Arc<StrategyRuntime>,
    boundaries: &[u32],
    weights: &[u32],
    now: i64,
) -> RuntimeStatus {
    let state = runtime.state();
    let drain_duration_ms = if state == RuntimeState::Draining {
        Some(now - runtime.drain_started_ms.load(Ordering::Acquire))
    } else {
        None
    };
    RuntimeStatus {
        runtime_id: runtime.runtime_id,
        pool_key: runtime.pool_key.clone(),
        algorithm: runtime.algorithm,
        state,
        activated_at_ms: runtime.activated_at_ms,
        queue_depth: runtime.queue_depth(),
        queue_capacity: runtime.queue_capacity(),
        reject_queue_full: runtime.reject_queue_full.load(Ordering::Relaxed),
        reject_budget: runtime.reject_budget.load(Ordering::Relaxed),
        reject_sampling: runtime.reject_sampling.load(Ordering::Relaxed),
        bucket_boundaries: boundaries.to_vec(),
        bucket_weights: weights.to_vec(),
        drain_duration_ms,
        stats: runtime.strategy.get_stats(),
    }
}

fn build_registry(settings: &Settings) -> Registry {
    let pool_order = settings.ordered_pool_keys();
    let by_pool = pool_order
        .iter()
        .map(|pool_key| {
            (
                pool_key.clone(),
                StrategyRuntime::new(pool_key.clone(), settings),
            )
        })
        .collect();
    Registry {
        pool_order,
        by_pool,
    }
}
