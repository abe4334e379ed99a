//! Per-key snapshot cache with single-flight refresh and stale serving.
//!
//! Each key owns a slot with the current snapshot, a refresh lock and a completion
//! counter. At most one refresh per key runs at a time; callers that wait on a refresh
//! take its outcome instead of starting another one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tooldir_adapters::ContentStoreError;
use tooldir_core::{CacheKey, Tool};
use tooldir_storage::StoreError;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    ContentStore(#[from] ContentStoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("catalog sync failed: {0}")]
    Sync(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("refresh of `{key}` failed and nothing is cached: {message}")]
    RefreshFailed { key: String, message: String },
}

#[async_trait]
pub trait CatalogLoader: Send + Sync {
    async fn load(&self, key: &CacheKey) -> Result<Vec<Tool>, LoadError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// How long a reader holding a stale snapshot waits for an in-flight refresh.
    pub stale_wait: Duration,
    /// Upper bound on cached keys. The least recently used idle key goes first; `all` is kept.
    pub max_keys: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            stale_wait: Duration::from_millis(1500),
            max_keys: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale,
}

#[derive(Debug, Clone)]
pub struct CacheRead {
    pub tools: Arc<Vec<Tool>>,
    pub fetched_at: DateTime<Utc>,
    pub freshness: Freshness,
}

impl CacheRead {
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub keys: usize,
    pub hits: u64,
    pub stale_served: u64,
    pub refreshes: u64,
    pub failed_refreshes: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Snapshot {
    tools: Arc<Vec<Tool>>,
    fetched_at: DateTime<Utc>,
    loaded_at: Instant,
    epoch: u64,
}

#[derive(Debug, Clone)]
enum RefreshOutcome {
    Loaded,
    Failed(String),
}

#[derive(Debug, Default)]
struct Slot {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refresh: tokio::sync::Mutex<()>,
    completed: AtomicU64,
    last_outcome: Mutex<Option<RefreshOutcome>>,
    epoch: AtomicU64,
    last_used: AtomicU64,
}

impl Slot {
    fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, snapshot: Arc<Snapshot>) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    fn finish(&self, outcome: RefreshOutcome) {
        *self.last_outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn last_outcome(&self) -> Option<RefreshOutcome> {
        self.last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    stale_served: AtomicU64,
    refreshes: AtomicU64,
    failed_refreshes: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Default)]
pub struct SyncCache {
    config: CacheConfig,
    slots: Mutex<HashMap<CacheKey, Arc<Slot>>>,
    clock: AtomicU64,
    counters: Counters,
}

impl SyncCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    fn slot(&self, key: &CacheKey) -> Arc<Slot> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(key) {
            slot.last_used.store(tick, Ordering::Relaxed);
            return slot.clone();
        }
        if slots.len() >= self.config.max_keys.max(1) {
            self.evict_one(&mut slots);
        }
        let slot = Arc::new(Slot::default());
        slot.last_used.store(tick, Ordering::Relaxed);
        slots.insert(key.clone(), slot.clone());
        slot
    }

    /// Drops the least recently used slot that is not refreshing. May leave the map over
    /// the cap while every candidate is busy.
    fn evict_one(&self, slots: &mut HashMap<CacheKey, Arc<Slot>>) {
        let victim = slots
            .iter()
            .filter(|(key, slot)| **key != CacheKey::All && slot.refresh.try_lock().is_ok())
            .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            slots.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "cache key evicted");
        }
    }

    fn existing_slot(&self, key: &CacheKey) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn freshness(&self, slot: &Slot, snapshot: &Snapshot) -> Freshness {
        if snapshot.epoch == slot.epoch.load(Ordering::SeqCst) && snapshot.loaded_at.elapsed() < self.config.ttl {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }

    fn read(&self, slot: &Slot, snapshot: &Snapshot) -> CacheRead {
        CacheRead {
            tools: snapshot.tools.clone(),
            fetched_at: snapshot.fetched_at,
            freshness: self.freshness(slot, snapshot),
        }
    }

    fn stale(&self, snapshot: &Snapshot) -> CacheRead {
        self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
        CacheRead {
            tools: snapshot.tools.clone(),
            fetched_at: snapshot.fetched_at,
            freshness: Freshness::Stale,
        }
    }

    /// Serves the key's snapshot, refreshing it through `loader` when expired or missing.
    pub async fn get(&self, key: &CacheKey, loader: &dyn CatalogLoader) -> Result<CacheRead, CacheError> {
        let slot = self.slot(key);
        let observed = slot.completed.load(Ordering::SeqCst);

        let current = slot.snapshot();
        if let Some(snapshot) = &current {
            if self.freshness(&slot, snapshot) == Freshness::Fresh {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.read(&slot, snapshot));
            }
        }

        let guard = match slot.refresh.try_lock() {
            Ok(guard) => guard,
            Err(_) => match &current {
                Some(snapshot) => match tokio::time::timeout(self.config.stale_wait, slot.refresh.lock()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        debug!(%key, "refresh still in flight; serving stale snapshot");
                        return Ok(self.stale(snapshot));
                    }
                },
                None => slot.refresh.lock().await,
            },
        };

        if slot.completed.load(Ordering::SeqCst) != observed {
            drop(guard);
            return self.completed_outcome(key, &slot);
        }
        self.refresh_locked(key, &slot, loader, guard).await
    }

    /// Reloads regardless of TTL. Joins a refresh that is already running.
    pub async fn force_refresh(&self, key: &CacheKey, loader: &dyn CatalogLoader) -> Result<CacheRead, CacheError> {
        let slot = self.slot(key);
        let observed = slot.completed.load(Ordering::SeqCst);
        let guard = slot.refresh.lock().await;
        if slot.completed.load(Ordering::SeqCst) != observed {
            drop(guard);
            return self.completed_outcome(key, &slot);
        }
        self.refresh_locked(key, &slot, loader, guard).await
    }

    /// Current snapshot without touching upstream.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheRead> {
        let slot = self.existing_slot(key)?;
        let snapshot = slot.snapshot()?;
        Some(self.read(&slot, &snapshot))
    }

    pub fn invalidate(&self, key: &CacheKey) {
        if let Some(slot) = self.existing_slot(key) {
            slot.epoch.fetch_add(1, Ordering::SeqCst);
            debug!(%key, "cache key invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.values() {
            slot.epoch.fetch_add(1, Ordering::SeqCst);
        }
        debug!(keys = slots.len(), "cache invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            keys: self.slots.lock().unwrap_or_else(PoisonError::into_inner).len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
            failed_refreshes: self.counters.failed_refreshes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    fn completed_outcome(&self, key: &CacheKey, slot: &Slot) -> Result<CacheRead, CacheError> {
        let snapshot = slot.snapshot();
        match (slot.last_outcome(), snapshot) {
            (Some(RefreshOutcome::Loaded), Some(snapshot)) => Ok(self.read(slot, &snapshot)),
            (Some(RefreshOutcome::Failed(_)), Some(snapshot)) => Ok(self.stale(&snapshot)),
            (Some(RefreshOutcome::Failed(message)), None) => Err(CacheError::RefreshFailed {
                key: key.to_string(),
                message,
            }),
            (_, _) => Err(CacheError::RefreshFailed {
                key: key.to_string(),
                message: "refresh finished without a snapshot".to_string(),
            }),
        }
    }

    async fn refresh_locked(
        &self,
        key: &CacheKey,
        slot: &Slot,
        loader: &dyn CatalogLoader,
        _guard: MutexGuard<'_, ()>,
    ) -> Result<CacheRead, CacheError> {
        let epoch = slot.epoch.load(Ordering::SeqCst);
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        match loader.load(key).await {
            Ok(tools) => {
                let snapshot = Arc::new(Snapshot {
                    tools: Arc::new(tools),
                    fetched_at: Utc::now(),
                    loaded_at: Instant::now(),
                    epoch,
                });
                slot.install(snapshot.clone());
                slot.finish(RefreshOutcome::Loaded);
                info!(
                    %key,
                    tools = snapshot.tools.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "cache refreshed"
                );
                Ok(self.read(slot, &snapshot))
            }
            Err(err) => {
                self.counters.failed_refreshes.fetch_add(1, Ordering::Relaxed);
                let message = err.to_string();
                slot.finish(RefreshOutcome::Failed(message.clone()));
                match slot.snapshot() {
                    Some(snapshot) => {
                        warn!(%key, error = %message, "refresh failed; serving stale snapshot");
                        Ok(self.stale(&snapshot))
                    }
                    None => {
                        warn!(%key, error = %message, "refresh failed with nothing cached");
                        Err(CacheError::RefreshFailed {
                            key: key.to_string(),
                            message,
                        })
                    }
                }
            }
        }
    }
}
