//! Catalog ingest: content store -> normalizer -> record store, and the cache loader built on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tooldir_adapters::{ContentStore, ContentStoreError, Normalizer, StatusFilter};
use tooldir_core::{CacheKey, RawRecord, Tool};
use tooldir_storage::{with_retry, ContentWrite, RecordStore, RetryPolicy};
use tracing::{info, info_span, warn, Instrument};

use crate::cache::{CatalogLoader, LoadError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub fetched: usize,
    pub invalid: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_purged: usize,
}

/// Outcome of the most recent ingest attempt.
#[derive(Debug, Clone)]
struct SyncMark {
    at: Instant,
    failure: Option<String>,
}

pub struct CatalogIngestor {
    content: Arc<dyn ContentStore>,
    normalizer: Normalizer,
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    status_filter: Option<StatusFilter>,
    max_age: Duration,
    failure_cooldown: Duration,
    gate: tokio::sync::Mutex<()>,
    attempts: AtomicU64,
    last_sync: Mutex<Option<SyncMark>>,
}

impl CatalogIngestor {
    pub fn new(content: Arc<dyn ContentStore>, normalizer: Normalizer, store: Arc<dyn RecordStore>) -> Self {
        Self {
            content,
            normalizer,
            store,
            retry: RetryPolicy::default(),
            status_filter: None,
            max_age: Duration::from_secs(300),
            failure_cooldown: Duration::from_secs(30),
            gate: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_sync: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_status_filter(mut self, filter: Option<StatusFilter>) -> Self {
        self.status_filter = filter;
        self
    }

    /// How long a successful ingest satisfies cache loads.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// How long a failed ingest is reported to cache loads before upstream is tried again.
    pub fn with_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub async fn fetch_records(&self) -> Result<Vec<RawRecord>, ContentStoreError> {
        let label = format!("content-store:{}", self.content.source_id());
        match &self.status_filter {
            Some(filter) => with_retry(&self.retry, &label, || self.content.fetch_by_status(filter)).await,
            None => with_retry(&self.retry, &label, || self.content.fetch_all()).await,
        }
    }

    /// Pulls every record and reconciles it into the record store.
    ///
    /// Lifecycle state (status, streak, creation time) stays with the record store;
    /// `updated_at` only moves when the normalized content differs. Purged ids are
    /// never brought back. Runs one at a time.
    pub async fn ingest(&self) -> Result<IngestReport, LoadError> {
        let _gate = self.gate.lock().await;
        self.ingest_locked().await
    }

    /// Ingests unless a sync succeeded within the max age. Callers that queue behind a
    /// running ingest take its outcome, and a recent failure is reported without
    /// contacting upstream until the cooldown passes.
    pub async fn ensure_synced(&self) -> Result<(), LoadError> {
        let observed = self.attempts.load(Ordering::SeqCst);
        if let Some(result) = self.recent_outcome() {
            return result;
        }
        let _gate = self.gate.lock().await;
        if self.attempts.load(Ordering::SeqCst) != observed {
            if let Some(result) = self.recent_outcome() {
                return result;
            }
        }
        self.ingest_locked().await.map(|_| ())
    }

    fn last_sync(&self) -> Option<SyncMark> {
        self.last_sync.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn recent_outcome(&self) -> Option<Result<(), LoadError>> {
        let mark = self.last_sync()?;
        let elapsed = mark.at.elapsed();
        match mark.failure {
            None if elapsed < self.max_age => Some(Ok(())),
            Some(message) if elapsed < self.failure_cooldown => Some(Err(LoadError::Sync(message))),
            _ => None,
        }
    }

    async fn ingest_locked(&self) -> Result<IngestReport, LoadError> {
        let result = self.run_ingest().await;
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(SyncMark {
            at: Instant::now(),
            failure: result.as_ref().err().map(ToString::to_string),
        });
        self.attempts.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn run_ingest(&self) -> Result<IngestReport, LoadError> {
        let span = info_span!("catalog_ingest", source = self.content.source_id());
        async {
            let records = self.fetch_records().await?;
            let observed_at = Utc::now();
            let mut report = IngestReport {
                fetched: records.len(),
                ..IngestReport::default()
            };

            for raw in &records {
                let tool = match self.normalizer.normalize(raw, observed_at) {
                    Ok(tool) => tool,
                    Err(err) => {
                        report.invalid += 1;
                        warn!(error = %err, "dropping invalid record");
                        continue;
                    }
                };
                match self.store.upsert_content(&tool).await? {
                    ContentWrite::Inserted => report.inserted += 1,
                    ContentWrite::Updated => report.updated += 1,
                    ContentWrite::Unchanged => report.unchanged += 1,
                    ContentWrite::Purged => report.skipped_purged += 1,
                }
            }

            info!(
                fetched = report.fetched,
                invalid = report.invalid,
                inserted = report.inserted,
                updated = report.updated,
                unchanged = report.unchanged,
                skipped_purged = report.skipped_purged,
                "catalog ingest complete"
            );
            Ok::<_, LoadError>(report)
        }
        .instrument(span)
        .await
    }
}

/// Every key is served from the record store; upstream is only contacted through
/// [`CatalogIngestor::ensure_synced`], so distinct keys never multiply upstream fetches.
#[async_trait]
impl CatalogLoader for CatalogIngestor {
    async fn load(&self, key: &CacheKey) -> Result<Vec<Tool>, LoadError> {
        self.ensure_synced().await?;
        Ok(self.store.list(&key.to_query()).await?)
    }
}
