//! Wires stores, cache, ingestor, lifecycle manager and health-check job from config.

use std::sync::Arc;

use anyhow::{Context, Result};
use tooldir_adapters::{
    ContentStore, ContentStoreConfig, FixtureContentStore, HttpContentStore, Normalizer, RuleSet, StatusFilter,
    CONTENT_STORE_PARTITION,
};
use tooldir_core::{CacheKey, ToolStatus};
use tooldir_storage::{HttpFetcher, InMemoryRecordStore, PgRecordStore, RecordStore};
use tracing::{info, warn};

use crate::cache::{CacheError, CacheRead, SyncCache};
use crate::config::SyncConfig;
use crate::ingest::{CatalogIngestor, IngestReport};
use crate::job::{HealthCheckJob, HealthCheckSummary};
use crate::lifecycle::{CleanupReport, LifecycleManager};
use crate::probe::LinkProber;

/// Everything a long-running service or a one-shot CLI command needs.
#[derive(Clone)]
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub store: Arc<dyn RecordStore>,
    pub pg: Option<Arc<PgRecordStore>>,
    pub cache: Arc<SyncCache>,
    pub ingestor: Arc<CatalogIngestor>,
    pub lifecycle: Arc<LifecycleManager>,
    pub health_job: Arc<HealthCheckJob>,
}

impl SyncRuntime {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let (store, pg): (Arc<dyn RecordStore>, Option<Arc<PgRecordStore>>) = match &config.database_url {
            Some(url) => {
                let pg = Arc::new(PgRecordStore::connect(url).await?);
                pg.migrate().await.context("applying record store migrations")?;
                info!("using postgres record store");
                (pg.clone(), Some(pg))
            }
            None => {
                info!("DATABASE_URL not set; using in-memory record store");
                (Arc::new(InMemoryRecordStore::new()), None)
            }
        };

        let content: Arc<dyn ContentStore> = match &config.content_url {
            Some(base_url) => {
                let fetcher = HttpFetcher::new(config.content_http_config())?;
                info!(
                    base_url = %base_url,
                    partition = CONTENT_STORE_PARTITION,
                    rate_capacity = config.content_rate_capacity,
                    rate_refill_ms = config.content_rate_refill.as_millis() as u64,
                    "using http content store"
                );
                Arc::new(HttpContentStore::new(
                    ContentStoreConfig {
                        base_url: base_url.clone(),
                        token: config.content_token.clone(),
                        ..ContentStoreConfig::default()
                    },
                    Arc::new(fetcher),
                ))
            }
            None => {
                let path = config.fixture_path();
                info!(path = %path.display(), "using fixture content store");
                Arc::new(FixtureContentStore::new(path))
            }
        };

        let rules = RuleSet::from_workspace_root(&config.workspace_root)?;
        let prober = LinkProber::new(config.probe_config())?;
        let mut runtime = Self::from_parts(config, store, content, Normalizer::new(rules), prober);
        runtime.pg = pg;
        Ok(runtime)
    }

    pub fn from_parts(
        config: SyncConfig,
        store: Arc<dyn RecordStore>,
        content: Arc<dyn ContentStore>,
        normalizer: Normalizer,
        prober: LinkProber,
    ) -> Self {
        let cache = Arc::new(SyncCache::new(config.cache_config()));
        let ingestor = Arc::new(
            CatalogIngestor::new(content, normalizer, store.clone())
                .with_retry_policy(config.upstream_retry())
                .with_max_age(config.cache_ttl)
                .with_status_filter(config.content_status.as_deref().map(StatusFilter::new)),
        );
        let lifecycle = Arc::new(
            LifecycleManager::new(store.clone(), config.cleanup_policy()).with_cache(cache.clone()),
        );
        let health_job = Arc::new(HealthCheckJob::new(
            store.clone(),
            prober,
            lifecycle.clone(),
            config.reports_root(),
        ));
        Self {
            config,
            store,
            pg: None,
            cache,
            ingestor,
            lifecycle,
            health_job,
        }
    }

    /// Reads through the cache. A miss lists from the record store after at most one
    /// shared upstream sync.
    pub async fn read(&self, key: &CacheKey) -> Result<CacheRead, CacheError> {
        self.cache.get(key, self.ingestor.as_ref()).await
    }

    /// Syncs from upstream, then reloads the key. A failed sync leaves the cache serving
    /// its previous snapshot.
    pub async fn refresh(&self, key: &CacheKey) -> Result<CacheRead, CacheError> {
        match self.ingestor.ingest().await {
            Ok(_) => self.cache.invalidate_all(),
            Err(err) => warn!(%key, error = %err, "sync before forced refresh failed"),
        }
        self.cache.force_refresh(key, self.ingestor.as_ref()).await
    }

    /// Maps a requested category (canonical name or alias, any case) onto the canonical
    /// name the catalog stores. Unmapped names land in the fallback category, as they do
    /// during normalization.
    pub fn canonical_category(&self, requested: &str) -> String {
        self.ingestor
            .normalizer()
            .resolve_category(&[requested.trim().to_string()])
    }

    pub async fn sync_once(&self) -> Result<IngestReport> {
        let report = self.ingestor.ingest().await.context("syncing catalog from content store")?;
        self.cache.invalidate_all();
        Ok(report)
    }

    pub async fn probe_once(&self) -> Result<HealthCheckSummary> {
        self.health_job.run_once().await
    }

    pub async fn cleanup(&self, dry_run: bool) -> Result<CleanupReport> {
        self.lifecycle.cleanup(dry_run).await.context("running cleanup")
    }

    pub async fn set_status(&self, id: &str, status: ToolStatus) -> Result<tooldir_core::Tool> {
        self.lifecycle
            .set_status(id, status)
            .await
            .with_context(|| format!("setting status of {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use tooldir_core::ToolQuery;

    use crate::probe::ProbeConfig;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    async fn fixture_runtime() -> SyncRuntime {
        let config = SyncConfig {
            workspace_root: workspace_root(),
            ..SyncConfig::default()
        };
        let content: Arc<dyn ContentStore> = Arc::new(FixtureContentStore::new(config.fixture_path()));
        let rules = RuleSet::from_workspace_root(&config.workspace_root).unwrap();
        let prober = LinkProber::new(ProbeConfig::default()).unwrap();
        SyncRuntime::from_parts(
            config,
            Arc::new(InMemoryRecordStore::new()),
            content,
            Normalizer::new(rules),
            prober,
        )
    }

    #[tokio::test]
    async fn first_read_populates_store_and_cache_from_fixture() {
        let runtime = fixture_runtime().await;

        let read = runtime.read(&CacheKey::All).await.unwrap();
        assert!(!read.is_stale());
        let names = read.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
        assert!(names.contains(&"ChatGPT"));

        let writing = runtime.read(&CacheKey::category("Writing")).await.unwrap();
        assert!(writing.tools.iter().all(|t| t.category == "Writing"));
        assert!(!writing.tools.is_empty());

        let everything = runtime.store.list(&ToolQuery::everything()).await.unwrap();
        assert!(everything.iter().all(|t| !t.name.trim().is_empty()));
    }

    #[tokio::test]
    async fn operator_status_change_shows_up_in_next_read() {
        let runtime = fixture_runtime().await;
        let before = runtime.read(&CacheKey::All).await.unwrap();
        let victim = before.tools[0].id.clone();

        runtime.set_status(&victim, ToolStatus::Inactive).await.unwrap();

        let after = runtime.read(&CacheKey::All).await.unwrap();
        assert!(after.tools.iter().all(|t| t.id != victim));
    }

    #[tokio::test]
    async fn category_aliases_resolve_to_canonical_names() {
        let runtime = fixture_runtime().await;
        assert_eq!(runtime.canonical_category("写作"), "Writing");
        assert_eq!(runtime.canonical_category(" writing "), "Writing");
        assert_eq!(runtime.canonical_category("Gardening"), tooldir_core::CATEGORY_OTHER);
    }

    #[tokio::test]
    async fn sync_once_reports_reconcile_counts() {
        let runtime = fixture_runtime().await;
        let first = runtime.sync_once().await.unwrap();
        assert!(first.inserted > 0);
        let second = runtime.sync_once().await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.unchanged, first.inserted);
    }
}
