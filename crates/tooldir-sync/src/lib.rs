//! Sync engine: cache, catalog ingest, link-health probing, lifecycle and cleanup jobs.

pub mod cache;
pub mod config;
pub mod ingest;
pub mod job;
pub mod lifecycle;
pub mod probe;
pub mod runtime;

pub use cache::{CacheConfig, CacheError, CacheRead, CacheStats, CatalogLoader, Freshness, LoadError, SyncCache};
pub use config::SyncConfig;
pub use ingest::{CatalogIngestor, IngestReport};
pub use job::{maybe_build_scheduler, HealthCheckJob, HealthCheckSummary, SnapshotManifest, SnapshotManifestFile};
pub use lifecycle::{ApplyReport, CleanupCandidate, CleanupPolicy, CleanupReport, LifecycleManager};
pub use probe::{classify_status, looks_like_dns_failure, LinkProber, ProbeBatch, ProbeConfig, BROWSER_USER_AGENT};
pub use runtime::SyncRuntime;

pub const CRATE_NAME: &str = "tooldir-sync";
