//! Environment-driven configuration for the sync engine.

use std::path::PathBuf;
use std::time::Duration;

use tooldir_storage::{HttpClientConfig, RetryPolicy, TokenBucketConfig};

use crate::cache::CacheConfig;
use crate::lifecycle::CleanupPolicy;
use crate::probe::{ProbeConfig, BROWSER_USER_AGENT};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub content_url: Option<String>,
    pub content_token: Option<String>,
    pub content_fixture: Option<PathBuf>,
    pub content_status: Option<String>,
    pub cache_ttl: Duration,
    pub cache_stale_wait: Duration,
    pub cache_max_keys: usize,
    pub upstream_attempts: u32,
    pub upstream_base_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// Content store requests allowed back-to-back before pacing kicks in.
    pub content_rate_capacity: u32,
    pub content_rate_refill: Duration,
    pub probe_timeout: Duration,
    pub probe_batch_size: usize,
    pub probe_batch_pause: Duration,
    pub probe_attempts: u32,
    pub probe_base_delay: Duration,
    pub probe_user_agent: String,
    pub cleanup_min_inactive_probes: u32,
    pub scheduler_enabled: bool,
    pub probe_cron: String,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            content_url: None,
            content_token: None,
            content_fixture: None,
            content_status: None,
            cache_ttl: Duration::from_secs(300),
            cache_stale_wait: Duration::from_millis(1500),
            cache_max_keys: 256,
            upstream_attempts: 3,
            upstream_base_delay: Duration::from_millis(500),
            http_timeout_secs: 20,
            user_agent: "tooldir-sync/0.1".to_string(),
            content_rate_capacity: 5,
            content_rate_refill: Duration::from_millis(200),
            probe_timeout: Duration::from_secs(10),
            probe_batch_size: 10,
            probe_batch_pause: Duration::from_millis(1000),
            probe_attempts: 2,
            probe_base_delay: Duration::from_millis(1000),
            probe_user_agent: BROWSER_USER_AGENT.to_string(),
            cleanup_min_inactive_probes: 3,
            scheduler_enabled: false,
            probe_cron: "0 0 3 * * *".to_string(),
            web_port: 8000,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env_string(name).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_url: env_string("DATABASE_URL"),
            content_url: env_string("TOOLDIR_CONTENT_URL"),
            content_token: env_string("TOOLDIR_CONTENT_TOKEN"),
            content_fixture: env_string("TOOLDIR_CONTENT_FIXTURE").map(PathBuf::from),
            content_status: env_string("TOOLDIR_CONTENT_STATUS"),
            cache_ttl: env_parse("TOOLDIR_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.cache_ttl),
            cache_stale_wait: env_parse("TOOLDIR_CACHE_STALE_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.cache_stale_wait),
            cache_max_keys: env_parse("TOOLDIR_CACHE_MAX_KEYS").unwrap_or(d.cache_max_keys),
            upstream_attempts: env_parse("TOOLDIR_UPSTREAM_ATTEMPTS").unwrap_or(d.upstream_attempts),
            upstream_base_delay: env_parse("TOOLDIR_UPSTREAM_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.upstream_base_delay),
            http_timeout_secs: env_parse("TOOLDIR_HTTP_TIMEOUT_SECS").unwrap_or(d.http_timeout_secs),
            user_agent: env_string("TOOLDIR_USER_AGENT").unwrap_or(d.user_agent),
            content_rate_capacity: env_parse("TOOLDIR_CONTENT_RATE_CAPACITY").unwrap_or(d.content_rate_capacity),
            content_rate_refill: env_parse("TOOLDIR_CONTENT_RATE_REFILL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.content_rate_refill),
            probe_timeout: env_parse("TOOLDIR_PROBE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.probe_timeout),
            probe_batch_size: env_parse("TOOLDIR_PROBE_BATCH_SIZE").unwrap_or(d.probe_batch_size),
            probe_batch_pause: env_parse("TOOLDIR_PROBE_BATCH_PAUSE_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.probe_batch_pause),
            probe_attempts: env_parse("TOOLDIR_PROBE_ATTEMPTS").unwrap_or(d.probe_attempts),
            probe_base_delay: env_parse("TOOLDIR_PROBE_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.probe_base_delay),
            probe_user_agent: env_string("TOOLDIR_PROBE_USER_AGENT").unwrap_or(d.probe_user_agent),
            cleanup_min_inactive_probes: env_parse("TOOLDIR_CLEANUP_MIN_INACTIVE_PROBES")
                .unwrap_or(d.cleanup_min_inactive_probes),
            scheduler_enabled: env_flag("TOOLDIR_SCHEDULER_ENABLED").unwrap_or(d.scheduler_enabled),
            probe_cron: env_string("TOOLDIR_PROBE_CRON").unwrap_or(d.probe_cron),
            web_port: env_parse("TOOLDIR_WEB_PORT").unwrap_or(d.web_port),
            workspace_root: env_string("TOOLDIR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.workspace_root),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: self.cache_ttl,
            stale_wait: self.cache_stale_wait,
            max_keys: self.cache_max_keys.max(1),
        }
    }

    /// Fetcher settings for the content store, paced by a token bucket.
    pub fn content_http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: Some(TokenBucketConfig {
                capacity: self.content_rate_capacity.max(1),
                refill_every: self.content_rate_refill,
            }),
            ..HttpClientConfig::default()
        }
    }

    pub fn upstream_retry(&self) -> RetryPolicy {
        RetryPolicy::linear(self.upstream_attempts, self.upstream_base_delay)
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            timeout: self.probe_timeout,
            user_agent: self.probe_user_agent.clone(),
            batch_size: self.probe_batch_size,
            batch_pause: self.probe_batch_pause,
            retry: RetryPolicy::linear(self.probe_attempts, self.probe_base_delay),
            ..ProbeConfig::default()
        }
    }

    pub fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy {
            min_inactive_streak: self.cleanup_min_inactive_probes.max(1),
        }
    }

    pub fn fixture_path(&self) -> PathBuf {
        self.content_fixture
            .clone()
            .unwrap_or_else(|| self.workspace_root.join("fixtures").join("content").join("records.json"))
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}
