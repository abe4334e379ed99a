//! Link-health prober: HEAD-then-GET liveness checks in paced, bounded batches.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use tokio::task::JoinSet;
use tooldir_core::{ProbeOutcome, ProbeResult, Tool};
use tooldir_storage::{retry_counted, FetchError, HttpClientConfig, HttpFetcher, RetryPolicy};
use tracing::{debug, error, info, info_span, Instrument};

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
    pub per_host_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: BROWSER_USER_AGENT.to_string(),
            batch_size: 10,
            batch_pause: Duration::from_secs(1),
            max_redirects: 5,
            max_body_bytes: 64 * 1024,
            per_host_concurrency: 2,
            retry: RetryPolicy::linear(2, Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeBatch {
    pub results: Vec<ProbeResult>,
    pub skipped_without_website: Vec<String>,
}

/// What one attempt saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    outcome: ProbeOutcome,
    http_status: Option<u16>,
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "{} (HTTP {status})", self.outcome),
            None => write!(f, "{}", self.outcome),
        }
    }
}

/// Outcomes that may clear up on a second look.
pub fn is_transient(outcome: ProbeOutcome) -> bool {
    matches!(
        outcome,
        ProbeOutcome::ServerError | ProbeOutcome::Timeout | ProbeOutcome::DnsError | ProbeOutcome::Unknown
    )
}

fn same_location(requested: &str, final_url: &str) -> bool {
    match (Url::parse(requested), Url::parse(final_url)) {
        (Ok(a), Ok(b)) => a.as_str().trim_end_matches('/') == b.as_str().trim_end_matches('/'),
        _ => requested.trim_end_matches('/') == final_url.trim_end_matches('/'),
    }
}

pub fn classify_status(status: u16, requested: &str, final_url: &str) -> ProbeOutcome {
    match status {
        200..=299 if same_location(requested, final_url) => ProbeOutcome::Reachable,
        200..=399 => ProbeOutcome::Redirected,
        404 | 410 => ProbeOutcome::NotFound,
        400..=499 => ProbeOutcome::Blocked,
        500..=599 => ProbeOutcome::ServerError,
        _ => ProbeOutcome::Unknown,
    }
}

pub fn looks_like_dns_failure(error_text: &str) -> bool {
    let text = error_text.to_ascii_lowercase();
    [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
    ]
    .iter()
    .any(|needle| text.contains(needle))
}

pub fn classify_transport_error(err: &FetchError) -> ProbeOutcome {
    if err.is_timeout() {
        ProbeOutcome::Timeout
    } else if looks_like_dns_failure(&err.chain_text()) {
        ProbeOutcome::DnsError
    } else {
        ProbeOutcome::Unknown
    }
}

fn host_partition(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_else(|| "unparseable-host".to_string())
}

#[derive(Debug, Clone)]
pub struct LinkProber {
    fetcher: Arc<HttpFetcher>,
    config: ProbeConfig,
}

impl LinkProber {
    pub fn new(config: ProbeConfig) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: config.batch_size.max(1),
            per_partition_concurrency: config.per_host_concurrency.max(1),
            max_redirects: config.max_redirects,
            max_body_bytes: config.max_body_bytes,
            token_bucket: None,
        })?;
        Ok(Self {
            fetcher: Arc::new(fetcher),
            config,
        })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probes every tool that has a website. Results come back in input order.
    pub async fn probe_all(&self, tools: &[Tool]) -> ProbeBatch {
        let mut batch = ProbeBatch::default();
        let mut targets = Vec::new();
        for tool in tools {
            match tool.website.as_deref().map(str::trim).filter(|w| !w.is_empty()) {
                Some(url) => targets.push((tool.id.clone(), url.to_string())),
                None => batch.skipped_without_website.push(tool.id.clone()),
            }
        }

        let batch_size = self.config.batch_size.max(1);
        let chunks = targets.chunks(batch_size).collect::<Vec<_>>();
        let span = info_span!("probe_all", targets = targets.len(), batches = chunks.len());
        async {
            for (batch_no, chunk) in chunks.iter().enumerate() {
                if batch_no > 0 && !self.config.batch_pause.is_zero() {
                    tokio::time::sleep(self.config.batch_pause).await;
                }
                let mut set = JoinSet::new();
                for (idx, (tool_id, url)) in chunk.iter().enumerate() {
                    let prober = self.clone();
                    let (tool_id, url) = (tool_id.clone(), url.clone());
                    set.spawn(async move { (idx, prober.probe_one(&tool_id, &url).await) });
                }

                let mut finished = Vec::with_capacity(chunk.len());
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok(pair) => finished.push(pair),
                        Err(err) => error!(error = %err, "probe task failed; tool left untouched"),
                    }
                }
                finished.sort_by_key(|(idx, _)| *idx);
                batch.results.extend(finished.into_iter().map(|(_, result)| result));
                debug!(batch_no, size = chunk.len(), "probe batch done");
            }
        }
        .instrument(span)
        .await;

        info!(
            probed = batch.results.len(),
            skipped_without_website = batch.skipped_without_website.len(),
            "probe run complete"
        );
        batch
    }

    pub async fn probe_one(&self, tool_id: &str, url: &str) -> ProbeResult {
        let attempted = retry_counted(
            &self.config.retry,
            "probe",
            || self.attempt(url),
            |_: &Observation| true,
        )
        .await;
        let observation = match attempted.result {
            Ok(observation) | Err(observation) => observation,
        };
        debug!(tool_id, url, outcome = %observation, attempts = attempted.attempts, "probed");
        ProbeResult {
            tool_id: tool_id.to_string(),
            url: url.to_string(),
            outcome: observation.outcome,
            http_status: observation.http_status,
            checked_at: Utc::now(),
            attempts: attempted.attempts,
        }
    }

    /// `Err` carries observations worth another attempt.
    async fn attempt(&self, url: &str) -> Result<Observation, Observation> {
        let partition = host_partition(url);
        let observation = match self.fetcher.request(&partition, Method::HEAD, url, None).await {
            Ok(resp) if resp.status.is_success() || resp.status.is_redirection() => observe(url, resp.status, &resp.final_url),
            _ => match self.fetcher.request(&partition, Method::GET, url, None).await {
                Ok(resp) => observe(url, resp.status, &resp.final_url),
                Err(err) => Observation {
                    outcome: classify_transport_error(&err),
                    http_status: None,
                },
            },
        };
        if is_transient(observation.outcome) {
            Err(observation)
        } else {
            Ok(observation)
        }
    }
}

fn observe(url: &str, status: StatusCode, final_url: &str) -> Observation {
    Observation {
        outcome: classify_status(status.as_u16(), url, final_url),
        http_status: Some(status.as_u16()),
    }
}
