//! Health-check job: probe every stored tool, apply verdicts, write a run report.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tooldir_core::{ProbeResult, ToolQuery};
use tooldir_storage::RecordStore;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::lifecycle::{ApplyReport, LifecycleManager};
use crate::probe::{LinkProber, ProbeBatch};

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub probed: usize,
    pub skipped_without_website: usize,
    pub outcome_counts: BTreeMap<String, usize>,
    pub apply: ApplyReport,
    pub reports_dir: String,
    pub snapshot_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct HealthCheckJob {
    store: Arc<dyn RecordStore>,
    prober: LinkProber,
    lifecycle: Arc<LifecycleManager>,
    reports_root: PathBuf,
}

impl HealthCheckJob {
    pub fn new(
        store: Arc<dyn RecordStore>,
        prober: LinkProber,
        lifecycle: Arc<LifecycleManager>,
        reports_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            prober,
            lifecycle,
            reports_root: reports_root.into(),
        }
    }

    pub async fn run_once(&self) -> Result<HealthCheckSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("health_check", %run_id);

        async {
            let tools = self
                .store
                .list(&ToolQuery::everything())
                .await
                .context("listing tools to probe")?;
            let batch = self.prober.probe_all(&tools).await;
            let apply = self.lifecycle.apply_statuses(&batch.results).await;
            let finished_at = Utc::now();

            let mut outcome_counts: BTreeMap<String, usize> = BTreeMap::new();
            for result in &batch.results {
                *outcome_counts.entry(result.outcome.to_string()).or_default() += 1;
            }

            let reports_dir = self.reports_root.join(run_id.to_string());
            let mut summary = HealthCheckSummary {
                run_id,
                started_at,
                finished_at,
                probed: batch.results.len(),
                skipped_without_website: batch.skipped_without_website.len(),
                outcome_counts,
                apply,
                reports_dir: reports_dir.display().to_string(),
                snapshot_manifest: String::new(),
            };

            self.write_reports(&reports_dir, &summary, &batch).await?;
            let manifest_path = export_parquet_snapshot(&reports_dir, &batch.results).await?;
            summary.snapshot_manifest = manifest_path.display().to_string();

            info!(
                probed = summary.probed,
                skipped = summary.skipped_without_website,
                transitions = summary.apply.transitions,
                reports_dir = %summary.reports_dir,
                "health check complete"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &HealthCheckSummary, batch: &ProbeBatch) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(&serde_json::json!({
            "summary": summary,
            "results": batch.results,
            "skipped_without_website": batch.skipped_without_website,
        }))
        .context("serializing link health report")?;
        fs::write(reports_dir.join("link_health.json"), json)
            .await
            .context("writing link_health.json")?;

        fs::write(reports_dir.join("link_health.md"), render_markdown(summary, batch))
            .await
            .context("writing link_health.md")?;
        Ok(())
    }
}

fn render_markdown(summary: &HealthCheckSummary, batch: &ProbeBatch) -> String {
    let mut out = format!(
        "# Link Health Report\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Probed: {}\n- Skipped (no website): {}\n- Status transitions: {} ({} became active, {} became inactive)\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.probed,
        summary.skipped_without_website,
        summary.apply.transitions,
        summary.apply.became_active,
        summary.apply.became_inactive,
    );

    out.push_str("\n## Outcomes\n");
    for (outcome, count) in &summary.outcome_counts {
        out.push_str(&format!("- {outcome}: {count}\n"));
    }

    let inactive = batch
        .results
        .iter()
        .filter(|r| r.proposed_status() == tooldir_core::ToolStatus::Inactive)
        .collect::<Vec<_>>();
    if !inactive.is_empty() {
        out.push_str("\n## Unreachable\n");
        for result in inactive {
            let status = result
                .http_status
                .map(|s| format!(" (HTTP {s})"))
                .unwrap_or_default();
            out.push_str(&format!("- `{}` {}: {}{}\n", result.tool_id, result.url, result.outcome, status));
        }
    }
    if !summary.apply.missing.is_empty() || !summary.apply.failed.is_empty() {
        out.push_str("\n## Not applied\n");
        for id in &summary.apply.missing {
            out.push_str(&format!("- `{id}`: missing\n"));
        }
        for id in &summary.apply.failed {
            out.push_str(&format!("- `{id}`: store error\n"));
        }
    }
    out
}

async fn export_parquet_snapshot(reports_dir: &Path, results: &[ProbeResult]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let results_path = snapshot_dir.join("probe_results.parquet");
    write_probe_results_parquet(&results_path, results)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("link_health_json", reports_dir, &reports_dir.join("link_health.json"))?,
            manifest_entry("link_health_md", reports_dir, &reports_dir.join("link_health.md"))?,
            manifest_entry("probe_results", reports_dir, &results_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_probe_results_parquet(path: &Path, results: &[ProbeResult]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("tool_id", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("outcome", DataType::Utf8, false),
        ArrowField::new("http_status", DataType::UInt32, true),
        ArrowField::new("proposed_status", DataType::Utf8, false),
        ArrowField::new("checked_at", DataType::Utf8, false),
        ArrowField::new("attempts", DataType::UInt32, false),
    ]));

    let tool_ids = StringArray::from(results.iter().map(|r| Some(r.tool_id.as_str())).collect::<Vec<_>>());
    let urls = StringArray::from(results.iter().map(|r| Some(r.url.as_str())).collect::<Vec<_>>());
    let outcomes = StringArray::from(results.iter().map(|r| Some(r.outcome.as_str())).collect::<Vec<_>>());
    let http_statuses = UInt32Array::from(
        results
            .iter()
            .map(|r| r.http_status.map(u32::from))
            .collect::<Vec<_>>(),
    );
    let proposed = StringArray::from(
        results
            .iter()
            .map(|r| Some(r.proposed_status().as_str()))
            .collect::<Vec<_>>(),
    );
    let checked_at = StringArray::from(
        results
            .iter()
            .map(|r| Some(r.checked_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let attempts = UInt32Array::from(results.iter().map(|r| r.attempts).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(tool_ids),
            Arc::new(urls),
            Arc::new(outcomes),
            Arc::new(http_statuses),
            Arc::new(proposed),
            Arc::new(checked_at),
            Arc::new(attempts),
        ],
    )
    .context("building probe_results record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Cron-driven health checks. `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(config: &SyncConfig, job: Arc<HealthCheckJob>) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.probe_cron.as_str();
    let scheduled = Job::new_async(cron, move |_uuid, _l| {
        let job = job.clone();
        Box::pin(async move {
            if let Err(err) = job.run_once().await {
                error!(error = %format!("{err:#}"), "scheduled health check failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(scheduled).await.context("adding scheduler job")?;
    info!(cron, "health check scheduled");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use tooldir_core::ToolStatus;
    use tooldir_storage::{InMemoryRecordStore, RetryPolicy};

    use crate::lifecycle::CleanupPolicy;
    use crate::probe::ProbeConfig;
    use crate::test_support::tool_with_website;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fast_prober() -> LinkProber {
        LinkProber::new(ProbeConfig {
            timeout: Duration::from_millis(500),
            batch_pause: Duration::ZERO,
            retry: RetryPolicy::linear(1, Duration::from_millis(1)),
            ..ProbeConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn run_once_applies_verdicts_and_writes_report_bundle() {
        let base = serve(
            Router::new()
                .route("/", get(|| async { "home" }))
                .route("/gone", get(|| async { StatusCode::NOT_FOUND })),
        )
        .await;
        let store: Arc<dyn RecordStore> = Arc::new(
            InMemoryRecordStore::with_tools([
                tool_with_website("rec1", "Alive", Some(&format!("{base}/"))),
                tool_with_website("rec2", "Gone", Some(&format!("{base}/gone"))),
                tool_with_website("rec3", "Offline", None),
            ])
            .await,
        );
        let lifecycle = Arc::new(LifecycleManager::new(store.clone(), CleanupPolicy { min_inactive_streak: 1 }));
        let dir = tempfile::tempdir().unwrap();
        let job = HealthCheckJob::new(store.clone(), fast_prober(), lifecycle.clone(), dir.path().join("reports"));

        let summary = job.run_once().await.unwrap();

        assert_eq!(summary.probed, 2);
        assert_eq!(summary.skipped_without_website, 1);
        assert_eq!(summary.outcome_counts.get("reachable"), Some(&1));
        assert_eq!(summary.outcome_counts.get("not_found"), Some(&1));
        assert_eq!(store.get("rec1").await.unwrap().unwrap().status, ToolStatus::Active);
        assert_eq!(store.get("rec2").await.unwrap().unwrap().status, ToolStatus::Inactive);
        assert_eq!(store.get("rec3").await.unwrap().unwrap().status, ToolStatus::Unknown);

        let reports_dir = PathBuf::from(&summary.reports_dir);
        let markdown = std::fs::read_to_string(reports_dir.join("link_health.md")).unwrap();
        assert!(markdown.contains("not_found"));
        assert!(markdown.contains("`rec2`"));

        let report: serde_json::Value =
            serde_json::from_slice(&std::fs::read(reports_dir.join("link_health.json")).unwrap()).unwrap();
        assert_eq!(report["results"].as_array().unwrap().len(), 2);
        assert_eq!(report["skipped_without_website"][0], "rec3");

        let parquet_path = reports_dir.join("snapshots").join("probe_results.parquet");
        let reader = SerializedFileReader::new(File::open(&parquet_path).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&summary.snapshot_manifest).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 3);
        assert!(files
            .iter()
            .all(|f| f["sha256"].as_str().map(|h| h.len() == 64).unwrap_or(false)));
        assert_eq!(files[2]["path"], "snapshots/probe_results.parquet");

        let cleanup = lifecycle.cleanup(false).await.unwrap();
        assert_eq!(cleanup.deleted, 1);
        assert!(store.get("rec2").await.unwrap().is_none());
        assert!(store.get("rec3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let lifecycle = Arc::new(LifecycleManager::new(store.clone(), CleanupPolicy::default()));
        let job = Arc::new(HealthCheckJob::new(store, fast_prober(), lifecycle, "reports"));
        let config = SyncConfig::default();
        assert!(maybe_build_scheduler(&config, job).await.unwrap().is_none());
    }

    #[test]
    fn markdown_lists_unreachable_tools_with_status_codes() {
        let results = vec![ProbeResult {
            tool_id: "rec9".into(),
            url: "https://gone.example".into(),
            outcome: tooldir_core::ProbeOutcome::ServerError,
            http_status: Some(502),
            checked_at: Utc::now(),
            attempts: 2,
        }];
        let summary = HealthCheckSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            probed: 1,
            skipped_without_website: 0,
            outcome_counts: BTreeMap::from([("server_error".to_string(), 1)]),
            apply: ApplyReport::default(),
            reports_dir: String::new(),
            snapshot_manifest: String::new(),
        };
        let batch = ProbeBatch {
            results,
            skipped_without_website: vec![],
        };
        let md = render_markdown(&summary, &batch);
        assert!(md.contains("- server_error: 1"));
        assert!(md.contains("`rec9` https://gone.example: server_error (HTTP 502)"));
    }
}
