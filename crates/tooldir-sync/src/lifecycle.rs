//! Applies probe verdicts to the record store and removes long-dead tools.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tooldir_core::{ProbeResult, Tool, ToolQuery, ToolStatus};
use tooldir_storage::{RecordStore, StatusChange, StoreError};
use tracing::{info, warn};

use crate::cache::SyncCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Consecutive inactive probes required before a tool may be deleted.
    pub min_inactive_streak: u32,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self { min_inactive_streak: 3 }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub transitions: usize,
    pub became_active: usize,
    pub became_inactive: usize,
    pub missing: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupCandidate {
    pub id: String,
    pub name: String,
    pub website: Option<String>,
    pub inactive_streak: u32,
}

impl From<&Tool> for CleanupCandidate {
    fn from(tool: &Tool) -> Self {
        Self {
            id: tool.id.clone(),
            name: tool.name.clone(),
            website: tool.website.clone(),
            inactive_streak: tool.inactive_streak,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub selected: Vec<CleanupCandidate>,
    pub deleted: usize,
    pub failed: Vec<String>,
}

pub struct LifecycleManager {
    store: Arc<dyn RecordStore>,
    cache: Option<Arc<SyncCache>>,
    policy: CleanupPolicy,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn RecordStore>, policy: CleanupPolicy) -> Self {
        Self {
            store,
            cache: None,
            policy,
        }
    }

    pub fn with_cache(mut self, cache: Arc<SyncCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    /// Persists each verdict on its own; a failing tool never blocks the rest.
    pub async fn apply_statuses(&self, results: &[ProbeResult]) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut changed = false;

        for result in results {
            let current = match self.store.get(&result.tool_id).await {
                Ok(Some(tool)) => tool,
                Ok(None) => {
                    warn!(tool_id = %result.tool_id, "probed tool no longer exists; skipping");
                    report.missing.push(result.tool_id.clone());
                    continue;
                }
                Err(err) => {
                    warn!(tool_id = %result.tool_id, error = %err, "loading tool failed; skipping");
                    report.failed.push(result.tool_id.clone());
                    continue;
                }
            };

            let status = result.proposed_status();
            let inactive_streak = match status {
                ToolStatus::Inactive => current.inactive_streak.saturating_add(1),
                _ => 0,
            };
            let change = StatusChange {
                status,
                inactive_streak,
                at: result.checked_at,
            };

            match self.store.update_status(&result.tool_id, change).await {
                Ok(_) => {
                    report.applied += 1;
                    if current.status != status {
                        report.transitions += 1;
                        match status {
                            ToolStatus::Active => report.became_active += 1,
                            ToolStatus::Inactive => report.became_inactive += 1,
                            ToolStatus::Unknown => {}
                        }
                        info!(
                            tool_id = %result.tool_id,
                            from = %current.status,
                            to = %status,
                            outcome = %result.outcome,
                            "tool status transitioned"
                        );
                    }
                    if current.status != status || current.inactive_streak != inactive_streak {
                        changed = true;
                    }
                }
                Err(StoreError::NotFound(id)) => {
                    warn!(tool_id = %id, "tool deleted while applying status; skipping");
                    report.missing.push(id);
                }
                Err(err) => {
                    warn!(tool_id = %result.tool_id, error = %err, "persisting status failed");
                    report.failed.push(result.tool_id.clone());
                }
            }
        }

        if changed {
            self.invalidate_cache();
        }
        info!(
            applied = report.applied,
            transitions = report.transitions,
            missing = report.missing.len(),
            failed = report.failed.len(),
            "probe verdicts applied"
        );
        report
    }

    pub async fn cleanup_candidates(&self) -> Result<Vec<Tool>, StoreError> {
        let inactive = self.store.list(&ToolQuery::with_status(ToolStatus::Inactive)).await?;
        Ok(inactive
            .into_iter()
            .filter(|t| t.inactive_streak >= self.policy.min_inactive_streak)
            .collect())
    }

    /// Deletion is permanent. A dry run reports the same selection and touches nothing.
    pub async fn cleanup(&self, dry_run: bool) -> Result<CleanupReport, StoreError> {
        let candidates = self.cleanup_candidates().await?;
        let mut report = CleanupReport {
            dry_run,
            selected: candidates.iter().map(CleanupCandidate::from).collect(),
            deleted: 0,
            failed: Vec::new(),
        };

        if dry_run {
            info!(selected = report.selected.len(), "cleanup dry run");
            return Ok(report);
        }

        for tool in &candidates {
            match self.store.delete(&tool.id).await {
                Ok(true) => {
                    info!(tool_id = %tool.id, name = %tool.name, "deleted inactive tool");
                    report.deleted += 1;
                }
                Ok(false) => warn!(tool_id = %tool.id, "tool already gone at deletion time"),
                Err(err) => {
                    warn!(tool_id = %tool.id, error = %err, "deleting tool failed");
                    report.failed.push(tool.id.clone());
                }
            }
        }
        if report.deleted > 0 {
            self.invalidate_cache();
        }
        info!(
            selected = report.selected.len(),
            deleted = report.deleted,
            failed = report.failed.len(),
            "cleanup finished"
        );
        Ok(report)
    }

    /// Operator override. Resets the inactive streak.
    pub async fn set_status(&self, id: &str, status: ToolStatus) -> Result<Tool, StoreError> {
        let change = StatusChange {
            status,
            inactive_streak: 0,
            at: Utc::now(),
        };
        let tool = self.store.update_status(id, change).await?;
        self.invalidate_cache();
        info!(tool_id = id, status = %status, "status set by operator");
        Ok(tool)
    }
}
