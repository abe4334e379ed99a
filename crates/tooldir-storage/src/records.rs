//! Persistent record store: the source of truth for tool lifecycle status.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tooldir_core::{Tool, ToolQuery, ToolStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tool {0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row for tool {id}: {message}")]
    Corrupt { id: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ToolStatus,
    pub inactive_streak: u32,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    /// Applies the change; `updated_at` only moves when the status actually transitions.
    pub fn apply_to(&self, tool: &mut Tool) -> bool {
        let transitioned = tool.status != self.status;
        tool.status = self.status;
        tool.inactive_streak = self.inactive_streak;
        if transitioned {
            tool.updated_at = self.at;
        }
        transitioned
    }
}

/// What a content write did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentWrite {
    Inserted,
    Updated,
    Unchanged,
    Purged,
}

/// `incoming`'s content on top of `existing`'s lifecycle state (status, streak, creation time).
pub fn merge_content(existing: &Tool, incoming: &Tool) -> Tool {
    Tool {
        status: existing.status,
        inactive_streak: existing.inactive_streak,
        created_at: existing.created_at,
        ..incoming.clone()
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Tool>, StoreError>;

    /// Matching tools ordered by case-insensitive name, then id.
    async fn list(&self, query: &ToolQuery) -> Result<Vec<Tool>, StoreError>;

    /// Inserts a new record or replaces the content of an existing one in a single step.
    ///
    /// Status, inactive streak and creation time of an existing record are never touched,
    /// and `updated_at` only moves when the content differs. Purged ids are refused.
    async fn upsert_content(&self, tool: &Tool) -> Result<ContentWrite, StoreError>;

    async fn update_status(&self, id: &str, change: StatusChange) -> Result<Tool, StoreError>;

    /// Permanently removes the record and remembers the id so it is never re-ingested.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn is_purged(&self, id: &str) -> Result<bool, StoreError>;
}

pub fn sort_for_listing(tools: &mut [Tool]) {
    tools.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Debug, Default)]
struct MemoryState {
    tools: BTreeMap<String, Tool>,
    purged: BTreeSet<String>,
}

/// Record store used when no database is configured, and by tests.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    state: RwLock<MemoryState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_tools(tools: impl IntoIterator<Item = Tool>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write().await;
            for tool in tools {
                state.tools.insert(tool.id.clone(), tool);
            }
        }
        store
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.tools.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, id: &str) -> Result<Option<Tool>, StoreError> {
        Ok(self.state.read().await.tools.get(id).cloned())
    }

    async fn list(&self, query: &ToolQuery) -> Result<Vec<Tool>, StoreError> {
        let state = self.state.read().await;
        let mut out = state
            .tools
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect::<Vec<_>>();
        sort_for_listing(&mut out);
        Ok(out)
    }

    async fn upsert_content(&self, tool: &Tool) -> Result<ContentWrite, StoreError> {
        let mut state = self.state.write().await;
        if state.purged.contains(&tool.id) {
            return Ok(ContentWrite::Purged);
        }
        match state.tools.entry(tool.id.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(tool.clone());
                Ok(ContentWrite::Inserted)
            }
            Entry::Occupied(entry) if entry.get().same_content(tool) => Ok(ContentWrite::Unchanged),
            Entry::Occupied(mut entry) => {
                let merged = merge_content(entry.get(), tool);
                entry.insert(merged);
                Ok(ContentWrite::Updated)
            }
        }
    }

    async fn update_status(&self, id: &str, change: StatusChange) -> Result<Tool, StoreError> {
        let mut state = self.state.write().await;
        let tool = state
            .tools
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        change.apply_to(tool);
        Ok(tool.clone())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let removed = state.tools.remove(id).is_some();
        if removed {
            state.purged.insert(id.to_string());
        }
        Ok(removed)
    }

    async fn is_purged(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().await.purged.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tooldir_core::{Logo, PricingModel};

    fn tool(id: &str, name: &str, category: &str, status: ToolStatus) -> Tool {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        Tool {
            id: id.to_string(),
            name: name.to_string(),
            description: format!("{name} description"),
            short_description: String::new(),
            category: category.to_string(),
            tags: vec![],
            untranslated_tags: vec![],
            website: None,
            logo: Logo::Generated {
                initial: name[..1].to_string(),
                color: "#22c55e".into(),
            },
            pricing_model: PricingModel::Free,
            rating: None,
            review_count: 0,
            features: vec![],
            use_cases: vec![],
            status,
            inactive_streak: 0,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn list_filters_and_orders_by_name() {
        let store = InMemoryRecordStore::with_tools([
            tool("rec3", "zeta", "Writing", ToolStatus::Active),
            tool("rec1", "Alpha", "Writing", ToolStatus::Unknown),
            tool("rec2", "beta", "Video", ToolStatus::Inactive),
        ])
        .await;

        let visible = store.list(&ToolQuery::visible()).await.unwrap();
        let names = visible.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Alpha", "zeta"]);

        let inactive = store.list(&ToolQuery::with_status(ToolStatus::Inactive)).await.unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].id, "rec2");
    }

    #[tokio::test]
    async fn status_update_bumps_updated_at_only_on_transition() {
        let store = InMemoryRecordStore::with_tools([tool("rec1", "Acme", "Writing", ToolStatus::Active)]).await;
        let original = store.get("rec1").await.unwrap().unwrap();
        let later = original.updated_at + chrono::Duration::hours(1);

        let same = store
            .update_status(
                "rec1",
                StatusChange {
                    status: ToolStatus::Active,
                    inactive_streak: 0,
                    at: later,
                },
            )
            .await
            .unwrap();
        assert_eq!(same.updated_at, original.updated_at);

        let flipped = store
            .update_status(
                "rec1",
                StatusChange {
                    status: ToolStatus::Inactive,
                    inactive_streak: 1,
                    at: later,
                },
            )
            .await
            .unwrap();
        assert_eq!(flipped.status, ToolStatus::Inactive);
        assert_eq!(flipped.inactive_streak, 1);
        assert_eq!(flipped.updated_at, later);
    }

    #[tokio::test]
    async fn update_of_missing_tool_is_not_found() {
        let store = InMemoryRecordStore::new();
        let err = store
            .update_status(
                "ghost",
                StatusChange {
                    status: ToolStatus::Active,
                    inactive_streak: 0,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn content_writes_keep_lifecycle_state() {
        let store = InMemoryRecordStore::new();
        let first = tool("rec1", "Acme", "Writing", ToolStatus::Unknown);
        assert_eq!(store.upsert_content(&first).await.unwrap(), ContentWrite::Inserted);
        store
            .update_status(
                "rec1",
                StatusChange {
                    status: ToolStatus::Inactive,
                    inactive_streak: 2,
                    at: first.updated_at,
                },
            )
            .await
            .unwrap();

        let mut republished = first.clone();
        republished.updated_at = first.updated_at + chrono::Duration::hours(1);
        assert_eq!(store.upsert_content(&republished).await.unwrap(), ContentWrite::Unchanged);
        assert_eq!(store.get("rec1").await.unwrap().unwrap().updated_at, first.updated_at);

        republished.description = "Edited upstream".into();
        assert_eq!(store.upsert_content(&republished).await.unwrap(), ContentWrite::Updated);
        let stored = store.get("rec1").await.unwrap().unwrap();
        assert_eq!(stored.description, "Edited upstream");
        assert_eq!(stored.status, ToolStatus::Inactive);
        assert_eq!(stored.inactive_streak, 2);
        assert_eq!(stored.created_at, first.created_at);
        assert_eq!(stored.updated_at, republished.updated_at);
    }

    #[tokio::test]
    async fn content_writes_refuse_purged_ids() {
        let store = InMemoryRecordStore::with_tools([tool("rec1", "Acme", "Writing", ToolStatus::Inactive)]).await;
        assert!(store.delete("rec1").await.unwrap());

        let write = store
            .upsert_content(&tool("rec1", "Acme", "Writing", ToolStatus::Unknown))
            .await
            .unwrap();
        assert_eq!(write, ContentWrite::Purged);
        assert!(store.get("rec1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_records_purge() {
        let store = InMemoryRecordStore::with_tools([tool("rec1", "Acme", "Writing", ToolStatus::Inactive)]).await;
        assert!(store.delete("rec1").await.unwrap());
        assert!(!store.delete("rec1").await.unwrap());
        assert!(store.is_purged("rec1").await.unwrap());
        assert!(!store.is_purged("rec2").await.unwrap());
        assert!(store.is_empty().await);
    }
}
