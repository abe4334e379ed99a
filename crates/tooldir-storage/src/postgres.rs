//! Postgres-backed record store.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tooldir_core::{Tool, ToolQuery, ToolStatus};
use tracing::info;

use crate::records::{merge_content, ContentWrite, RecordStore, StatusChange, StoreError};

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to record store database")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("record store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn row_to_tool(row: &PgRow) -> Result<Tool, StoreError> {
    let id: String = row.try_get("id")?;
    let data: serde_json::Value = row.try_get("data")?;
    let mut tool: Tool = serde_json::from_value(data).map_err(|e| StoreError::Corrupt {
        id: id.clone(),
        message: e.to_string(),
    })?;

    let status: String = row.try_get("status")?;
    tool.status = status.parse().map_err(|e: tooldir_core::UnknownVariant| StoreError::Corrupt {
        id: id.clone(),
        message: e.to_string(),
    })?;
    let streak: i32 = row.try_get("inactive_streak")?;
    tool.inactive_streak = u32::try_from(streak).unwrap_or(0);
    tool.created_at = row.try_get::<DateTime<Utc>, _>("created_at")?;
    tool.updated_at = row.try_get::<DateTime<Utc>, _>("updated_at")?;
    tool.id = id;
    Ok(tool)
}

async fn is_purged_in(conn: &mut PgConnection, id: &str) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 AS hit FROM purged_tools WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(row.is_some())
}

fn tool_json(tool: &Tool) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(tool).map_err(|e| StoreError::Corrupt {
        id: tool.id.clone(),
        message: e.to_string(),
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get(&self, id: &str) -> Result<Option<Tool>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, status, inactive_streak, data, created_at, updated_at
              FROM tools
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_tool).transpose()
    }

    async fn list(&self, query: &ToolQuery) -> Result<Vec<Tool>, StoreError> {
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(&s.to_lowercase())));
        let rows = sqlx::query(
            r#"
            SELECT id, status, inactive_streak, data, created_at, updated_at
              FROM tools
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR status <> $2)
               AND ($3::text IS NULL OR lower(category) = lower($3))
               AND ($4::text IS NULL
                    OR lower(name) LIKE $4 ESCAPE '\'
                    OR lower(data->>'description') LIKE $4 ESCAPE '\'
                    OR lower(data->>'short_description') LIKE $4 ESCAPE '\'
                    OR lower(data->>'tags') LIKE $4 ESCAPE '\')
             ORDER BY lower(name), id
            "#,
        )
        .bind(query.status.map(|s| s.as_str().to_string()))
        .bind(query.exclude_status.map(|s| s.as_str().to_string()))
        .bind(query.category.as_deref().map(str::trim))
        .bind(search)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_tool).collect()
    }

    async fn upsert_content(&self, tool: &Tool) -> Result<ContentWrite, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT id, status, inactive_streak, data, created_at, updated_at
              FROM tools
             WHERE id = $1
               FOR UPDATE
            "#,
        )
        .bind(&tool.id)
        .fetch_optional(&mut *tx)
        .await?;

        let write = match row {
            Some(row) => {
                let existing = row_to_tool(&row)?;
                if existing.same_content(tool) {
                    ContentWrite::Unchanged
                } else {
                    let merged = merge_content(&existing, tool);
                    sqlx::query(
                        r#"
                        UPDATE tools
                           SET name = $2,
                               category = $3,
                               data = $4,
                               updated_at = $5
                         WHERE id = $1
                        "#,
                    )
                    .bind(&merged.id)
                    .bind(&merged.name)
                    .bind(&merged.category)
                    .bind(tool_json(&merged)?)
                    .bind(merged.updated_at)
                    .execute(&mut *tx)
                    .await?;
                    ContentWrite::Updated
                }
            }
            None => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO tools (id, name, category, status, inactive_streak, data, created_at, updated_at)
                    SELECT $1, $2, $3, $4, $5, $6, $7, $8
                     WHERE NOT EXISTS (SELECT 1 FROM purged_tools WHERE id = $1)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(&tool.id)
                .bind(&tool.name)
                .bind(&tool.category)
                .bind(tool.status.as_str())
                .bind(i32::try_from(tool.inactive_streak).unwrap_or(i32::MAX))
                .bind(tool_json(tool)?)
                .bind(tool.created_at)
                .bind(tool.updated_at)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    > 0;
                if inserted {
                    ContentWrite::Inserted
                } else if is_purged_in(&mut tx, &tool.id).await? {
                    ContentWrite::Purged
                } else {
                    // Another writer inserted the same id first.
                    ContentWrite::Unchanged
                }
            }
        };
        tx.commit().await?;
        Ok(write)
    }

    async fn update_status(&self, id: &str, change: StatusChange) -> Result<Tool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT id, status, inactive_streak, data, created_at, updated_at
              FROM tools
             WHERE id = $1
               FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut tool = row_to_tool(&row)?;
        change.apply_to(&mut tool);

        sqlx::query(
            r#"
            UPDATE tools
               SET status = $2,
                   inactive_streak = $3,
                   data = $4,
                   updated_at = $5
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(tool.status.as_str())
        .bind(i32::try_from(tool.inactive_streak).unwrap_or(i32::MAX))
        .bind(tool_json(&tool)?)
        .bind(tool.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(tool)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM tools WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        if deleted {
            sqlx::query("INSERT INTO purged_tools (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn is_purged(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        is_purged_in(&mut conn, id).await
    }
}
