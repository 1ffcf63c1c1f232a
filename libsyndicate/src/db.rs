//! Content store for Syndicate
//!
//! Durable record of content items and their per-platform publish outcomes.
//! All status transitions are single-row UPDATEs guarded by the expected
//! current status, which gives per-item serialization without an external
//! lock: of two racing writers, exactly one sees its guard match.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{ContentItem, ContentStatus, PlatformOutcome};

/// A content item joined with all its platform outcomes
#[derive(Debug, Clone)]
pub struct ItemWithOutcomes {
    pub item: ContentItem,
    pub outcomes: Vec<PlatformOutcome>,
}

/// An aggregated engagement bucket for optimal-time suggestions
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementBucket {
    pub hour: u32,
    pub weekday: u32,
    pub samples: i64,
    pub mean_engagement: f64,
}

#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
}

impl ContentStore {
    /// Open (or create) the store and run migrations.
    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = if db_path == ":memory:" {
            // Each SQLite in-memory connection is a distinct database; keep
            // the pool at a single connection so tests see one store.
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .map_err(DbError::SqlxError)?
        } else {
            let expanded_path = shellexpand::tilde(db_path).to_string();
            let path = Path::new(&expanded_path);

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }

            // mode=rwc creates the database file if it doesn't exist
            let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
            SqlitePool::connect(&db_url)
                .await
                .map_err(DbError::SqlxError)?
        };

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Shared connection pool (the queue lives in the same database).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a new content item.
    pub async fn create_item(&self, item: &ContentItem) -> Result<()> {
        let media_refs = serde_json::to_string(&item.media_refs)
            .map_err(|e| crate::SyndicateError::Validation(e.to_string()))?;
        let platforms = serde_json::to_string(&item.target_platforms)
            .map_err(|e| crate::SyndicateError::Validation(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO content_items
                (id, team_id, content, media_refs, target_platforms, status,
                 created_at, scheduled_at, posted_at, retry_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.team_id)
        .bind(&item.content)
        .bind(media_refs)
        .bind(platforms)
        .bind(item.status.as_str())
        .bind(item.created_at)
        .bind(item.scheduled_at)
        .bind(item.posted_at)
        .bind(item.retry_count)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Get a content item by ID
    pub async fn get_item(&self, id: &str) -> Result<Option<ContentItem>> {
        let row = sqlx::query(
            r#"
            SELECT id, team_id, content, media_refs, target_platforms, status,
                   created_at, scheduled_at, posted_at, retry_count
            FROM content_items WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(row_to_item))
    }

    /// Get an item with all of its platform outcomes
    pub async fn get_item_with_outcomes(&self, id: &str) -> Result<Option<ItemWithOutcomes>> {
        match self.get_item(id).await? {
            Some(item) => {
                let outcomes = self.get_outcomes(id).await?;
                Ok(Some(ItemWithOutcomes { item, outcomes }))
            }
            None => Ok(None),
        }
    }

    /// All scheduled items whose scheduled_at has elapsed.
    pub async fn list_due_scheduled(&self, now: i64) -> Result<Vec<ContentItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, team_id, content, media_refs, target_platforms, status,
                   created_at, scheduled_at, posted_at, retry_count
            FROM content_items
            WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_item).collect())
    }

    /// All scheduled items, optionally scoped to a team (for listings).
    pub async fn list_scheduled(&self, team_id: Option<&str>) -> Result<Vec<ContentItem>> {
        let rows = match team_id {
            Some(team) => {
                sqlx::query(
                    r#"
                    SELECT id, team_id, content, media_refs, target_platforms, status,
                           created_at, scheduled_at, posted_at, retry_count
                    FROM content_items
                    WHERE status = 'scheduled' AND team_id = ?
                    ORDER BY scheduled_at ASC
                    "#,
                )
                .bind(team)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, team_id, content, media_refs, target_platforms, status,
                           created_at, scheduled_at, posted_at, retry_count
                    FROM content_items
                    WHERE status = 'scheduled'
                    ORDER BY scheduled_at ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_item).collect())
    }

    /// Flip scheduled -> queued. Returns false when the item was no longer
    /// scheduled, which makes the due scan idempotent and closes the
    /// scan/cancel race: only the winner of this flip may enqueue.
    pub async fn mark_queued(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE content_items SET status = 'queued'
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Flip scheduled/queued -> dispatching. Idempotent for items already
    /// dispatching, so a publish job redelivered after a worker stall can
    /// re-claim them. Returns false when the item is in any other state.
    pub async fn mark_dispatching(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE content_items SET status = 'dispatching'
            WHERE id = ? AND status IN ('scheduled', 'queued', 'dispatching')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Unconditional status update (terminal transitions, operator actions).
    pub async fn set_status(&self, id: &str, status: ContentStatus) -> Result<()> {
        sqlx::query(r#"UPDATE content_items SET status = ? WHERE id = ?"#)
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Mark the item posted and stamp posted_at.
    pub async fn mark_posted(&self, id: &str, posted_at: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE content_items SET status = 'posted', posted_at = ? WHERE id = ?"#,
        )
        .bind(posted_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Move a scheduled item to a new time. Returns false when the item was
    /// not in the scheduled state.
    pub async fn reschedule(&self, id: &str, new_scheduled_at: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE content_items SET scheduled_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(new_scheduled_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel a scheduled item back to draft. Returns false when the item
    /// was not in the scheduled state.
    pub async fn cancel_scheduled(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE content_items SET status = 'draft', scheduled_at = NULL
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// All platform outcomes for an item
    pub async fn get_outcomes(&self, content_id: &str) -> Result<Vec<PlatformOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT id, content_id, platform, success, external_id, url, posted_at,
                   error_message, attempt_count, last_attempt_at, requires_manual_review
            FROM platform_outcomes
            WHERE content_id = ?
            ORDER BY platform ASC
            "#,
        )
        .bind(content_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_outcome).collect())
    }

    /// Record a successful publish for one platform. Successes are never
    /// rolled back by later sibling failures.
    pub async fn record_outcome_success(
        &self,
        content_id: &str,
        platform: &str,
        external_id: &str,
        url: Option<&str>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO platform_outcomes
                (content_id, platform, success, external_id, url, posted_at,
                 error_message, attempt_count, last_attempt_at, requires_manual_review)
            VALUES (?, ?, 1, ?, ?, ?, NULL, 1, ?, 0)
            ON CONFLICT(content_id, platform) DO UPDATE SET
                success = 1,
                external_id = excluded.external_id,
                url = excluded.url,
                posted_at = excluded.posted_at,
                error_message = NULL,
                attempt_count = attempt_count + 1,
                last_attempt_at = excluded.last_attempt_at
            "#,
        )
        .bind(content_id)
        .bind(platform)
        .bind(external_id)
        .bind(url)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.refresh_retry_count(content_id).await
    }

    /// Record a failed attempt for one platform and return the updated
    /// attempt count. The count is bumped before any retry decision so the
    /// decision sees it.
    pub async fn record_outcome_failure(
        &self,
        content_id: &str,
        platform: &str,
        error_message: &str,
        now: i64,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO platform_outcomes
                (content_id, platform, success, external_id, url, posted_at,
                 error_message, attempt_count, last_attempt_at, requires_manual_review)
            VALUES (?, ?, 0, NULL, NULL, NULL, ?, 1, ?, 0)
            ON CONFLICT(content_id, platform) DO UPDATE SET
                success = 0,
                error_message = excluded.error_message,
                attempt_count = attempt_count + 1,
                last_attempt_at = excluded.last_attempt_at
            "#,
        )
        .bind(content_id)
        .bind(platform)
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.refresh_retry_count(content_id).await?;

        let row = sqlx::query(
            r#"SELECT attempt_count FROM platform_outcomes WHERE content_id = ? AND platform = ?"#,
        )
        .bind(content_id)
        .bind(platform)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.get("attempt_count"))
    }

    /// Flag a platform outcome for manual review (terminal failure).
    pub async fn mark_manual_review(&self, content_id: &str, platform: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE platform_outcomes SET requires_manual_review = 1
            WHERE content_id = ? AND platform = ?
            "#,
        )
        .bind(content_id)
        .bind(platform)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Keep the display retry_count in sync (max over platforms).
    async fn refresh_retry_count(&self, content_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE content_items SET retry_count = COALESCE(
                (SELECT MAX(attempt_count) FROM platform_outcomes WHERE content_id = ?), 0)
            WHERE id = ?
            "#,
        )
        .bind(content_id)
        .bind(content_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Scheduled items for the same team within the ±window around the
    /// candidate instant. Platform overlap is filtered by the caller since
    /// target platforms are a JSON column.
    pub async fn scheduled_in_window(
        &self,
        team_id: &str,
        window_start: i64,
        window_end: i64,
        exclude_content_id: Option<&str>,
    ) -> Result<Vec<ContentItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, team_id, content, media_refs, target_platforms, status,
                   created_at, scheduled_at, posted_at, retry_count
            FROM content_items
            WHERE team_id = ? AND status = 'scheduled'
              AND scheduled_at IS NOT NULL
              AND scheduled_at >= ? AND scheduled_at <= ?
              AND id != COALESCE(?, '')
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(team_id)
        .bind(window_start)
        .bind(window_end)
        .bind(exclude_content_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_item).collect())
    }

    /// Record an engagement sample for a successful publish.
    pub async fn record_engagement(
        &self,
        team_id: &str,
        platform: &str,
        posted_hour: u32,
        posted_weekday: u32,
        engagement: f64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO engagement_samples
                (team_id, platform, posted_hour, posted_weekday, engagement, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(team_id)
        .bind(platform)
        .bind(posted_hour)
        .bind(posted_weekday)
        .bind(engagement)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Engagement buckets for a team/platform, best mean first.
    pub async fn engagement_buckets(
        &self,
        team_id: &str,
        platform: &str,
    ) -> Result<Vec<EngagementBucket>> {
        let rows = sqlx::query(
            r#"
            SELECT posted_hour, posted_weekday,
                   COUNT(*) AS samples, AVG(engagement) AS mean_engagement
            FROM engagement_samples
            WHERE team_id = ? AND platform = ?
            GROUP BY posted_hour, posted_weekday
            ORDER BY mean_engagement DESC, samples DESC
            "#,
        )
        .bind(team_id)
        .bind(platform)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .into_iter()
            .map(|r| EngagementBucket {
                hour: r.get::<i64, _>("posted_hour") as u32,
                weekday: r.get::<i64, _>("posted_weekday") as u32,
                samples: r.get("samples"),
                mean_engagement: r.get("mean_engagement"),
            })
            .collect())
    }

    /// Item counts by status for a team, for dashboards.
    pub async fn status_counts(&self, team_id: &str) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n FROM content_items
            WHERE team_id = ?
            GROUP BY status
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("status"), r.get("n")))
            .collect())
    }
}

fn row_to_item(r: sqlx::sqlite::SqliteRow) -> ContentItem {
    let media_refs: Vec<String> =
        serde_json::from_str(&r.get::<String, _>("media_refs")).unwrap_or_default();
    let target_platforms: Vec<String> =
        serde_json::from_str(&r.get::<String, _>("target_platforms")).unwrap_or_default();

    ContentItem {
        id: r.get("id"),
        team_id: r.get("team_id"),
        content: r.get("content"),
        media_refs,
        target_platforms,
        status: ContentStatus::from_str_lossy(&r.get::<String, _>("status")),
        created_at: r.get("created_at"),
        scheduled_at: r.get("scheduled_at"),
        posted_at: r.get("posted_at"),
        retry_count: r.get("retry_count"),
    }
}

fn row_to_outcome(r: sqlx::sqlite::SqliteRow) -> PlatformOutcome {
    PlatformOutcome {
        id: Some(r.get("id")),
        content_id: r.get("content_id"),
        platform: r.get("platform"),
        success: r.get::<i64, _>("success") != 0,
        external_id: r.get("external_id"),
        url: r.get("url"),
        posted_at: r.get("posted_at"),
        error_message: r.get("error_message"),
        attempt_count: r.get("attempt_count"),
        last_attempt_at: r.get("last_attempt_at"),
        requires_manual_review: r.get::<i64, _>("requires_manual_review") != 0,
    }
}
