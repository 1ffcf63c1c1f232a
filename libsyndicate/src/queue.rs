//! Durable work queue
//!
//! Priority- and delay-aware job list shared with the content store's
//! database. Workers claim entries through short leases; a leased entry that
//! outlives its lease is returned to waiting exactly once, then failed with
//! reason `stalled`. Recurring work is driven by an explicit ticker task
//! owned by the caller, with a start/stop lifecycle instead of cron strings.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DbError, Result, SyndicateError};
use crate::types::{JobKind, JobPayload, QueueEntry, QueueState, QueueStats};

/// Options accepted by [`Queue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Earliest instant the job may be dispatched (unix seconds); defaults to now
    pub not_before: Option<i64>,
    /// Higher values dispatch first among ready entries
    pub priority: i64,
    /// Delivery cap: the entry is claimed at most this many times, then
    /// failed with reason `attempts exhausted`. The default of 2 covers the
    /// initial delivery plus the single stall redelivery.
    pub max_attempts: i64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            not_before: None,
            priority: 0,
            max_attempts: 2,
        }
    }
}

impl EnqueueOptions {
    pub fn delayed_until(not_before: i64) -> Self {
        Self {
            not_before: Some(not_before),
            ..Default::default()
        }
    }

    pub fn with_priority(priority: i64) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
    /// Seconds a claimed job may run before its lease expires
    lease_timeout_secs: i64,
}

impl Queue {
    pub fn new(pool: SqlitePool, lease_timeout_secs: u64) -> Self {
        Self {
            pool,
            lease_timeout_secs: lease_timeout_secs as i64,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Enqueue a job. Fails with a validation error when the payload lacks
    /// the identity fields its kind requires. Publish jobs are deduplicated
    /// per content id while one is still waiting (idempotent enqueue).
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: &JobPayload,
        options: EnqueueOptions,
    ) -> Result<String> {
        match kind {
            JobKind::Publish => {
                if payload.content_id.is_none() {
                    return Err(SyndicateError::Validation(
                        "publish job payload requires content_id".to_string(),
                    ));
                }
            }
            JobKind::Retry => {
                if payload.content_id.is_none() || payload.platform.is_none() {
                    return Err(SyndicateError::Validation(
                        "retry job payload requires content_id and platform".to_string(),
                    ));
                }
            }
            JobKind::RecurringScan => {}
        }

        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let not_before = options.not_before.unwrap_or(now);
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| SyndicateError::Validation(e.to_string()))?;

        // INSERT OR IGNORE defers to the partial unique index on waiting
        // publish jobs; a duplicate enqueue resolves to the existing entry.
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_entries
                (id, kind, payload, not_before, priority, attempts_made,
                 max_attempts, state, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, 'waiting', ?)
            "#,
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(&payload_json)
        .bind(not_before)
        .bind(options.priority)
        .bind(options.max_attempts)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            let existing = sqlx::query(
                r#"
                SELECT id FROM queue_entries
                WHERE kind = ? AND state = 'waiting'
                  AND json_extract(payload, '$.content_id') = json_extract(?, '$.content_id')
                "#,
            )
            .bind(kind.as_str())
            .bind(&payload_json)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

            let existing_id: String = existing.get("id");
            debug!(job = %existing_id, "publish job already waiting, enqueue deduplicated");
            return Ok(existing_id);
        }

        Ok(id)
    }

    /// Claim up to `concurrency_limit` ready jobs of the given kind.
    ///
    /// Never returns a job whose not_before is in the future, and counts
    /// live leases of the same kind against the limit. Each claim is an
    /// atomic guarded UPDATE, so concurrent workers cannot double-claim.
    pub async fn dequeue(&self, kind: JobKind, concurrency_limit: usize) -> Result<Vec<QueueEntry>> {
        let now = chrono::Utc::now().timestamp();

        let leased: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM queue_entries
            WHERE kind = ? AND state = 'leased' AND leased_until > ?
            "#,
        )
        .bind(kind.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?
        .get("n");

        let available = (concurrency_limit as i64 - leased).max(0) as usize;
        if available == 0 {
            return Ok(Vec::new());
        }

        let candidates = sqlx::query(
            r#"
            SELECT id FROM queue_entries
            WHERE kind = ? AND state = 'waiting' AND not_before <= ?
              AND attempts_made < max_attempts
            ORDER BY priority DESC, not_before ASC
            LIMIT ?
            "#,
        )
        .bind(kind.as_str())
        .bind(now)
        .bind(available as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut claimed = Vec::new();
        for row in candidates {
            let id: String = row.get("id");
            let result = sqlx::query(
                r#"
                UPDATE queue_entries
                SET state = 'leased', leased_until = ?, attempts_made = attempts_made + 1
                WHERE id = ? AND state = 'waiting'
                "#,
            )
            .bind(now + self.lease_timeout_secs)
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

            if result.rows_affected() == 1 {
                if let Some(entry) = self.get_entry(&id).await? {
                    claimed.push(entry);
                }
            }
        }

        Ok(claimed)
    }

    /// Release a lease after successful processing.
    pub async fn complete(&self, job_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'completed', completed_at = ?, leased_until = NULL
            WHERE id = ? AND state IN ('leased', 'waiting')
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Release a lease recording a failure. Does not retry; re-enqueueing is
    /// the retry controller's responsibility.
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'failed', completed_at = ?, leased_until = NULL, last_error = ?
            WHERE id = ? AND state IN ('leased', 'waiting')
            "#,
        )
        .bind(now)
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Return expired leases to waiting (first stall) or fail them
    /// (second stall). Waiting entries whose delivery cap is spent are
    /// failed here too. Returns (requeued, failed) counts.
    pub async fn reap_stalled(&self) -> Result<(u64, u64)> {
        let now = chrono::Utc::now().timestamp();

        let requeued = sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'waiting', leased_until = NULL, stall_count = stall_count + 1
            WHERE state = 'leased' AND leased_until <= ? AND stall_count = 0
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'failed', leased_until = NULL, completed_at = ?,
                stall_count = stall_count + 1, last_error = 'stalled'
            WHERE state = 'leased' AND leased_until <= ? AND stall_count >= 1
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?
        .rows_affected();

        let exhausted = sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'failed', completed_at = ?, last_error = 'attempts exhausted'
            WHERE state = 'waiting' AND attempts_made >= max_attempts
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?
        .rows_affected();

        let failed = failed + exhausted;
        if requeued > 0 || failed > 0 {
            warn!(requeued, failed, "reaped stalled queue entries");
        }

        Ok((requeued, failed))
    }

    /// Counts by state for observability. Waiting entries whose not_before
    /// is still in the future count as delayed, not waiting.
    pub async fn stats(&self) -> Result<QueueStats> {
        let now = chrono::Utc::now().timestamp();
        let rows = sqlx::query(
            r#"
            SELECT state,
                   SUM(CASE WHEN state = 'waiting' AND not_before > ? THEN 1 ELSE 0 END) AS delayed,
                   COUNT(*) AS n
            FROM queue_entries
            GROUP BY state
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            match state.as_str() {
                "waiting" => {
                    let delayed: i64 = row.get::<Option<i64>, _>("delayed").unwrap_or(0);
                    stats.delayed = delayed;
                    stats.waiting = n - delayed;
                }
                "leased" => stats.leased = n,
                "completed" => stats.completed = n,
                "failed" => stats.failed = n,
                _ => {}
            }
        }

        Ok(stats)
    }

    /// Drop completed and failed entries older than the cutoff.
    pub async fn purge_finished(&self, older_than: i64) -> Result<u64> {
        let purged = sqlx::query(
            r#"
            DELETE FROM queue_entries
            WHERE state IN ('completed', 'failed') AND completed_at < ?
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?
        .rows_affected();

        Ok(purged)
    }

    /// Fetch a single entry by id.
    pub async fn get_entry(&self, job_id: &str) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, payload, not_before, priority, attempts_made,
                   max_attempts, state, leased_until, stall_count, last_error
            FROM queue_entries WHERE id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| {
            let kind = match r.get::<String, _>("kind").as_str() {
                "retry" => JobKind::Retry,
                "recurring-scan" => JobKind::RecurringScan,
                _ => JobKind::Publish,
            };
            let state = match r.get::<String, _>("state").as_str() {
                "leased" => QueueState::Leased,
                "completed" => QueueState::Completed,
                "failed" => QueueState::Failed,
                _ => QueueState::Waiting,
            };
            let payload: JobPayload =
                serde_json::from_str(&r.get::<String, _>("payload")).unwrap_or_default();

            QueueEntry {
                id: r.get("id"),
                kind,
                payload,
                not_before: r.get("not_before"),
                priority: r.get("priority"),
                attempts_made: r.get("attempts_made"),
                max_attempts: r.get("max_attempts"),
                state,
                leased_until: r.get("leased_until"),
                stall_count: r.get("stall_count"),
                last_error: r.get("last_error"),
            }
        }))
    }

    /// Enqueue a recurring job unless one of the kind is already waiting.
    /// Used by the ticker so missed ticks never pile up.
    pub async fn enqueue_recurring_tick(&self, kind: JobKind) -> Result<Option<String>> {
        let waiting: i64 = sqlx::query(
            r#"SELECT COUNT(*) AS n FROM queue_entries WHERE kind = ? AND state = 'waiting'"#,
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?
        .get("n");

        if waiting > 0 {
            return Ok(None);
        }

        let id = self
            .enqueue(kind, &JobPayload::default(), EnqueueOptions::default())
            .await?;
        Ok(Some(id))
    }

    /// Start the recurring ticker that enqueues a scan job at a fixed
    /// interval. The returned handle stops the task on `stop()` or drop.
    pub fn start_recurring(&self, kind: JobKind, every: Duration) -> RecurringTicker {
        let queue = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // First tick fires immediately; that is wanted so a restart
            // picks up overdue items right away.
            loop {
                interval.tick().await;
                if let Err(e) = queue.enqueue_recurring_tick(kind).await {
                    warn!("recurring tick enqueue failed: {}", e);
                }
            }
        });

        RecurringTicker { handle }
    }
}

/// Handle to the recurring enqueue task. Started on process init, stopped on
/// shutdown.
pub struct RecurringTicker {
    handle: tokio::task::JoinHandle<()>,
}

impl RecurringTicker {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for RecurringTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
