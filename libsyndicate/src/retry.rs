//! Retry controller
//!
//! Bridges the pure backoff policy to durable state: records the failed
//! attempt, asks the policy for a plan, and either enqueues a delayed retry
//! job for that single platform or escalates to manual review. Retry state
//! lives entirely in the platform outcome rows and the queue; the controller
//! itself is stateless.

use tracing::{info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::db::ContentStore;
use crate::error::{PlatformError, Result};
use crate::notify::{Event, EventBus};
use crate::queue::{EnqueueOptions, Queue};
use crate::types::{JobKind, JobPayload, RetryPlan};

pub struct RetryController {
    store: ContentStore,
    queue: Queue,
    config: Config,
    bus: EventBus,
}

impl RetryController {
    pub fn new(store: ContentStore, queue: Queue, config: Config, bus: EventBus) -> Self {
        Self {
            store,
            queue,
            config,
            bus,
        }
    }

    /// React to one failed platform attempt.
    ///
    /// Records the attempt first so the policy sees the true count, then
    /// either schedules a delayed retry job or flags the platform outcome
    /// for manual review. Returns the plan for the caller's bookkeeping.
    pub async fn handle_failure(
        &self,
        content_id: &str,
        platform: &str,
        error: &PlatformError,
    ) -> Result<RetryPlan> {
        let now = chrono::Utc::now().timestamp();
        let attempts = self
            .store
            .record_outcome_failure(content_id, platform, &error.to_string(), now)
            .await?;

        let retry_config = self.config.retry_config(platform);
        let plan = BackoffPolicy::decide(&retry_config, error, attempts);

        if plan.should_retry {
            let delay_secs = plan.delay.as_secs();
            self.queue
                .enqueue(
                    JobKind::Retry,
                    &JobPayload::retry(content_id, platform),
                    EnqueueOptions::delayed_until(now + delay_secs as i64),
                )
                .await?;

            info!(
                content_id,
                platform, attempts, delay_secs, "retry scheduled: {}", plan.reason
            );
            self.bus.emit(Event::RetryScheduled {
                content_id: content_id.to_string(),
                platform: platform.to_string(),
                delay_secs,
                attempt: attempts,
            });
        } else {
            self.store.mark_manual_review(content_id, platform).await?;

            warn!(
                content_id,
                platform, attempts, "escalating to manual review: {}", plan.reason
            );
            self.bus.emit(Event::ManualReviewRequired {
                content_id: content_id.to_string(),
                platform: platform.to_string(),
                reason: plan.reason.clone(),
            });
        }

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentItem, QueueState};

    async fn setup() -> (ContentStore, Queue, RetryController, String) {
        let store = ContentStore::new(":memory:").await.unwrap();
        let queue = Queue::new(store.pool().clone(), 120);
        let bus = EventBus::new(16);
        let controller = RetryController::new(
            store.clone(),
            queue.clone(),
            Config::default_config(),
            bus,
        );

        let item = ContentItem::draft("team-1".into(), "body".into())
            .with_platforms(vec!["twitter".into()]);
        store.create_item(&item).await.unwrap();

        (store, queue, controller, item.id)
    }

    #[tokio::test]
    async fn test_transient_failure_enqueues_delayed_retry() {
        let (_store, queue, controller, content_id) = setup().await;

        let plan = controller
            .handle_failure(
                &content_id,
                "twitter",
                &PlatformError::Server("502".into()),
            )
            .await
            .unwrap();
        assert!(plan.should_retry);

        // The retry job exists but is not yet due.
        let ready = queue.dequeue(JobKind::Retry, 4).await.unwrap();
        assert!(ready.is_empty());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_flags_manual_review() {
        let (store, queue, controller, content_id) = setup().await;

        let plan = controller
            .handle_failure(
                &content_id,
                "twitter",
                &PlatformError::Authentication("token revoked".into()),
            )
            .await
            .unwrap();
        assert!(!plan.should_retry);

        let outcomes = store.get_outcomes(&content_id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].requires_manual_review);
        assert_eq!(outcomes[0].attempt_count, 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting + stats.delayed, 0);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_stops_retrying() {
        let (store, _queue, controller, content_id) = setup().await;
        let error = PlatformError::Network("reset".into());

        // Default twitter policy allows 3 retries.
        for _ in 0..2 {
            let plan = controller
                .handle_failure(&content_id, "twitter", &error)
                .await
                .unwrap();
            assert!(plan.should_retry);
        }

        let plan = controller
            .handle_failure(&content_id, "twitter", &error)
            .await
            .unwrap();
        assert!(!plan.should_retry);
        assert!(plan.reason.contains("exhausted"));

        let outcomes = store.get_outcomes(&content_id).await.unwrap();
        assert_eq!(outcomes[0].attempt_count, 3);
        assert!(outcomes[0].requires_manual_review);
    }

    #[tokio::test]
    async fn test_rate_limit_hint_sets_not_before() {
        let (_store, queue, controller, content_id) = setup().await;
        let before = chrono::Utc::now().timestamp();

        controller
            .handle_failure(
                &content_id,
                "twitter",
                &PlatformError::RateLimited {
                    message: "429".into(),
                    retry_after: Some(300),
                },
            )
            .await
            .unwrap();

        // Find the retry entry and check its earliest dispatch time.
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.delayed, 1);

        let row = sqlx::query("SELECT id FROM queue_entries WHERE kind = 'retry'")
            .fetch_one(queue.pool())
            .await
            .unwrap();
        let id: String = sqlx::Row::get(&row, "id");

        let entry = queue.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.state, QueueState::Waiting);
        assert!(entry.not_before >= before + 300);
        assert_eq!(entry.payload.platform.as_deref(), Some("twitter"));
    }

    #[tokio::test]
    async fn test_attempts_accumulate_across_failures() {
        let (store, _queue, controller, content_id) = setup().await;

        controller
            .handle_failure(&content_id, "twitter", &PlatformError::Server("500".into()))
            .await
            .unwrap();
        controller
            .handle_failure(
                &content_id,
                "twitter",
                &PlatformError::Timeout("deadline".into()),
            )
            .await
            .unwrap();

        let item = store.get_item(&content_id).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 2);
    }
}
