//! Dispatch engine
//!
//! Takes publish and retry jobs off the queue and drives platform adapters.
//! All platforms of an item are attempted concurrently; one platform's
//! failure never aborts its siblings, and a recorded success is never rolled
//! back. The item reaches `posted` only when every targeted platform has
//! succeeded; a platform that can no longer succeed automatically pushes the
//! item to `failed` while keeping sibling successes intact.

use chrono::{Datelike, TimeZone, Timelike, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::ContentStore;
use crate::error::{PlatformError, Result, SyndicateError};
use crate::notify::{Event, EventBus};
use crate::platforms::{AdapterRegistry, PlatformAdapter, PublishRequest};
use crate::retry::RetryController;
use crate::types::{ContentItem, ContentStatus, JobKind, QueueEntry};

pub struct Dispatcher {
    store: ContentStore,
    registry: AdapterRegistry,
    retry: RetryController,
    bus: EventBus,
    adapter_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: ContentStore,
        registry: AdapterRegistry,
        retry: RetryController,
        bus: EventBus,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            retry,
            bus,
            adapter_timeout,
        }
    }

    /// Process one queue entry. Ineligible jobs (missing or already-terminal
    /// items) complete without platform attempts.
    pub async fn process(&self, entry: &QueueEntry) -> Result<()> {
        match entry.kind {
            JobKind::Publish => {
                let content_id = entry.payload.content_id.as_deref().ok_or_else(|| {
                    SyndicateError::Validation("publish job without content_id".to_string())
                })?;
                self.process_publish(content_id).await
            }
            JobKind::Retry => {
                let content_id = entry.payload.content_id.as_deref().ok_or_else(|| {
                    SyndicateError::Validation("retry job without content_id".to_string())
                })?;
                let platform = entry.payload.platform.as_deref().ok_or_else(|| {
                    SyndicateError::Validation("retry job without platform".to_string())
                })?;
                self.process_retry(content_id, platform).await
            }
            JobKind::RecurringScan => Ok(()),
        }
    }

    /// Full fan-out for a freshly dequeued item.
    pub async fn process_publish(&self, content_id: &str) -> Result<()> {
        let item = match self.eligible_item(content_id).await? {
            Some(item) => item,
            None => return Ok(()),
        };

        if !self.store.mark_dispatching(content_id).await? {
            debug!(content_id, "item no longer claimable, skipping dispatch");
            return Ok(());
        }

        // Platforms that already succeeded (earlier partial dispatch) are
        // not attempted again.
        let done: Vec<String> = self
            .store
            .get_outcomes(content_id)
            .await?
            .into_iter()
            .filter(|o| o.success)
            .map(|o| o.platform)
            .collect();

        let pending: Vec<String> = item
            .target_platforms
            .iter()
            .filter(|p| !done.contains(p))
            .cloned()
            .collect();

        self.bus.emit(Event::DispatchStarted {
            content_id: content_id.to_string(),
            platforms: pending.clone(),
        });

        let request = PublishRequest {
            content_id: item.id.clone(),
            team_id: item.team_id.clone(),
            content: item.content.clone(),
            media_refs: item.media_refs.clone(),
        };

        let attempts = pending.iter().map(|platform| {
            let platform = platform.clone();
            let request = request.clone();
            let adapter = self.registry.get(&platform);
            async move {
                let outcome = self.attempt(adapter, &platform, &request).await;
                (platform, outcome)
            }
        });

        for (platform, outcome) in join_all(attempts).await {
            self.record_attempt(&item, &platform, outcome).await?;
        }

        self.finalize(content_id).await
    }

    /// Single-platform attempt scheduled by the retry controller.
    pub async fn process_retry(&self, content_id: &str, platform: &str) -> Result<()> {
        let item = match self.store.get_item(content_id).await? {
            Some(item) => item,
            None => {
                debug!(content_id, "retry target vanished, skipping");
                return Ok(());
            }
        };

        if item.status == ContentStatus::Posted {
            return Ok(());
        }

        let already_done = self
            .store
            .get_outcomes(content_id)
            .await?
            .iter()
            .any(|o| o.platform == platform && o.success);
        if already_done {
            debug!(content_id, platform, "platform already succeeded, retry is a no-op");
            return Ok(());
        }

        let request = PublishRequest {
            content_id: item.id.clone(),
            team_id: item.team_id.clone(),
            content: item.content.clone(),
            media_refs: item.media_refs.clone(),
        };

        let adapter = self.registry.get(platform);
        let outcome = self.attempt(adapter, platform, &request).await;
        self.record_attempt(&item, platform, outcome).await?;

        self.finalize(content_id).await
    }

    async fn eligible_item(&self, content_id: &str) -> Result<Option<ContentItem>> {
        let item = match self.store.get_item(content_id).await? {
            Some(item) => item,
            None => {
                debug!(content_id, "publish job for unknown item, skipping");
                return Ok(None);
            }
        };

        match item.status {
            // Dispatching is accepted so a job redelivered after a worker
            // stall can finish the item; the per-platform success skip keeps
            // reprocessing idempotent.
            ContentStatus::Scheduled | ContentStatus::Queued | ContentStatus::Dispatching => {
                // A reschedule that raced the scan can leave a queued item
                // whose time moved back into the future. Hand it back to
                // the scan instead of posting early.
                if let Some(at) = item.scheduled_at {
                    if at > Utc::now().timestamp() {
                        debug!(content_id, "scheduled time moved into the future, deferring");
                        self.store
                            .set_status(content_id, ContentStatus::Scheduled)
                            .await?;
                        return Ok(None);
                    }
                }
                Ok(Some(item))
            }
            status => {
                debug!(content_id, %status, "item not eligible for dispatch");
                Ok(None)
            }
        }
    }

    /// One adapter call under the configured deadline. A missing adapter is
    /// permanent; an elapsed deadline is a transient timeout.
    async fn attempt(
        &self,
        adapter: Option<Arc<dyn PlatformAdapter>>,
        platform: &str,
        request: &PublishRequest,
    ) -> std::result::Result<crate::platforms::PublishReceipt, PlatformError> {
        let adapter = adapter.ok_or_else(|| {
            PlatformError::Malformed(format!("no adapter registered for {}", platform))
        })?;

        match tokio::time::timeout(self.adapter_timeout, adapter.publish(request)).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout(format!(
                "adapter {} exceeded {}s deadline",
                platform,
                self.adapter_timeout.as_secs()
            ))),
        }
    }

    async fn record_attempt(
        &self,
        item: &ContentItem,
        platform: &str,
        outcome: std::result::Result<crate::platforms::PublishReceipt, PlatformError>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        match outcome {
            Ok(receipt) => {
                info!(
                    content_id = %item.id,
                    platform,
                    external_id = %receipt.external_id,
                    "platform publish succeeded"
                );
                self.store
                    .record_outcome_success(
                        &item.id,
                        platform,
                        &receipt.external_id,
                        receipt.url.as_deref(),
                        now,
                    )
                    .await?;

                // Feed the optimal-time model. Engagement starts at zero and
                // is updated later as metrics arrive.
                let posted = Utc.timestamp_opt(now, 0).single().unwrap_or_else(Utc::now);
                self.store
                    .record_engagement(
                        &item.team_id,
                        platform,
                        posted.hour(),
                        posted.weekday().num_days_from_monday(),
                        0.0,
                        now,
                    )
                    .await?;

                self.bus.emit(Event::PlatformAttempted {
                    content_id: item.id.clone(),
                    platform: platform.to_string(),
                    success: true,
                    error: None,
                });
            }
            Err(error) => {
                warn!(content_id = %item.id, platform, "platform publish failed: {}", error);
                self.retry.handle_failure(&item.id, platform, &error).await?;

                self.bus.emit(Event::PlatformAttempted {
                    content_id: item.id.clone(),
                    platform: platform.to_string(),
                    success: false,
                    error: Some(error.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Merge per-platform outcomes into the item's status.
    ///
    /// posted requires every targeted platform to have succeeded. An
    /// unrecoverable platform (manual review flagged) makes the item failed.
    /// Anything else leaves it dispatching while retries play out.
    async fn finalize(&self, content_id: &str) -> Result<()> {
        let bundle = match self.store.get_item_with_outcomes(content_id).await? {
            Some(bundle) => bundle,
            None => return Ok(()),
        };

        let succeeded = |platform: &str| {
            bundle
                .outcomes
                .iter()
                .any(|o| o.platform == platform && o.success)
        };

        let all_succeeded = !bundle.item.target_platforms.is_empty()
            && bundle.item.target_platforms.iter().all(|p| succeeded(p));

        if all_succeeded {
            let posted_at = Utc::now().timestamp();
            self.store.mark_posted(content_id, posted_at).await?;
            info!(content_id, "all platforms succeeded, item posted");
            self.bus.emit(Event::ItemPosted {
                content_id: content_id.to_string(),
                posted_at,
            });
            return Ok(());
        }

        let blocked: Vec<&str> = bundle
            .outcomes
            .iter()
            .filter(|o| o.requires_manual_review && !o.success)
            .map(|o| o.platform.as_str())
            .collect();

        if !blocked.is_empty() {
            let reason = format!("platforms require manual review: {}", blocked.join(", "));
            self.store
                .set_status(content_id, ContentStatus::Failed)
                .await?;
            warn!(content_id, "{}", reason);
            self.bus.emit(Event::ItemFailed {
                content_id: content_id.to_string(),
                reason,
            });
        }

        Ok(())
    }
}
