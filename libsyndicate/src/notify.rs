//! Notification events
//!
//! In-process event bus carrying lifecycle notifications: dispatch outcomes,
//! retries scheduled, and manual-review escalations. Built on
//! `tokio::sync::broadcast` so any number of subscribers (worker logs, the
//! queue CLI's follow mode, tests) can listen without blocking emitters.
//! With no subscribers events are dropped immediately.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<Event>;

/// Lifecycle events emitted by the dispatcher and retry controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Dispatch of a content item began
    DispatchStarted {
        content_id: String,
        platforms: Vec<String>,
    },

    /// One platform attempt finished, success or not
    PlatformAttempted {
        content_id: String,
        platform: String,
        success: bool,
        error: Option<String>,
    },

    /// Every targeted platform succeeded
    ItemPosted { content_id: String, posted_at: i64 },

    /// The item reached a terminal failure on at least one platform
    ItemFailed { content_id: String, reason: String },

    /// A retry was scheduled for one platform
    RetryScheduled {
        content_id: String,
        platform: String,
        delay_secs: u64,
        attempt: i64,
    },

    /// Retries are exhausted or the error was permanent; a human must act
    ManualReviewRequired {
        content_id: String,
        platform: String,
        reason: String,
    },
}

/// Broadcast bus for [`Event`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` bounds the per-subscriber buffer; lagging subscribers lose
    /// the oldest events first.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Non-blocking; an event with no listeners is dropped.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}
