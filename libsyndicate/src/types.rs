//! Core types for Syndicate

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The schedulable unit of content targeting one or more platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub team_id: String,
    pub content: String,
    /// Ordered opaque references to media objects
    pub media_refs: Vec<String>,
    /// Platform identifiers this item targets; non-empty unless draft
    pub target_platforms: Vec<String>,
    pub status: ContentStatus,
    pub created_at: i64,
    /// Present iff status is scheduled/queued/dispatching and the item went
    /// through the scheduler
    pub scheduled_at: Option<i64>,
    /// Set when status becomes posted
    pub posted_at: Option<i64>,
    /// Display-only: max attempt count over platforms
    pub retry_count: i64,
}

impl ContentItem {
    pub fn draft(team_id: String, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            team_id,
            content,
            media_refs: Vec::new(),
            target_platforms: Vec::new(),
            status: ContentStatus::Draft,
            created_at: chrono::Utc::now().timestamp(),
            scheduled_at: None,
            posted_at: None,
            retry_count: 0,
        }
    }

    pub fn with_platforms(mut self, platforms: Vec<String>) -> Self {
        self.target_platforms = platforms;
        self
    }

    pub fn with_media(mut self, media_refs: Vec<String>) -> Self {
        self.media_refs = media_refs;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Draft,
    Scheduled,
    Queued,
    Dispatching,
    Posted,
    Failed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Dispatching => "dispatching",
            Self::Posted => "posted",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "scheduled" => Self::Scheduled,
            "queued" => Self::Queued,
            "dispatching" => Self::Dispatching,
            "posted" => Self::Posted,
            "failed" => Self::Failed,
            _ => Self::Draft,
        }
    }

    /// Terminal states admit no further automatic transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Posted | Self::Failed)
    }
}

impl std::fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-platform publish result for a content item.
///
/// One row per (content item, platform). A failed outcome keeps its error and
/// attempt count; a success is never rolled back even when sibling platforms
/// fail permanently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformOutcome {
    pub id: Option<i64>,
    pub content_id: String,
    pub platform: String,
    pub success: bool,
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub posted_at: Option<i64>,
    pub error_message: Option<String>,
    pub attempt_count: i64,
    pub last_attempt_at: Option<i64>,
    pub requires_manual_review: bool,
}

impl PlatformOutcome {
    pub fn pending(content_id: String, platform: String) -> Self {
        Self {
            id: None,
            content_id,
            platform,
            success: false,
            external_id: None,
            url: None,
            posted_at: None,
            error_message: None,
            attempt_count: 0,
            last_attempt_at: None,
            requires_manual_review: false,
        }
    }
}

/// Job kinds the queue knows about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Publish,
    Retry,
    RecurringScan,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Retry => "retry",
            Self::RecurringScan => "recurring-scan",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Waiting,
    Leased,
    Completed,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A materialized unit of work inside the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub not_before: i64,
    pub priority: i64,
    pub attempts_made: i64,
    pub max_attempts: i64,
    pub state: QueueState,
    pub leased_until: Option<i64>,
    pub stall_count: i64,
    pub last_error: Option<String>,
}

/// Payload carried by a queue entry.
///
/// Publish jobs name a content item; retry jobs additionally name the single
/// platform being retried. Recurring scans carry no identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl JobPayload {
    pub fn publish(content_id: &str) -> Self {
        Self {
            content_id: Some(content_id.to_string()),
            platform: None,
        }
    }

    pub fn retry(content_id: &str, platform: &str) -> Self {
        Self {
            content_id: Some(content_id.to_string()),
            platform: Some(platform.to_string()),
        }
    }
}

/// Queue counts by state, for dashboards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: i64,
    /// Waiting entries whose not_before is still in the future
    pub delayed: i64,
    pub leased: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Ephemeral retry decision produced by the backoff policy. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    pub should_retry: bool,
    pub delay: std::time::Duration,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_defaults() {
        let item = ContentItem::draft("team-1".to_string(), "hello".to_string());

        assert!(Uuid::parse_str(&item.id).is_ok());
        assert_eq!(item.team_id, "team-1");
        assert_eq!(item.status, ContentStatus::Draft);
        assert_eq!(item.scheduled_at, None);
        assert_eq!(item.posted_at, None);
        assert_eq!(item.retry_count, 0);
        assert!(item.target_platforms.is_empty());
    }

    #[test]
    fn test_draft_unique_ids() {
        let a = ContentItem::draft("t".into(), "one".into());
        let b = ContentItem::draft("t".into(), "two".into());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_with_platforms_and_media() {
        let item = ContentItem::draft("t".into(), "x".into())
            .with_platforms(vec!["linkedin".into(), "twitter".into()])
            .with_media(vec!["media/1".into()]);
        assert_eq!(item.target_platforms.len(), 2);
        assert_eq!(item.media_refs, vec!["media/1".to_string()]);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            ContentStatus::Draft,
            ContentStatus::Scheduled,
            ContentStatus::Queued,
            ContentStatus::Dispatching,
            ContentStatus::Posted,
            ContentStatus::Failed,
        ] {
            assert_eq!(ContentStatus::from_str_lossy(status.as_str()), status);
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(ContentStatus::Posted.is_terminal());
        assert!(ContentStatus::Failed.is_terminal());
        assert!(!ContentStatus::Scheduled.is_terminal());
        assert!(!ContentStatus::Dispatching.is_terminal());
    }

    #[test]
    fn test_job_kind_strings() {
        assert_eq!(JobKind::Publish.as_str(), "publish");
        assert_eq!(JobKind::Retry.as_str(), "retry");
        assert_eq!(JobKind::RecurringScan.as_str(), "recurring-scan");
    }

    #[test]
    fn test_payload_serialization_skips_empty() {
        let payload = JobPayload::publish("abc");
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"content_id":"abc"}"#);

        let payload = JobPayload::retry("abc", "linkedin");
        let json = serde_json::to_string(&payload).unwrap();
        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.platform.as_deref(), Some("linkedin"));
    }

    #[test]
    fn test_pending_outcome() {
        let outcome = PlatformOutcome::pending("c1".into(), "mastodon".into());
        assert!(!outcome.success);
        assert_eq!(outcome.attempt_count, 0);
        assert!(!outcome.requires_manual_review);
    }

    #[test]
    fn test_content_item_serialization() {
        let item = ContentItem::draft("team".into(), "post body".into())
            .with_platforms(vec!["twitter".into()]);
        let json = serde_json::to_string(&item).unwrap();
        let back: ContentItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, item.id);
        assert_eq!(back.status, ContentStatus::Draft);
        assert_eq!(back.target_platforms, item.target_platforms);
    }
}
