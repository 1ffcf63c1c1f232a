//! Scheduling engine
//!
//! Decides when content enters the queue: fixed-time, optimal-time-of-day,
//! immediate, and the recurring due-scan. Wall-clock inputs arrive as local
//! times in an IANA timezone and are normalized to UTC before persistence;
//! everything downstream of this module speaks unix seconds only.
//!
//! The due-scan is race-free under concurrent runs: an item is enqueued only
//! by the scan that wins the guarded `scheduled -> queued` status flip, and a
//! partial unique index on waiting publish jobs backstops the invariant.

use chrono::{
    DateTime, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveDateTime, Offset,
    TimeZone, Utc,
};
use chrono_tz::Tz;
use tracing::{debug, info};

use crate::db::ContentStore;
use crate::error::{Result, SyndicateError};
use crate::queue::{EnqueueOptions, Queue};
use crate::types::{ContentItem, ContentStatus, JobKind, JobPayload};

/// Symmetric window used by conflict detection, in seconds.
const CONFLICT_WINDOW_SECS: i64 = 5 * 60;

/// Minimum historical samples for an engagement bucket to be suggested.
const MIN_BUCKET_SAMPLES: i64 = 5;

/// Recommended local posting times per platform, as (hour, minute), in the
/// order they should be tried within a day.
fn default_slots(platform: &str) -> &'static [(u32, u32)] {
    match platform {
        "twitter" => &[(9, 0), (12, 0), (15, 0), (18, 0), (21, 0)],
        "linkedin" => &[(8, 0), (10, 0), (12, 0), (17, 0)],
        "mastodon" => &[(9, 0), (13, 0), (19, 0)],
        _ => &[(9, 0), (12, 0), (18, 0)],
    }
}

/// A scheduled item that collides with a candidate time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub content_id: String,
    pub scheduled_at: i64,
    /// Platforms shared between the candidate and the conflicting item
    pub overlapping_platforms: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    fn from_samples(samples: i64) -> Self {
        if samples >= 20 {
            Self::High
        } else if samples >= 10 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One ranked posting-time recommendation, in the requested timezone.
#[derive(Debug, Clone)]
pub struct TimeSuggestion {
    pub hour: u32,
    pub minute: u32,
    /// 0 = Monday .. 6 = Sunday; None for static defaults that apply any day
    pub weekday: Option<u32>,
    pub confidence: Confidence,
    pub mean_engagement: Option<f64>,
    pub samples: i64,
}

/// Per-team schedule overview for dashboards.
#[derive(Debug, Clone, Default)]
pub struct ScheduleStats {
    pub draft: i64,
    pub scheduled: i64,
    pub queued: i64,
    pub dispatching: i64,
    pub posted: i64,
    pub failed: i64,
    pub next_scheduled_at: Option<i64>,
}

pub struct Scheduler {
    store: ContentStore,
    queue: Queue,
}

impl Scheduler {
    pub fn new(store: ContentStore, queue: Queue) -> Self {
        Self { store, queue }
    }

    /// Persist a draft as `scheduled` at a fixed instant.
    ///
    /// The instant must be strictly in the future. No publish job is
    /// enqueued here; the recurring due-scan picks the item up once its
    /// time arrives.
    pub async fn schedule_at(
        &self,
        mut draft: ContentItem,
        when: DateTime<Utc>,
    ) -> Result<ContentItem> {
        if draft.content.trim().is_empty() {
            return Err(SyndicateError::Validation(
                "content must not be empty".to_string(),
            ));
        }
        if draft.target_platforms.is_empty() {
            return Err(SyndicateError::Validation(
                "at least one target platform is required".to_string(),
            ));
        }
        if when <= Utc::now() {
            return Err(SyndicateError::InvalidTime(format!(
                "scheduled time {} is not in the future",
                when.to_rfc3339()
            )));
        }

        draft.status = ContentStatus::Scheduled;
        draft.scheduled_at = Some(when.timestamp());
        self.store.create_item(&draft).await?;

        info!(
            content_id = %draft.id,
            scheduled_at = %when.to_rfc3339(),
            "item scheduled"
        );
        Ok(draft)
    }

    /// Schedule at the first recommended slot for `platform` on `date` that
    /// is still in the future, rolling over to the next day's first slot
    /// when the day is spent. Delegates to [`Scheduler::schedule_at`].
    pub async fn schedule_optimal(
        &self,
        draft: ContentItem,
        date: NaiveDate,
        timezone: &str,
        platform: &str,
    ) -> Result<ContentItem> {
        let tz = parse_timezone(timezone)?;
        let when = pick_optimal_slot(date, tz, platform, Utc::now())?;
        self.schedule_at(draft, when).await
    }

    /// Move a scheduled item to a new instant. Only valid while the status
    /// is exactly `scheduled`; the status itself does not change.
    pub async fn reschedule(&self, content_id: &str, when: DateTime<Utc>) -> Result<()> {
        if when <= Utc::now() {
            return Err(SyndicateError::InvalidTime(format!(
                "new time {} is not in the future",
                when.to_rfc3339()
            )));
        }

        if !self.store.reschedule(content_id, when.timestamp()).await? {
            return Err(SyndicateError::InvalidState(format!(
                "item {} is not in scheduled state",
                content_id
            )));
        }

        info!(content_id, new_time = %when.to_rfc3339(), "item rescheduled");
        Ok(())
    }

    /// Return a scheduled item to `draft`, clearing its scheduled time.
    pub async fn cancel(&self, content_id: &str) -> Result<()> {
        if !self.store.cancel_scheduled(content_id).await? {
            return Err(SyndicateError::InvalidState(format!(
                "item {} is not in scheduled state",
                content_id
            )));
        }

        info!(content_id, "schedule cancelled");
        Ok(())
    }

    /// Scheduled items of the same team within +/-5 minutes of the
    /// candidate that share at least one platform. Read-only; callers
    /// decide whether to warn or block.
    pub async fn check_conflicts(
        &self,
        team_id: &str,
        candidate: DateTime<Utc>,
        platforms: &[String],
        exclude_content_id: Option<&str>,
    ) -> Result<Vec<Conflict>> {
        let center = candidate.timestamp();
        let neighbors = self
            .store
            .scheduled_in_window(
                team_id,
                center - CONFLICT_WINDOW_SECS,
                center + CONFLICT_WINDOW_SECS,
                exclude_content_id,
            )
            .await?;

        let conflicts = neighbors
            .into_iter()
            .filter_map(|item| {
                let overlap: Vec<String> = item
                    .target_platforms
                    .iter()
                    .filter(|p| platforms.contains(p))
                    .cloned()
                    .collect();
                let scheduled_at = item.scheduled_at?;
                if overlap.is_empty() {
                    None
                } else {
                    Some(Conflict {
                        content_id: item.id,
                        scheduled_at,
                        overlapping_platforms: overlap,
                    })
                }
            })
            .collect();

        Ok(conflicts)
    }

    /// Rank historical engagement buckets for the platform, requiring at
    /// least 5 samples per bucket; falls back to the static slot list when
    /// no bucket qualifies. Hours are reported in the requested timezone.
    pub async fn suggest_optimal_times(
        &self,
        team_id: &str,
        platform: &str,
        timezone: &str,
    ) -> Result<Vec<TimeSuggestion>> {
        let tz = parse_timezone(timezone)?;
        let offset_secs = tz
            .offset_from_utc_datetime(&Utc::now().naive_utc())
            .fix()
            .local_minus_utc() as i64;
        let offset_hours = offset_secs.div_euclid(3600);

        let buckets = self.store.engagement_buckets(team_id, platform).await?;
        let qualified: Vec<TimeSuggestion> = buckets
            .into_iter()
            .filter(|b| b.samples >= MIN_BUCKET_SAMPLES)
            .map(|b| {
                // A shift across midnight moves the bucket to the adjacent
                // weekday as well.
                let shifted = b.hour as i64 + offset_hours;
                TimeSuggestion {
                    hour: shifted.rem_euclid(24) as u32,
                    minute: 0,
                    weekday: Some(
                        (b.weekday as i64 + shifted.div_euclid(24)).rem_euclid(7) as u32,
                    ),
                    confidence: Confidence::from_samples(b.samples),
                    mean_engagement: Some(b.mean_engagement),
                    samples: b.samples,
                }
            })
            .collect();

        if !qualified.is_empty() {
            return Ok(qualified);
        }

        debug!(team_id, platform, "no qualified engagement buckets, using defaults");
        Ok(default_slots(platform)
            .iter()
            .map(|&(hour, minute)| TimeSuggestion {
                hour,
                minute,
                weekday: None,
                confidence: Confidence::Low,
                mean_engagement: None,
                samples: 0,
            })
            .collect())
    }

    /// "Post now": flip the item to `queued` and enqueue a publish job at
    /// the given priority, bypassing the due-scan.
    pub async fn enqueue_immediate(&self, content_id: &str, priority: i64) -> Result<String> {
        let item = self
            .store
            .get_item(content_id)
            .await?
            .ok_or_else(|| SyndicateError::Validation(format!("unknown item {}", content_id)))?;

        if item.status.is_terminal() {
            return Err(SyndicateError::InvalidState(format!(
                "item {} is already {}",
                content_id, item.status
            )));
        }
        if item.target_platforms.is_empty() {
            return Err(SyndicateError::Validation(
                "item has no target platforms".to_string(),
            ));
        }

        self.store
            .set_status(content_id, ContentStatus::Queued)
            .await?;
        let job_id = self
            .queue
            .enqueue(
                JobKind::Publish,
                &JobPayload::publish(content_id),
                EnqueueOptions::with_priority(priority),
            )
            .await?;

        info!(content_id, job_id = %job_id, "item enqueued immediately");
        Ok(job_id)
    }

    /// One pass of the recurring due-scan: every `scheduled` item whose
    /// time has arrived is flipped to `queued` and enqueued exactly once.
    /// Safe under concurrent scans: only the scan that wins the guarded
    /// status flip enqueues.
    pub async fn scan_due(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let due = self.store.list_due_scheduled(now).await?;

        let mut enqueued = 0;
        for item in due {
            if !self.store.mark_queued(&item.id).await? {
                // Lost the flip to a concurrent scan or a cancel.
                continue;
            }
            self.queue
                .enqueue(
                    JobKind::Publish,
                    &JobPayload::publish(&item.id),
                    EnqueueOptions::default(),
                )
                .await?;
            enqueued += 1;
        }

        if enqueued > 0 {
            info!(enqueued, "due scan enqueued publish jobs");
        }
        Ok(enqueued)
    }

    /// Status counts and the next upcoming scheduled time for a team.
    pub async fn schedule_stats(&self, team_id: &str) -> Result<ScheduleStats> {
        let mut stats = ScheduleStats::default();
        for (status, n) in self.store.status_counts(team_id).await? {
            match status.as_str() {
                "draft" => stats.draft = n,
                "scheduled" => stats.scheduled = n,
                "queued" => stats.queued = n,
                "dispatching" => stats.dispatching = n,
                "posted" => stats.posted = n,
                "failed" => stats.failed = n,
                _ => {}
            }
        }

        stats.next_scheduled_at = self
            .store
            .list_scheduled(Some(team_id))
            .await?
            .into_iter()
            .filter_map(|item| item.scheduled_at)
            .min();

        Ok(stats)
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SyndicateError::InvalidTime(format!("unknown timezone: {}", name)))
}

/// Interpret a naive local datetime in a timezone, producing UTC.
///
/// Ambiguous local times (DST fold) resolve to the earlier instant;
/// nonexistent local times (DST gap) are rejected.
pub fn local_to_utc(naive: NaiveDateTime, timezone: &str) -> Result<DateTime<Utc>> {
    let tz = parse_timezone(timezone)?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Ok(earlier.with_timezone(&Utc)),
        LocalResult::None => Err(SyndicateError::InvalidTime(format!(
            "local time {} does not exist in {}",
            naive, timezone
        ))),
    }
}

/// First recommended slot for the platform on `date` (local to `tz`) that
/// is strictly after `now`; when the day is spent, the first slot of the
/// following day.
fn pick_optimal_slot(
    date: NaiveDate,
    tz: Tz,
    platform: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let slots = default_slots(platform);

    for &(hour, minute) in slots {
        let naive = date
            .and_hms_opt(hour, minute, 0)
            .ok_or_else(|| SyndicateError::InvalidTime(format!("bad slot {}:{:02}", hour, minute)))?;
        if let LocalResult::Single(local) | LocalResult::Ambiguous(local, _) =
            tz.from_local_datetime(&naive)
        {
            let candidate = local.with_timezone(&Utc);
            if candidate > now {
                return Ok(candidate);
            }
        }
    }

    // Day spent: first slot of the following day.
    let next_day = date + ChronoDuration::days(1);
    let (hour, minute) = slots[0];
    let naive = next_day
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| SyndicateError::InvalidTime(format!("bad slot {}:{:02}", hour, minute)))?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(local) | LocalResult::Ambiguous(local, _) => {
            Ok(local.with_timezone(&Utc))
        }
        LocalResult::None => Err(SyndicateError::InvalidTime(format!(
            "no valid slot on {}",
            next_day
        ))),
    }
}
