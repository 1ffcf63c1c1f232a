//! End-to-end tests for the schedule -> scan -> dispatch -> retry pipeline

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use libsyndicate::config::Config;
use libsyndicate::db::ContentStore;
use libsyndicate::dispatcher::Dispatcher;
use libsyndicate::notify::{Event, EventBus};
use libsyndicate::platforms::mock::MockAdapter;
use libsyndicate::platforms::AdapterRegistry;
use libsyndicate::queue::Queue;
use libsyndicate::retry::RetryController;
use libsyndicate::scheduler::Scheduler;
use libsyndicate::types::{ContentItem, ContentStatus, JobKind};
use libsyndicate::PlatformError;

struct Pipeline {
    store: ContentStore,
    queue: Queue,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    bus: EventBus,
}

async fn pipeline(adapters: Vec<MockAdapter>) -> Pipeline {
    let store = ContentStore::new(":memory:").await.unwrap();
    let queue = Queue::new(store.pool().clone(), 120);
    let bus = EventBus::new(64);

    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(Arc::new(adapter));
    }

    let retry = RetryController::new(
        store.clone(),
        queue.clone(),
        Config::default_config(),
        bus.clone(),
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        retry,
        bus.clone(),
        Duration::from_secs(5),
    );
    let scheduler = Scheduler::new(store.clone(), queue.clone());

    Pipeline {
        store,
        queue,
        scheduler,
        dispatcher,
        bus,
    }
}

/// Schedule an item, then backdate it so the scan sees it as due.
async fn schedule_due(p: &Pipeline, platforms: Vec<&str>) -> String {
    let draft = ContentItem::draft("team-1".into(), "pipeline post".into())
        .with_platforms(platforms.into_iter().map(String::from).collect());
    let item = p
        .scheduler
        .schedule_at(draft, Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    p.store
        .reschedule(&item.id, Utc::now().timestamp() - 60)
        .await
        .unwrap();
    item.id
}

/// Drain ready jobs of one kind through the dispatcher.
async fn drain(p: &Pipeline, kind: JobKind) -> usize {
    let jobs = p.queue.dequeue(kind, 8).await.unwrap();
    let n = jobs.len();
    for job in jobs {
        p.dispatcher.process(&job).await.unwrap();
        p.queue.complete(&job.id).await.unwrap();
    }
    n
}

#[tokio::test]
async fn test_schedule_scan_dispatch_posts_item() {
    let mastodon = MockAdapter::succeeding("mastodon");
    let twitter = MockAdapter::succeeding("twitter");
    let p = pipeline(vec![mastodon.clone(), twitter.clone()]).await;
    let mut events = p.bus.subscribe();

    let id = schedule_due(&p, vec!["mastodon", "twitter"]).await;

    assert_eq!(p.scheduler.scan_due().await.unwrap(), 1);
    assert_eq!(drain(&p, JobKind::Publish).await, 1);

    let item = p.store.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ContentStatus::Posted);
    assert_eq!(mastodon.call_count(), 1);
    assert_eq!(twitter.call_count(), 1);

    let stats = p.queue.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.waiting + stats.delayed + stats.leased, 0);

    // DispatchStarted arrives before ItemPosted.
    assert!(matches!(
        events.recv().await.unwrap(),
        Event::DispatchStarted { .. }
    ));
    let mut posted_seen = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::ItemPosted { .. }) {
            posted_seen = true;
        }
    }
    assert!(posted_seen);
}

#[tokio::test]
async fn test_double_scan_enqueues_single_job() {
    let p = pipeline(vec![MockAdapter::succeeding("mastodon")]).await;
    schedule_due(&p, vec!["mastodon"]).await;

    assert_eq!(p.scheduler.scan_due().await.unwrap(), 1);
    assert_eq!(p.scheduler.scan_due().await.unwrap(), 0);

    let stats = p.queue.stats().await.unwrap();
    assert_eq!(stats.waiting, 1);
}

#[tokio::test]
async fn test_partial_permanent_failure_keeps_success() {
    let good = MockAdapter::succeeding("mastodon");
    let bad = MockAdapter::scripted(
        "twitter",
        vec![Err(PlatformError::Forbidden("account suspended".into()))],
    );
    let p = pipeline(vec![good, bad]).await;

    let id = schedule_due(&p, vec!["mastodon", "twitter"]).await;
    p.scheduler.scan_due().await.unwrap();
    drain(&p, JobKind::Publish).await;

    let bundle = p.store.get_item_with_outcomes(&id).await.unwrap().unwrap();
    assert_eq!(bundle.item.status, ContentStatus::Failed);

    let mastodon = bundle
        .outcomes
        .iter()
        .find(|o| o.platform == "mastodon")
        .unwrap();
    assert!(mastodon.success);
    assert!(mastodon.external_id.is_some());

    let twitter = bundle
        .outcomes
        .iter()
        .find(|o| o.platform == "twitter")
        .unwrap();
    assert!(!twitter.success);
    assert!(twitter.requires_manual_review);
}

#[tokio::test]
async fn test_retry_exhaustion_is_monotonic_and_bounded() {
    // Always-transient adapter; the default twitter budget is 3 retries.
    let flaky = MockAdapter::scripted(
        "twitter",
        vec![
            Err(PlatformError::Server("500".into())),
            Err(PlatformError::Server("500".into())),
            Err(PlatformError::Server("500".into())),
            Err(PlatformError::Server("500".into())),
        ],
    );
    let p = pipeline(vec![flaky.clone()]).await;

    let id = schedule_due(&p, vec!["twitter"]).await;
    p.scheduler.scan_due().await.unwrap();
    drain(&p, JobKind::Publish).await;

    // Drive the scheduled retries directly (their delays are in the
    // future, so the queue would not release them yet).
    p.dispatcher.process_retry(&id, "twitter").await.unwrap();
    p.dispatcher.process_retry(&id, "twitter").await.unwrap();

    // Exactly 3 attempts happened, then the platform was escalated.
    assert_eq!(flaky.call_count(), 3);

    let bundle = p.store.get_item_with_outcomes(&id).await.unwrap().unwrap();
    assert_eq!(bundle.outcomes[0].attempt_count, 3);
    assert!(bundle.outcomes[0].requires_manual_review);
    assert_eq!(bundle.item.status, ContentStatus::Failed);

    // The two scheduled retry delays grew monotonically (jitter cannot
    // close a 2x gap).
    let rows = sqlx::query("SELECT not_before, created_at FROM queue_entries WHERE kind = 'retry' ORDER BY created_at ASC, not_before ASC")
        .fetch_all(p.queue.pool())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    let delays: Vec<i64> = rows
        .iter()
        .map(|row| {
            let not_before: i64 = sqlx::Row::get(row, "not_before");
            let created_at: i64 = sqlx::Row::get(row, "created_at");
            not_before - created_at
        })
        .collect();
    assert!(delays[1] > delays[0], "delays not monotonic: {:?}", delays);

    // A further retry after escalation never reaches the adapter budget
    // again without manual intervention.
    let stats = p.queue.stats().await.unwrap();
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_cancelled_item_is_never_published() {
    let mastodon = MockAdapter::succeeding("mastodon");
    let p = pipeline(vec![mastodon.clone()]).await;

    let id = schedule_due(&p, vec!["mastodon"]).await;

    // Cancel wins before the scan: no publish job at all.
    p.scheduler.cancel(&id).await.unwrap();
    assert_eq!(p.scheduler.scan_due().await.unwrap(), 0);
    let stats = p.queue.stats().await.unwrap();
    assert_eq!(stats.waiting + stats.delayed, 0);
    assert_eq!(mastodon.call_count(), 0);
}

#[tokio::test]
async fn test_cancelled_after_enqueue_aborts_dispatch() {
    let mastodon = MockAdapter::succeeding("mastodon");
    let p = pipeline(vec![mastodon.clone()]).await;

    let id = schedule_due(&p, vec!["mastodon"]).await;
    p.scheduler.scan_due().await.unwrap();

    // The publish job exists, but the item has been pulled back before a
    // worker picks it up. The dispatcher must observe the state and abort.
    p.store
        .set_status(&id, ContentStatus::Draft)
        .await
        .unwrap();

    drain(&p, JobKind::Publish).await;

    assert_eq!(mastodon.call_count(), 0);
    let item = p.store.get_item(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ContentStatus::Draft);
}

#[tokio::test]
async fn test_stalled_publish_job_recovers_on_redelivery() {
    let mastodon = MockAdapter::succeeding("mastodon");
    let p = pipeline(vec![mastodon.clone()]).await;
    // Zero-second lease: a claim stalls immediately.
    let stall_queue = Queue::new(p.store.pool().clone(), 0);

    let id = schedule_due(&p, vec!["mastodon"]).await;
    assert_eq!(p.scheduler.scan_due().await.unwrap(), 1);

    // A worker claims the job and flips the item to dispatching, then dies
    // before recording any outcome.
    let jobs = stall_queue.dequeue(JobKind::Publish, 1).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(p.store.mark_dispatching(&id).await.unwrap());

    let (requeued, failed) = stall_queue.reap_stalled().await.unwrap();
    assert_eq!((requeued, failed), (1, 0));

    // The redelivered job must still reach the adapter and finish the item.
    assert_eq!(drain(&p, JobKind::Publish).await, 1);
    assert_eq!(mastodon.call_count(), 1);
    assert_eq!(
        p.store.get_item(&id).await.unwrap().unwrap().status,
        ContentStatus::Posted
    );

    let stats = p.queue.stats().await.unwrap();
    assert_eq!(stats.waiting + stats.delayed + stats.leased, 0);
}

#[tokio::test]
async fn test_rate_limited_platform_recovers() {
    let twitter = MockAdapter::scripted(
        "twitter",
        vec![
            Err(PlatformError::RateLimited {
                message: "429".into(),
                retry_after: Some(1),
            }),
            Ok(()),
        ],
    );
    let p = pipeline(vec![twitter.clone()]).await;

    let id = schedule_due(&p, vec!["twitter"]).await;
    p.scheduler.scan_due().await.unwrap();
    drain(&p, JobKind::Publish).await;

    assert_eq!(
        p.store.get_item(&id).await.unwrap().unwrap().status,
        ContentStatus::Dispatching
    );

    // Wait out the 1s retry-after hint, then drain the released retry job.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let drained = drain(&p, JobKind::Retry).await;
    assert_eq!(drained, 1);

    assert_eq!(
        p.store.get_item(&id).await.unwrap().unwrap().status,
        ContentStatus::Posted
    );
    assert_eq!(twitter.call_count(), 2);
}
