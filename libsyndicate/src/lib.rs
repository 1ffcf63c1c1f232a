//! Syndicate - scheduling and dispatch engine for multi-platform publishing
//!
//! This library provides the core of a content syndication service: a
//! durable work queue, a scheduler (fixed-time, optimal-time, recurring
//! scan), a concurrent per-platform dispatcher, and a retry controller
//! driven by a pure backoff policy.

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod notify;
pub mod platforms;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use backoff::BackoffPolicy;
pub use config::Config;
pub use db::{ContentStore, ItemWithOutcomes};
pub use dispatcher::Dispatcher;
pub use error::{PlatformError, Result, SyndicateError};
pub use notify::{Event, EventBus};
pub use queue::{EnqueueOptions, Queue, RecurringTicker};
pub use retry::RetryController;
pub use scheduler::Scheduler;
pub use types::{ContentItem, ContentStatus, JobKind, JobPayload, QueueEntry, QueueStats};
