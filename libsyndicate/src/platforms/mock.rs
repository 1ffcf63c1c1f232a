//! Mock adapter for testing
//!
//! Configurable fake platform that replays a scripted sequence of outcomes.
//! Available in all builds (not just tests) so integration tests and the
//! worker's dry-run mode can exercise the full dispatch path without
//! credentials or network access.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::PlatformError;
use crate::platforms::{PlatformAdapter, PublishReceipt, PublishRequest};

/// Mock platform adapter.
///
/// Outcomes are consumed front-to-back from the script; once the script is
/// empty every further publish succeeds. Internals are shared through `Arc`
/// so a test can keep a clone for assertions while the dispatcher owns the
/// registered copy.
#[derive(Clone)]
pub struct MockAdapter {
    name: String,
    delay: Duration,
    script: Arc<Mutex<VecDeque<Result<(), PlatformError>>>>,
    call_count: Arc<Mutex<usize>>,
    published: Arc<Mutex<Vec<String>>>,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            script: Arc::new(Mutex::new(VecDeque::new())),
            call_count: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Adapter that always succeeds.
    pub fn succeeding(name: &str) -> Self {
        Self::new(name)
    }

    /// Adapter whose first publish fails with the given error, then succeeds.
    pub fn failing_once(name: &str, error: PlatformError) -> Self {
        let adapter = Self::new(name);
        adapter.push_outcome(Err(error));
        adapter
    }

    /// Adapter that replays the given outcomes in order.
    pub fn scripted(name: &str, outcomes: Vec<Result<(), PlatformError>>) -> Self {
        let adapter = Self::new(name);
        for outcome in outcomes {
            adapter.push_outcome(outcome);
        }
        adapter
    }

    /// Adapter that sleeps before answering, to exercise timeouts.
    pub fn with_delay(name: &str, delay: Duration) -> Self {
        let mut adapter = Self::new(name);
        adapter.delay = delay;
        adapter
    }

    pub fn push_outcome(&self, outcome: Result<(), PlatformError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// Content bodies of every successful publish, in order.
    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(
        &self,
        request: &PublishRequest,
    ) -> std::result::Result<PublishReceipt, PlatformError> {
        *self.call_count.lock().unwrap() += 1;

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Err(error)) => Err(error),
            _ => {
                self.published
                    .lock()
                    .unwrap()
                    .push(request.content.clone());
                let external_id = format!("{}:mock-{}", self.name, Uuid::new_v4());
                let url = Some(format!("https://{}.example/{}", self.name, external_id));
                Ok(PublishReceipt { external_id, url })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PublishRequest {
        PublishRequest {
            content_id: "c1".to_string(),
            team_id: "team".to_string(),
            content: "hello fediverse".to_string(),
            media_refs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_succeeding_adapter() {
        let adapter = MockAdapter::succeeding("mastodon");
        let receipt = adapter.publish(&request()).await.unwrap();

        assert!(receipt.external_id.starts_with("mastodon:mock-"));
        assert!(receipt.url.is_some());
        assert_eq!(adapter.call_count(), 1);
        assert_eq!(adapter.published(), vec!["hello fediverse".to_string()]);
    }

    #[tokio::test]
    async fn test_scripted_outcomes_in_order() {
        let adapter = MockAdapter::scripted(
            "twitter",
            vec![
                Err(PlatformError::Server("502".to_string())),
                Err(PlatformError::RateLimited {
                    message: "429".to_string(),
                    retry_after: Some(30),
                }),
                Ok(()),
            ],
        );

        assert!(matches!(
            adapter.publish(&request()).await,
            Err(PlatformError::Server(_))
        ));
        assert!(matches!(
            adapter.publish(&request()).await,
            Err(PlatformError::RateLimited { .. })
        ));
        assert!(adapter.publish(&request()).await.is_ok());
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_script_succeeds() {
        let adapter =
            MockAdapter::failing_once("linkedin", PlatformError::Network("reset".to_string()));

        assert!(adapter.publish(&request()).await.is_err());
        assert!(adapter.publish(&request()).await.is_ok());
        assert!(adapter.publish(&request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_delay_is_observed() {
        let adapter = MockAdapter::with_delay("slow", Duration::from_millis(50));
        let start = std::time::Instant::now();
        adapter.publish(&request()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let adapter = MockAdapter::succeeding("mastodon");
        let handle = adapter.clone();

        adapter.publish(&request()).await.unwrap();
        assert_eq!(handle.call_count(), 1);
    }
}
