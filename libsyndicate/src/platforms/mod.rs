//! Platform adapter abstraction
//!
//! Each target platform is reached through a [`PlatformAdapter`]. Adapters are
//! handed fully-resolved publish requests and report either a receipt or a
//! classified [`PlatformError`]; the dispatcher and retry controller act on
//! the classification, never on adapter internals.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PlatformError;

pub mod mock;

/// Everything an adapter needs to publish one item to one platform.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub content_id: String,
    pub team_id: String,
    pub content: String,
    /// Ordered opaque references to media objects
    pub media_refs: Vec<String>,
}

/// Proof of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    /// Platform-assigned identifier of the created post
    pub external_id: String,
    pub url: Option<String>,
}

/// Unified interface to one publishing target.
///
/// Implementations classify their failures: permanent classes (auth,
/// forbidden, duplicate, malformed) stop retries, everything else is fair
/// game for backoff.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Lowercase platform identifier (e.g. "mastodon", "linkedin")
    fn name(&self) -> &str;

    /// Publish the request, returning a receipt or a classified error.
    async fn publish(
        &self,
        request: &PublishRequest,
    ) -> std::result::Result<PublishReceipt, PlatformError>;
}

/// Adapters keyed by platform id. Shared across the dispatcher's workers.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(platform).cloned()
    }

    pub fn platform_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockAdapter;
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::succeeding("mastodon")));
        registry.register(Arc::new(MockAdapter::succeeding("twitter")));

        assert!(registry.get("mastodon").is_some());
        assert!(registry.get("bluesky").is_none());
        assert_eq!(registry.platform_names(), vec!["mastodon", "twitter"]);
    }

    #[test]
    fn test_registry_replaces_same_name() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::succeeding("mastodon")));
        registry.register(Arc::new(MockAdapter::succeeding("mastodon")));
        assert_eq!(registry.platform_names().len(), 1);
    }
}
