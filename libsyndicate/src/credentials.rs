//! Credential lookup and short-lived auth state
//!
//! Credentials are an external concern; the core only needs an opaque
//! lookup seam ([`CredentialProvider`]). Transient auth state (OAuth
//! round-trip tokens and the like) lives in an [`ExpiringStore`]: a
//! mutex-guarded map with per-entry deadlines and an explicit background
//! sweep task, started on process init and stopped on shutdown.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::Result;

/// Per-team, per-platform credential material. Opaque to the core.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub refresh_token: Option<String>,
}

/// Lookup seam for per-team platform credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn lookup(&self, team_id: &str, platform: &str) -> Result<Option<Credential>>;
}

/// In-memory provider keyed by (team, platform). Used by tests and the
/// worker's dry-run mode.
#[derive(Default)]
pub struct StaticCredentials {
    entries: HashMap<(String, String), Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, team_id: &str, platform: &str, credential: Credential) {
        self.entries
            .insert((team_id.to_string(), platform.to_string()), credential);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn lookup(&self, team_id: &str, platform: &str) -> Result<Option<Credential>> {
        Ok(self
            .entries
            .get(&(team_id.to_string(), platform.to_string()))
            .cloned())
    }
}

/// Expiring key-value store with explicit ownership and lifecycle.
///
/// Entries expire `ttl` after insertion. Reads never return expired values;
/// the sweep task reclaims their memory in the background.
#[derive(Clone)]
pub struct ExpiringStore<V: Clone + Send + 'static> {
    entries: Arc<Mutex<HashMap<String, (V, Instant)>>>,
    ttl: Duration,
}

impl<V: Clone + Send + 'static> ExpiringStore<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn insert(&self, key: &str, value: V) {
        let deadline = Instant::now() + self.ttl;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, deadline));
    }

    /// Fetch a live value. Expired entries read as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, deadline)) if *deadline > Instant::now() => Some(value.clone()),
            _ => None,
        }
    }

    /// Fetch and consume a live value in one step (single-use tokens).
    pub fn take(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(key) {
            Some((value, deadline)) if deadline > Instant::now() => Some(value),
            _ => None,
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Live entry count; expired-but-unswept entries are not counted.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|(_, deadline)| *deadline > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns the number reclaimed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, (_, deadline)| *deadline > now);
        before - entries.len()
    }

    /// Start the background sweep task. The handle stops it on `stop()`
    /// or drop.
    pub fn start_sweeper(&self, interval: Duration) -> SweeperHandle {
        let store = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let swept = store.sweep();
                if swept > 0 {
                    debug!(swept, "expired auth-state entries reclaimed");
                }
            }
        });

        SweeperHandle { handle }
    }
}

/// Handle to the background sweep task.
pub struct SweeperHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
