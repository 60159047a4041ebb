//! Time-bounded cache of channel subscriber lists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::discovery::{Discovery, DiscoveryError};

/// Snapshot of the endpoints subscribed to a channel.
pub type Subscribers = Arc<[String]>;

struct Entry {
    endpoints: Subscribers,
    fetched: Instant,
}

/// Caches `Discovery::subscribers` per channel.
///
/// A fresh entry is returned without touching discovery. Lookups for one
/// channel are serialized, so concurrent misses cost a single query. Failed
/// lookups are not cached. A zero TTL always queries discovery.
pub struct SubscriberCache {
    discovery: Arc<dyn Discovery>,
    ttl: Duration,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Entry>>>>>,
}

impl SubscriberCache {
    pub fn new(discovery: Arc<dyn Discovery>, ttl: Duration) -> Self {
        Self {
            discovery,
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Endpoints subscribed to `channel`, at most `ttl` old.
    pub async fn subscribers(&self, channel: &str) -> Result<Subscribers, DiscoveryError> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .clone();

        let mut entry = slot.lock().await;
        if let Some(cached) = entry.as_ref() {
            if cached.fetched.elapsed() < self.ttl {
                return Ok(cached.endpoints.clone());
            }
        }

        let endpoints: Subscribers = self.discovery.subscribers(channel).await?.into();
        debug!(channel, count = endpoints.len(), "Refreshed subscriber list");
        *entry = Some(Entry {
            endpoints: endpoints.clone(),
            fetched: Instant::now(),
        });
        Ok(endpoints)
    }
}
