//! In-memory discovery registry.
//!
//! Clones share the same registry, so several buses in one process see each
//! other's registrations the way separate processes would through Redis.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Discovery, DiscoveryError, Result};

#[derive(Default)]
struct Registry {
    channels: RwLock<HashMap<String, BTreeSet<String>>>,
    lookups: AtomicUsize,
    fail_on_register: RwLock<bool>,
    fail_on_unregister: RwLock<bool>,
    fail_on_subscribers: RwLock<bool>,
}

/// Set-backed registry held in process memory.
#[derive(Clone, Default)]
pub struct InMemoryDiscovery {
    inner: Arc<Registry>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `subscribers` calls served so far.
    pub fn lookup_count(&self) -> usize {
        self.inner.lookups.load(Ordering::SeqCst)
    }

    pub async fn set_fail_on_register(&self, fail: bool) {
        *self.inner.fail_on_register.write().await = fail;
    }

    pub async fn set_fail_on_unregister(&self, fail: bool) {
        *self.inner.fail_on_unregister.write().await = fail;
    }

    pub async fn set_fail_on_subscribers(&self, fail: bool) {
        *self.inner.fail_on_subscribers.write().await = fail;
    }
}

#[async_trait]
impl Discovery for InMemoryDiscovery {
    async fn register(&self, channel: &str, endpoint: &str) -> Result<()> {
        if *self.inner.fail_on_register.read().await {
            return Err(DiscoveryError::Unavailable("register rejected".to_string()));
        }
        let mut channels = self.inner.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_default()
            .insert(endpoint.to_string());
        debug!(channel = %channel, endpoint = %endpoint, "Registered endpoint");
        Ok(())
    }

    async fn unregister(&self, channel: &str, endpoint: &str) -> Result<()> {
        if *self.inner.fail_on_unregister.read().await {
            return Err(DiscoveryError::Unavailable("unregister rejected".to_string()));
        }
        let mut channels = self.inner.channels.write().await;
        if let Some(endpoints) = channels.get_mut(channel) {
            endpoints.remove(endpoint);
            if endpoints.is_empty() {
                channels.remove(channel);
            }
        }
        debug!(channel = %channel, endpoint = %endpoint, "Unregistered endpoint");
        Ok(())
    }

    async fn subscribers(&self, channel: &str) -> Result<Vec<String>> {
        self.inner.lookups.fetch_add(1, Ordering::SeqCst);
        if *self.inner.fail_on_subscribers.read().await {
            return Err(DiscoveryError::Unavailable("lookup rejected".to_string()));
        }
        let channels = self.inner.channels.read().await;
        Ok(channels
            .get(channel)
            .map(|endpoints| endpoints.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let disco = InMemoryDiscovery::new();
        disco.register("orders", "bus-a:orders").await.unwrap();
        disco.register("orders", "bus-a:orders").await.unwrap();
        disco.register("orders", "bus-b:orders").await.unwrap();

        let subs = disco.subscribers("orders").await.unwrap();
        assert_eq!(subs, vec!["bus-a:orders", "bus-b:orders"]);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_empty() {
        let disco = InMemoryDiscovery::new();
        assert!(disco.subscribers("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister() {
        let disco = InMemoryDiscovery::new();
        disco.register("orders", "bus-a:orders").await.unwrap();
        disco.unregister("orders", "bus-a:orders").await.unwrap();
        // Unregistering an absent endpoint is fine.
        disco.unregister("orders", "bus-a:orders").await.unwrap();

        assert!(disco.subscribers("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_registry() {
        let disco = InMemoryDiscovery::new();
        let other = disco.clone();
        disco.register("orders", "bus-a:orders").await.unwrap();

        assert_eq!(other.subscribers("orders").await.unwrap().len(), 1);
        assert_eq!(disco.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_toggles() {
        let disco = InMemoryDiscovery::new();
        disco.set_fail_on_register(true).await;
        disco.set_fail_on_subscribers(true).await;

        assert!(matches!(
            disco.register("orders", "e").await,
            Err(DiscoveryError::Unavailable(_))
        ));
        assert!(disco.subscribers("orders").await.is_err());
        assert_eq!(disco.lookup_count(), 1);
    }
}
