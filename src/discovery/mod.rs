//! Endpoint discovery.
//!
//! Maps channels to the endpoints subscribed to them.
//!
//! Implementations:
//! - `InMemoryDiscovery`: shared in-process registry
//! - `RedisDiscovery`: Redis set per channel (feature `redis`)

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryDiscovery;
#[cfg(feature = "redis")]
pub use self::redis::RedisDiscovery;

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors that can occur during discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Registry of channel subscribers.
///
/// Registration is additive and idempotent: registering the same
/// (channel, endpoint) pair twice leaves a single entry.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Register an endpoint as listening on a channel.
    async fn register(&self, channel: &str, endpoint: &str) -> Result<()>;

    /// Remove an endpoint from a channel.
    async fn unregister(&self, channel: &str, endpoint: &str) -> Result<()>;

    /// List endpoints subscribed to a channel. Unknown channels yield an empty list.
    async fn subscribers(&self, channel: &str) -> Result<Vec<String>>;

    /// Release any resources held by the registry.
    async fn close(&self) -> Result<()>;
}

/// Build the registry key for a channel.
pub(crate) fn channel_key(prefix: &str, delimiter: &str, channel: &str) -> String {
    format!("{}{}{}", prefix, delimiter, channel)
}
