//! Redis discovery registry.
//!
//! Each channel is a Redis set of endpoint names under
//! `{prefix}{delimiter}{channel}`.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, info};

use super::{channel_key, Discovery, Result};

/// Set-backed registry stored in Redis.
pub struct RedisDiscovery {
    conn: ConnectionManager,
    prefix: String,
    delimiter: String,
}

impl RedisDiscovery {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `prefix` - Key prefix; must match on every node of a pub/sub network
    /// * `delimiter` - Separator between prefix and channel
    pub async fn new(url: &str, prefix: &str, delimiter: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, prefix = %prefix, "Connected to Redis for discovery");

        Ok(Self::with_connection(conn, prefix, delimiter))
    }

    /// Build on an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, prefix: &str, delimiter: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            delimiter: delimiter.to_string(),
        }
    }

    fn key(&self, channel: &str) -> String {
        channel_key(&self.prefix, &self.delimiter, channel)
    }
}

#[async_trait]
impl Discovery for RedisDiscovery {
    async fn register(&self, channel: &str, endpoint: &str) -> Result<()> {
        let key = self.key(channel);
        let mut conn = self.conn.clone();

        let _: () = conn.sadd(&key, endpoint).await?;

        debug!(key = %key, endpoint = %endpoint, "Registered endpoint");
        Ok(())
    }

    async fn unregister(&self, channel: &str, endpoint: &str) -> Result<()> {
        let key = self.key(channel);
        let mut conn = self.conn.clone();

        let _: () = conn.srem(&key, endpoint).await?;

        debug!(key = %key, endpoint = %endpoint, "Unregistered endpoint");
        Ok(())
    }

    async fn subscribers(&self, channel: &str) -> Result<Vec<String>> {
        let key = self.key(channel);
        let mut conn = self.conn.clone();

        let endpoints: Vec<String> = conn.smembers(&key).await?;
        Ok(endpoints)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
