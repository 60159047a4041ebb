//! Reliable per-endpoint queues.
//!
//! This module contains:
//! - `QueueService` trait: opens one `Queue` per endpoint name
//! - `Queue` trait: durable push, live listening, close
//! - `Listener`: the delivery stream plus ack/fail sinks and an error stream
//! - Implementations: in-memory broker, Redis reliable lists (feature `redis`)
//!
//! Queues carry opaque JSON payloads; decoding into a message shape happens
//! in the bus.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryQueueService;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueueService;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue closed")]
    Closed,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Push rejected: {0}")]
    Rejected(String),

    #[error("Payload missing for task {0}")]
    MissingPayload(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// One task handed out by a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Task ID; echo it on the ack or fail sink.
    pub id: String,
    /// Encoded message.
    pub payload: Vec<u8>,
}

/// Live subscription to a queue.
///
/// The delivery stream ends when the queue is closed. Every delivered task
/// should be reported exactly once on either `acks` or `failures`.
pub struct Listener {
    pub deliveries: mpsc::Receiver<Delivery>,
    pub acks: mpsc::UnboundedSender<String>,
    pub failures: mpsc::UnboundedSender<String>,
    /// Errors not tied to a single push (connection drops, missing payloads).
    pub errors: mpsc::Receiver<QueueError>,
}

/// A durable queue for one endpoint.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Endpoint this queue serves.
    fn endpoint(&self) -> &str;

    /// Durably enqueue a task.
    async fn push(&self, id: &str, payload: Vec<u8>) -> Result<()>;

    /// Start listening for tasks.
    async fn listen(&self) -> Result<Listener>;

    /// Stop listening and release the connection.
    ///
    /// Once this returns, the delivery and error streams of any listener
    /// have ended.
    async fn close(&self) -> Result<()>;
}

/// Factory for per-endpoint queues.
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Arc<dyn Queue>>;
}

/// Queue configuration, passed through to the queue backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-bus-instance prefix. Endpoints are `prefix + delimiter + channel`.
    pub prefix: String,
    /// Separator used in endpoint names and backend keys.
    pub delimiter: String,
    /// Redis connection URL.
    pub url: String,
    /// Seconds a listener blocks waiting for work before re-checking for close.
    pub poll_timeout_secs: u64,
    /// Deliveries buffered between a listener and its consumer.
    pub delivery_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            delimiter: ":".to_string(),
            url: "redis://localhost:6379".to_string(),
            poll_timeout_secs: 1,
            delivery_buffer: 16,
        }
    }
}

impl QueueConfig {
    /// Config with the given instance prefix and defaults elsewhere.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }
}
