//! Shared utilities for bus integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relaybus::discovery::Discovery;
use relaybus::queue::QueueService;
use relaybus::{Bus, BusConfig, Message, MessageId, Subscription};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// How long a test waits for a message before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests, honouring `RELAYBUS_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(relaybus::config::LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Unique instance prefix so concurrent tests never share endpoints.
pub fn unique_prefix(name: &str) -> String {
    format!("{}-{}", name, Uuid::new_v4().simple())
}

/// Build a bus with uncached subscriber lookups.
pub fn build_bus(
    queues: Arc<dyn QueueService>,
    discovery: Arc<dyn Discovery>,
    prefix: &str,
) -> Bus {
    let config = BusConfig::with_prefix(prefix).subscriber_ttl(Duration::ZERO);
    Bus::new(queues, config, discovery)
}

/// Structured message used across integration tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    #[serde(flatten)]
    pub mq: MessageId,
    pub from: String,
    pub seq: u32,
}

impl Greeting {
    pub fn new(from: &str, seq: u32) -> Self {
        Self {
            mq: MessageId::default(),
            from: from.to_string(),
            seq,
        }
    }
}

impl Message for Greeting {
    fn id(&mut self) -> &str {
        self.mq.get_or_init()
    }
}

/// Receive one message or panic after [`RECV_TIMEOUT`].
pub async fn recv<M: Message>(subscription: &Subscription<M>) -> M {
    tokio::time::timeout(RECV_TIMEOUT, subscription.recv())
        .await
        .expect("timeout waiting for message")
        .expect("subscription ended")
}

/// Assert nothing arrives within `wait`.
pub async fn assert_silent<M: Message + std::fmt::Debug>(subscription: &Subscription<M>, wait: Duration) {
    if let Ok(message) = tokio::time::timeout(wait, subscription.recv()).await {
        panic!("unexpected message: {message:?}");
    }
}

/// Assert the subscription reports end-of-stream.
pub async fn assert_ended<M: Message + std::fmt::Debug>(subscription: &Subscription<M>) {
    let next = tokio::time::timeout(RECV_TIMEOUT, subscription.recv())
        .await
        .expect("timeout waiting for end of stream");
    assert!(next.is_none(), "stream still open: {next:?}");
}
