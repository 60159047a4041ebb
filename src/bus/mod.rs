//! Channel pub/sub over reliable queues.
//!
//! This module contains:
//! - `Bus`: subscribe, publish, unsubscribe, close
//! - `Subscription`: typed view of an endpoint's message stream
//! - `ErrorStream`: asynchronous errors from every part of a bus
//! - `SubscriberCache`: TTL cache over discovery lookups
//!
//! Each bus instance owns one endpoint per channel, named
//! `prefix + delimiter + channel`. Subscribing registers that endpoint with
//! discovery; publishing looks up every endpoint on the channel and pushes
//! the message to each one's queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::closer::CloseGroup;
use crate::config::BusConfig;
use crate::discovery::Discovery;
use crate::message::{self, Message};
use crate::queue::QueueService;

mod cache;
mod endpoint;
mod error;
mod stream;

pub use cache::{SubscriberCache, Subscribers};
pub use error::{BusError, Result, SubscribeError};
pub use stream::{ErrorStream, Subscription};

use endpoint::EndpointQueue;
use stream::ErrorSink;

// ============================================================================
// Publish outcome
// ============================================================================

/// Per-endpoint outcome of a publish.
#[derive(Debug, Default)]
pub struct PublishReport {
    /// ID carried by the published message.
    pub id: String,
    /// Endpoints the message was pushed to.
    pub delivered: Vec<String>,
    /// Endpoints whose push failed, in discovery order.
    pub failed: Vec<(String, BusError)>,
}

impl PublishReport {
    fn new(id: String) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    /// Collapse to the last failure, if any.
    pub fn into_result(mut self) -> Result<()> {
        match self.failed.pop() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// A pub/sub bus instance.
///
/// Cheap to share behind an `Arc`; every operation takes `&self`.
pub struct Bus {
    config: BusConfig,
    discovery: Arc<dyn Discovery>,
    queues: Arc<dyn QueueService>,
    subscribers: SubscriberCache,
    handles: Mutex<HashMap<String, Arc<EndpointQueue>>>,
    errors: Arc<ErrorSink>,
    error_stream: StdMutex<Option<ErrorStream>>,
    closed: AtomicBool,
}

impl Bus {
    /// Create a bus over a queue service and a discovery registry.
    pub fn new(
        queues: Arc<dyn QueueService>,
        config: BusConfig,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        let subscribers = SubscriberCache::new(discovery.clone(), config.subscriber_ttl_duration());
        let (errors, error_stream) = ErrorSink::new(config.error_buffer);

        info!(
            prefix = %config.queue.prefix,
            subscriber_ttl = ?config.subscriber_ttl_duration(),
            "Bus created"
        );

        Self {
            config,
            discovery,
            queues,
            subscribers,
            handles: Mutex::new(HashMap::new()),
            errors,
            error_stream: StdMutex::new(Some(error_stream)),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a bus backed by Redis queues and Redis discovery.
    ///
    /// `discovery_prefix` must be the same on every node of the network.
    #[cfg(feature = "redis")]
    pub async fn redis(config: BusConfig, discovery_prefix: &str) -> Result<Self> {
        use crate::discovery::RedisDiscovery;
        use crate::queue::RedisQueueService;

        let queues = RedisQueueService::new(config.queue.clone())
            .await
            .map_err(|e| BusError::queue(&config.queue.url, e))?;
        let discovery =
            RedisDiscovery::new(&config.queue.url, discovery_prefix, &config.queue.delimiter)
                .await?;

        Ok(Self::new(Arc::new(queues), config, Arc::new(discovery)))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// This instance's endpoint for `channel`.
    pub fn endpoint(&self, channel: &str) -> String {
        format!(
            "{}{}{}",
            self.config.queue.prefix, self.config.queue.delimiter, channel
        )
    }

    /// Take the bus error stream. Only the first call gets it.
    pub fn errors(&self) -> Option<ErrorStream> {
        self.error_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Endpoints with an open local queue handle.
    pub async fn open_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<_> = self.handles.lock().await.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Listen on `channel`.
    ///
    /// Registers this instance's endpoint with discovery, then returns a
    /// stream of messages published to the channel. Repeated subscribes to
    /// one channel share a single stream. If registration fails the stream
    /// is still built and returned inside [`SubscribeError::Registration`].
    #[tracing::instrument(name = "bus.subscribe", skip_all, fields(channel = %channel))]
    pub async fn subscribe<M: Message>(
        &self,
        channel: &str,
    ) -> std::result::Result<Subscription<M>, SubscribeError<M>> {
        self.ensure_open()?;
        let endpoint = self.endpoint(channel);

        let registration = self.discovery.register(channel, &endpoint).await;

        let handle = self.handle(&endpoint).await?;
        let deliveries = handle.messages(&self.errors).await?;
        let subscription = Subscription::new(handle.endpoint().clone(), deliveries, self.errors.clone());

        match registration {
            Ok(()) => {
                debug!(endpoint = %endpoint, "Subscribed");
                Ok(subscription)
            }
            Err(source) => {
                warn!(endpoint = %endpoint, error = %source, "Registration failed, stream still open");
                Err(SubscribeError::Registration {
                    source,
                    subscription,
                })
            }
        }
    }

    /// Deliver `message` to every endpoint subscribed to `channel`.
    ///
    /// Materializes the message ID first. This instance's own endpoint is
    /// skipped unless `echo` is set. Every endpoint is attempted even when
    /// some fail; the last failure is returned.
    pub async fn publish<M: Message>(&self, channel: &str, message: &mut M) -> Result<()> {
        self.publish_report(channel, message).await?.into_result()
    }

    /// Like [`publish`](Self::publish), reporting the outcome per endpoint.
    ///
    /// Errors before fan-out (closed bus, encoding, subscriber lookup) are
    /// returned directly.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(channel = %channel))]
    pub async fn publish_report<M: Message>(
        &self,
        channel: &str,
        message: &mut M,
    ) -> Result<PublishReport> {
        self.ensure_open()?;
        let (id, payload) = message::encode(message).map_err(BusError::Encode)?;
        let subscribers = self.subscribers.subscribers(channel).await?;

        let own = self.endpoint(channel);
        let endpoints: Vec<&String> = subscribers
            .iter()
            .filter(|endpoint| self.config.echo || **endpoint != own)
            .collect();

        let pushes = endpoints.iter().map(|endpoint| {
            let (id, payload) = (&id, payload.clone());
            async move {
                let handle = self.handle(endpoint).await?;
                handle.push(id, payload).await
            }
        });
        let outcomes = join_all(pushes).await;

        let mut report = PublishReport::new(id);
        for (endpoint, outcome) in endpoints.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered.push(endpoint.clone()),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Publish to endpoint failed");
                    report.failed.push((endpoint.clone(), e));
                }
            }
        }

        debug!(
            id = %report.id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Published"
        );
        Ok(report)
    }

    /// Stop listening on `channel`.
    ///
    /// Closes the local queue handle (if any) and removes the endpoint from
    /// discovery concurrently, then waits for both.
    #[tracing::instrument(name = "bus.unsubscribe", skip_all, fields(channel = %channel))]
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.ensure_open()?;
        let endpoint = self.endpoint(channel);
        let handle = self.handles.lock().await.remove(&endpoint);

        let mut group = CloseGroup::new().timeout(self.config.close_timeout_duration());
        match handle {
            Some(handle) => group.close(handle),
            None => {
                debug!(endpoint = %endpoint, "No local queue to close");
                group.bypass();
            }
        }

        let discovery = self.discovery.clone();
        let channel = channel.to_string();
        group.spawn(async move {
            discovery
                .unregister(&channel, &endpoint)
                .await
                .map_err(BusError::from)
        });

        group.wait().await?;
        Ok(())
    }

    /// Shut the bus down.
    ///
    /// Closes discovery and every open queue handle concurrently, then ends
    /// the error stream. Closing twice is a no-op.
    #[tracing::instrument(name = "bus.close", skip_all, fields(prefix = %self.config.queue.prefix))]
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handles: Vec<_> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
        let mut group = CloseGroup::new().timeout(self.config.close_timeout_duration());

        let discovery = self.discovery.clone();
        group.spawn(async move { discovery.close().await.map_err(BusError::from) });
        for handle in handles {
            group.close(handle);
        }

        let closed = group.len();
        let outcome = group.wait().await;
        self.errors.close();

        info!(resources = closed, ok = outcome.is_ok(), "Bus closed");
        outcome.map_err(BusError::from)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    /// The queue handle for `endpoint`, opened on first use.
    async fn handle(&self, endpoint: &str) -> Result<Arc<EndpointQueue>> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(endpoint) {
            return Ok(handle.clone());
        }
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let queue = self
            .queues
            .open(endpoint)
            .await
            .map_err(|e| BusError::queue(endpoint, e))?;
        let handle = Arc::new(EndpointQueue::new(queue, self.config.stream_buffer));
        handles.insert(endpoint.to_string(), handle.clone());
        debug!(endpoint = %endpoint, "Opened queue handle");
        Ok(handle)
    }
}
