//! Per-endpoint queue handle.
//!
//! Wraps one backend [`Queue`] with a lazily started local message stream.
//! The first call to [`EndpointQueue::messages`] starts listening and spawns
//! two forwarders: one hands each delivery to the local stream and then acks
//! it, the other relays backend errors to the bus error stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::stream::ErrorSink;
use super::BusError;
use crate::closer::{BoxError, Closable};
use crate::queue::{Delivery, Listener, Queue, QueueError};

/// Raw payload stream shared by every subscription to one endpoint.
pub(crate) type SharedDeliveries = Arc<Mutex<mpsc::Receiver<Vec<u8>>>>;

/// Handle to one endpoint's queue.
pub(crate) struct EndpointQueue {
    endpoint: Arc<str>,
    queue: Arc<dyn Queue>,
    stream: Mutex<Option<SharedDeliveries>>,
    stream_buffer: usize,
}

impl EndpointQueue {
    pub(crate) fn new(queue: Arc<dyn Queue>, stream_buffer: usize) -> Self {
        Self {
            endpoint: Arc::from(queue.endpoint()),
            queue,
            stream: Mutex::new(None),
            stream_buffer: stream_buffer.max(1),
        }
    }

    pub(crate) fn endpoint(&self) -> &Arc<str> {
        &self.endpoint
    }

    pub(crate) async fn push(&self, id: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.queue
            .push(id, payload)
            .await
            .map_err(|e| BusError::queue(&self.endpoint, e))
    }

    /// The local message stream, started on first use.
    pub(crate) async fn messages(&self, errors: &Arc<ErrorSink>) -> Result<SharedDeliveries, BusError> {
        let mut stream = self.stream.lock().await;
        if let Some(existing) = stream.as_ref() {
            return Ok(existing.clone());
        }

        let Listener {
            deliveries,
            acks,
            failures,
            errors: queue_errors,
        } = self
            .queue
            .listen()
            .await
            .map_err(|e| BusError::queue(&self.endpoint, e))?;

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        tokio::spawn(forward_deliveries(
            self.endpoint.clone(),
            deliveries,
            acks,
            failures,
            tx,
        ));
        tokio::spawn(forward_errors(
            self.endpoint.clone(),
            queue_errors,
            errors.clone(),
        ));

        debug!(endpoint = %self.endpoint, "Started endpoint stream");
        let shared = Arc::new(Mutex::new(rx));
        *stream = Some(shared.clone());
        Ok(shared)
    }

    /// Stop listening and release the backend queue.
    pub(crate) async fn close(&self) -> Result<(), BusError> {
        self.queue
            .close()
            .await
            .map_err(|e| BusError::queue(&self.endpoint, e))
    }
}

#[async_trait]
impl Closable for EndpointQueue {
    async fn close(&self) -> Result<(), BoxError> {
        EndpointQueue::close(self).await.map_err(Into::into)
    }
}

/// Hand each delivery to the local stream, then ack it.
///
/// Deliveries are never failed here: a message counts as done once a local
/// consumer can read it. The failure sink is held only so it closes together
/// with the ack sink.
async fn forward_deliveries(
    endpoint: Arc<str>,
    mut deliveries: mpsc::Receiver<Delivery>,
    acks: mpsc::UnboundedSender<String>,
    _failures: mpsc::UnboundedSender<String>,
    tx: mpsc::Sender<Vec<u8>>,
) {
    while let Some(Delivery { id, payload }) = deliveries.recv().await {
        if tx.send(payload).await.is_err() {
            // Local stream gone; leave the task unacked for the backend to keep.
            debug!(endpoint = %endpoint, task = %id, "Local stream dropped, stopping forwarder");
            return;
        }
        if acks.send(id).is_err() {
            warn!(endpoint = %endpoint, "Ack sink closed while forwarding");
            return;
        }
    }
    debug!(endpoint = %endpoint, "Endpoint stream ended");
}

/// Relay backend errors until the queue or the bus error stream closes.
async fn forward_errors(
    endpoint: Arc<str>,
    mut errors: mpsc::Receiver<QueueError>,
    sink: Arc<ErrorSink>,
) {
    while let Some(source) = errors.recv().await {
        if sink.is_closed() {
            return;
        }
        sink.report(BusError::queue(&endpoint, source));
    }
}
