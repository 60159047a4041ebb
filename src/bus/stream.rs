//! Consumer-facing streams: typed subscriptions and the bus error stream.

use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::endpoint::SharedDeliveries;
use super::BusError;
use crate::message::Message;

/// Typed view of an endpoint's local message stream.
///
/// Every subscription to the same channel on one bus shares a single
/// underlying stream; clones and repeated subscribes compete for messages
/// rather than each receiving a copy. Each view decodes into its own `M`.
pub struct Subscription<M> {
    endpoint: Arc<str>,
    deliveries: SharedDeliveries,
    errors: Arc<ErrorSink>,
    _shape: PhantomData<fn() -> M>,
}

impl<M> Subscription<M> {
    pub(crate) fn new(endpoint: Arc<str>, deliveries: SharedDeliveries, errors: Arc<ErrorSink>) -> Self {
        Self {
            endpoint,
            deliveries,
            errors,
            _shape: PhantomData,
        }
    }

    /// Endpoint this subscription reads from.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl<M: Message> Subscription<M> {
    /// Wait for the next message.
    ///
    /// Returns `None` once the endpoint has been unsubscribed or the bus
    /// closed and everything already handed over has been read. Payloads
    /// that do not decode as `M` are reported on the bus error stream and
    /// skipped.
    pub async fn recv(&self) -> Option<M> {
        loop {
            let payload = self.deliveries.lock().await.recv().await?;
            match serde_json::from_slice::<M>(&payload) {
                Ok(message) => return Some(message),
                Err(source) => {
                    warn!(endpoint = %self.endpoint, error = %source, "Dropping undecodable message");
                    self.errors.report(BusError::Decode {
                        endpoint: self.endpoint.to_string(),
                        source,
                    });
                }
            }
        }
    }

    /// Convert into a `Stream` of messages.
    pub fn into_stream(self) -> BoxStream<'static, M> {
        stream::unfold(self, |subscription| async move {
            let message = subscription.recv().await?;
            Some((message, subscription))
        })
        .boxed()
    }
}

impl<M> Clone for Subscription<M> {
    fn clone(&self) -> Self {
        Self::new(self.endpoint.clone(), self.deliveries.clone(), self.errors.clone())
    }
}

impl<M> fmt::Debug for Subscription<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Producer side of the bus error stream.
///
/// Reporting never blocks: when the stream is full the error is logged and
/// dropped. After [`close`](Self::close) every report is dropped.
pub(crate) struct ErrorSink {
    tx: Mutex<Option<mpsc::Sender<BusError>>>,
}

impl ErrorSink {
    pub(crate) fn new(capacity: usize) -> (Arc<Self>, ErrorStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        });
        (sink, ErrorStream { rx })
    }

    /// Queue an error for consumers. Returns whether it was accepted.
    pub(crate) fn report(&self, error: BusError) -> bool {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            debug!(error = %error, "Error stream closed, dropping error");
            return false;
        };
        match tx.try_send(error) {
            Ok(()) => true,
            Err(TrySendError::Full(error)) => {
                warn!(error = %error, "Error stream full, dropping error");
                false
            }
            Err(TrySendError::Closed(error)) => {
                debug!(error = %error, "Error stream dropped by consumer");
                false
            }
        }
    }

    /// End the stream. Buffered errors remain readable.
    pub(crate) fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Asynchronous errors from every part of a bus.
///
/// Ends after the bus is closed and buffered errors are drained.
#[derive(Debug)]
pub struct ErrorStream {
    rx: mpsc::Receiver<BusError>,
}

impl ErrorStream {
    /// Wait for the next error.
    pub async fn recv(&mut self) -> Option<BusError> {
        self.rx.recv().await
    }

    /// Take an error if one is buffered.
    pub fn try_recv(&mut self) -> Option<BusError> {
        self.rx.try_recv().ok()
    }
}

impl Stream for ErrorStream {
    type Item = BusError;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
