//! In-memory queue broker.
//!
//! Tasks move `pending -> in_flight` when handed to a listener, leave on ack,
//! and move to `failed` on fail. Tasks in flight when a listener stops go back
//! to the front of `pending`. Clones of [`InMemoryQueueService`] share one
//! broker, so several buses in a process behave like processes sharing Redis.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Delivery, Listener, Queue, QueueConfig, QueueError, QueueService, Result};

/// Capacity of each listener's error stream.
const ERROR_CAPACITY: usize = 16;

#[derive(Default)]
struct EndpointState {
    pending: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    failed: Vec<Delivery>,
    pushed: usize,
    reject_pushes: bool,
    notify: Arc<Notify>,
    listeners: HashMap<u64, mpsc::Sender<QueueError>>,
}

#[derive(Default)]
struct Broker {
    endpoints: Mutex<HashMap<String, EndpointState>>,
    next_listener: AtomicU64,
}

impl Broker {
    async fn push(&self, endpoint: &str, delivery: Delivery) -> Result<()> {
        let mut endpoints = self.endpoints.lock().await;
        let state = endpoints.entry(endpoint.to_string()).or_default();
        if state.reject_pushes {
            return Err(QueueError::Rejected(format!("endpoint {} rejects pushes", endpoint)));
        }
        state.pending.push_back(delivery);
        state.pushed += 1;
        state.notify.notify_one();
        Ok(())
    }

    async fn take(&self, endpoint: &str) -> Option<Delivery> {
        let mut endpoints = self.endpoints.lock().await;
        let state = endpoints.get_mut(endpoint)?;
        let delivery = state.pending.pop_front()?;
        state.in_flight.insert(delivery.id.clone(), delivery.clone());
        Some(delivery)
    }

    async fn requeue(&self, endpoint: &str, id: &str) {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(state) = endpoints.get_mut(endpoint) {
            if let Some(delivery) = state.in_flight.remove(id) {
                state.pending.push_front(delivery);
            }
        }
    }

    async fn ack(&self, endpoint: &str, id: &str) {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(state) = endpoints.get_mut(endpoint) {
            state.in_flight.remove(id);
        }
    }

    async fn fail(&self, endpoint: &str, id: &str) {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(state) = endpoints.get_mut(endpoint) {
            if let Some(delivery) = state.in_flight.remove(id) {
                state.failed.push(delivery);
            }
        }
    }

    async fn notifier(&self, endpoint: &str) -> Arc<Notify> {
        let mut endpoints = self.endpoints.lock().await;
        endpoints
            .entry(endpoint.to_string())
            .or_default()
            .notify
            .clone()
    }

    async fn attach(&self, endpoint: &str, errors: mpsc::Sender<QueueError>) -> u64 {
        let token = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let mut endpoints = self.endpoints.lock().await;
        endpoints
            .entry(endpoint.to_string())
            .or_default()
            .listeners
            .insert(token, errors);
        token
    }

    async fn detach(&self, endpoint: &str, token: u64) {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(state) = endpoints.get_mut(endpoint) {
            state.listeners.remove(&token);
        }
    }

    async fn inspect<T>(&self, endpoint: &str, f: impl FnOnce(&EndpointState) -> T) -> Option<T> {
        let endpoints = self.endpoints.lock().await;
        endpoints.get(endpoint).map(f)
    }
}

/// Queue service backed by a shared in-process broker.
#[derive(Clone, Default)]
pub struct InMemoryQueueService {
    broker: Arc<Broker>,
    config: QueueConfig,
}

impl InMemoryQueueService {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            broker: Arc::default(),
            config,
        }
    }

    /// Another handle on the same broker with a different config.
    pub fn with_config(&self, config: QueueConfig) -> Self {
        Self {
            broker: self.broker.clone(),
            config,
        }
    }

    /// Total tasks ever accepted for an endpoint.
    pub async fn pushed(&self, endpoint: &str) -> usize {
        self.broker
            .inspect(endpoint, |s| s.pushed)
            .await
            .unwrap_or(0)
    }

    /// Tasks waiting for a listener.
    pub async fn pending(&self, endpoint: &str) -> usize {
        self.broker
            .inspect(endpoint, |s| s.pending.len())
            .await
            .unwrap_or(0)
    }

    /// Tasks delivered but neither acked nor failed.
    pub async fn in_flight(&self, endpoint: &str) -> usize {
        self.broker
            .inspect(endpoint, |s| s.in_flight.len())
            .await
            .unwrap_or(0)
    }

    /// Tasks reported on a fail sink.
    pub async fn failed(&self, endpoint: &str) -> usize {
        self.broker
            .inspect(endpoint, |s| s.failed.len())
            .await
            .unwrap_or(0)
    }

    /// Make pushes to an endpoint fail with [`QueueError::Rejected`].
    pub async fn set_reject_pushes(&self, endpoint: &str, reject: bool) {
        let mut endpoints = self.broker.endpoints.lock().await;
        endpoints.entry(endpoint.to_string()).or_default().reject_pushes = reject;
    }

    /// Raise an asynchronous error on every listener of an endpoint.
    ///
    /// Returns the number of listeners reached.
    pub async fn inject_error(&self, endpoint: &str, message: &str) -> usize {
        let endpoints = self.broker.endpoints.lock().await;
        let Some(state) = endpoints.get(endpoint) else {
            return 0;
        };
        state
            .listeners
            .values()
            .filter(|tx| {
                tx.try_send(QueueError::Connection(message.to_string()))
                    .is_ok()
            })
            .count()
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn open(&self, endpoint: &str) -> Result<Arc<dyn Queue>> {
        debug!(endpoint = %endpoint, "Opening in-memory queue");
        Ok(Arc::new(MemoryQueue::new(
            endpoint,
            self.broker.clone(),
            self.config.delivery_buffer,
        )))
    }
}

/// One endpoint's view of the broker.
pub struct MemoryQueue {
    endpoint: String,
    broker: Arc<Broker>,
    delivery_buffer: usize,
    shutdown: watch::Sender<bool>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

impl MemoryQueue {
    fn new(endpoint: &str, broker: Arc<Broker>, delivery_buffer: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            endpoint: endpoint.to_string(),
            broker,
            delivery_buffer: delivery_buffer.max(1),
            shutdown,
            pumps: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn push(&self, id: &str, payload: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let delivery = Delivery {
            id: id.to_string(),
            payload,
        };
        self.broker.push(&self.endpoint, delivery).await?;
        debug!(endpoint = %self.endpoint, id = %id, "Pushed task");
        Ok(())
    }

    async fn listen(&self) -> Result<Listener> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let (delivery_tx, deliveries) = mpsc::channel(self.delivery_buffer);
        let (acks, ack_rx) = mpsc::unbounded_channel();
        let (failures, fail_rx) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::channel(ERROR_CAPACITY);

        let token = self.broker.attach(&self.endpoint, error_tx).await;
        self.listeners.lock().await.push(token);

        let pump = tokio::spawn(pump(
            self.broker.clone(),
            self.endpoint.clone(),
            delivery_tx,
            self.shutdown.subscribe(),
        ));
        self.pumps.lock().await.push(pump);

        tokio::spawn(settle(
            self.broker.clone(),
            self.endpoint.clone(),
            ack_rx,
            fail_rx,
        ));

        info!(endpoint = %self.endpoint, "Listening on in-memory queue");

        Ok(Listener {
            deliveries,
            acks,
            failures,
            errors,
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let tokens = std::mem::take(&mut *self.listeners.lock().await);
        for token in tokens {
            self.broker.detach(&self.endpoint, token).await;
        }

        let pumps = std::mem::take(&mut *self.pumps.lock().await);
        let mut result = Ok(());
        for pump in pumps {
            if let Err(e) = pump.await {
                result = Err(QueueError::Connection(format!("listener task failed: {}", e)));
            }
        }

        debug!(endpoint = %self.endpoint, "Closed in-memory queue");
        result
    }
}

/// Move pending tasks to the listener until shutdown.
async fn pump(
    broker: Arc<Broker>,
    endpoint: String,
    tx: mpsc::Sender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    let notify = broker.notifier(&endpoint).await;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Some(delivery) = broker.take(&endpoint).await {
            let id = delivery.id.clone();
            tokio::select! {
                sent = tx.send(delivery) => {
                    if sent.is_err() {
                        broker.requeue(&endpoint, &id).await;
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    broker.requeue(&endpoint, &id).await;
                    break;
                }
            }
            continue;
        }

        tokio::select! {
            _ = notify.notified() => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!(endpoint = %endpoint, "Listener stopped");
}

/// Apply acks and fails until both sinks are dropped.
async fn settle(
    broker: Arc<Broker>,
    endpoint: String,
    mut acks: mpsc::UnboundedReceiver<String>,
    mut failures: mpsc::UnboundedReceiver<String>,
) {
    let mut acks_open = true;
    let mut failures_open = true;

    while acks_open || failures_open {
        tokio::select! {
            id = acks.recv(), if acks_open => match id {
                Some(id) => broker.ack(&endpoint, &id).await,
                None => acks_open = false,
            },
            id = failures.recv(), if failures_open => match id {
                Some(id) => broker.fail(&endpoint, &id).await,
                None => failures_open = false,
            },
        }
    }
}

#[cfg(test)]
mod tests;
