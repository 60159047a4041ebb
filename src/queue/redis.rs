//! Redis reliable queue.
//!
//! Key layout for an endpoint `E` with delimiter `:`:
//! - `E:todo` list of task IDs waiting for a listener
//! - `E:doing` list of task IDs handed out but not settled
//! - `E:failed` list of task IDs reported on the fail sink
//! - `E:tasks` hash of task ID to payload
//!
//! Listeners move IDs `todo -> doing` with BRPOPLPUSH, so a crash between
//! delivery and ack leaves the task in `doing` rather than losing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Delivery, Listener, Queue, QueueConfig, QueueError, QueueService, Result};

/// Capacity of each listener's error stream.
const ERROR_CAPACITY: usize = 16;

/// Queue service storing tasks in Redis.
#[derive(Clone)]
pub struct RedisQueueService {
    client: Client,
    conn: ConnectionManager,
    config: QueueConfig,
}

impl RedisQueueService {
    /// Connect using `config.url`.
    pub async fn new(config: QueueConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!(url = %config.url, prefix = %config.prefix, "Connected to Redis for queues");

        Ok(Self::with_connection(client, conn, config))
    }

    /// Build on an existing client and connection manager.
    pub fn with_connection(client: Client, conn: ConnectionManager, config: QueueConfig) -> Self {
        Self {
            client,
            conn,
            config,
        }
    }
}

#[async_trait]
impl QueueService for RedisQueueService {
    async fn open(&self, endpoint: &str) -> Result<Arc<dyn Queue>> {
        debug!(endpoint = %endpoint, "Opening Redis queue");
        Ok(Arc::new(RedisQueue::new(
            endpoint,
            self.client.clone(),
            self.conn.clone(),
            &self.config,
        )))
    }
}

#[derive(Clone)]
struct Keys {
    todo: String,
    doing: String,
    failed: String,
    tasks: String,
}

impl Keys {
    fn new(endpoint: &str, delimiter: &str) -> Self {
        let key = |suffix: &str| format!("{}{}{}", endpoint, delimiter, suffix);
        Self {
            todo: key("todo"),
            doing: key("doing"),
            failed: key("failed"),
            tasks: key("tasks"),
        }
    }
}

/// One endpoint's reliable queue.
pub struct RedisQueue {
    endpoint: String,
    keys: Keys,
    client: Client,
    conn: ConnectionManager,
    poll_timeout: Duration,
    delivery_buffer: usize,
    shutdown: watch::Sender<bool>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisQueue {
    fn new(endpoint: &str, client: Client, conn: ConnectionManager, config: &QueueConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            endpoint: endpoint.to_string(),
            keys: Keys::new(endpoint, &config.delimiter),
            client,
            conn,
            poll_timeout: Duration::from_secs(config.poll_timeout_secs.max(1)),
            delivery_buffer: config.delivery_buffer.max(1),
            shutdown,
            pumps: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn push(&self, id: &str, payload: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset(&self.keys.tasks, id, payload)
            .ignore()
            .lpush(&self.keys.todo, id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(endpoint = %self.endpoint, id = %id, "Pushed task");
        Ok(())
    }

    async fn listen(&self) -> Result<Listener> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        // Blocking pops get their own connection so they never stall pushes.
        let blocking = self.client.get_multiplexed_async_connection().await?;

        let (delivery_tx, deliveries) = mpsc::channel(self.delivery_buffer);
        let (acks, ack_rx) = mpsc::unbounded_channel();
        let (failures, fail_rx) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::channel(ERROR_CAPACITY);

        let pump = tokio::spawn(pump(
            self.endpoint.clone(),
            self.keys.clone(),
            blocking,
            self.conn.clone(),
            self.poll_timeout,
            delivery_tx,
            error_tx.clone(),
            self.shutdown.subscribe(),
        ));
        self.pumps.lock().await.push(pump);

        tokio::spawn(settle(
            self.keys.clone(),
            self.conn.clone(),
            ack_rx,
            fail_rx,
            error_tx,
        ));

        info!(endpoint = %self.endpoint, "Listening on Redis queue");

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

        let pumps = std::mem::take(&mut *self.pumps.lock().await);
        let mut result = Ok(());
        for pump in pumps {
            if let Err(e) = pump.await {
                result = Err(QueueError::Connection(format!("listener task failed: {}", e)));
            }
        }

        debug!(endpoint = %self.endpoint, "Closed Redis queue");
        result
    }
}

/// Pop tasks into the delivery stream until shutdown.
///
/// Shutdown is checked between pops, so closing waits at most one poll timeout.
#[allow(clippy::too_many_arguments)]
async fn pump(
    endpoint: String,
    keys: Keys,
    mut blocking: redis::aio::MultiplexedConnection,
    mut conn: ConnectionManager,
    poll_timeout: Duration,
    tx: mpsc::Sender<Delivery>,
    errors: mpsc::Sender<QueueError>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let popped: redis::RedisResult<Option<String>> = redis::cmd("BRPOPLPUSH")
            .arg(&keys.todo)
            .arg(&keys.doing)
            .arg(poll_timeout.as_secs())
            .query_async(&mut blocking)
            .await;

        let id = match popped {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Blocking pop failed");
                let _ = errors.try_send(e.into());
                tokio::select! {
                    _ = tokio::time::sleep(poll_timeout) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        let payload: redis::RedisResult<Option<Vec<u8>>> = conn.hget(&keys.tasks, &id).await;
        match payload {
            Ok(Some(payload)) => {
                if tx.send(Delivery { id, payload }).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = errors.try_send(QueueError::MissingPayload(id));
            }
            Err(e) => {
                let _ = errors.try_send(e.into());
            }
        }
    }

    debug!(endpoint = %endpoint, "Listener stopped");
}

/// Apply acks and fails until both sinks are dropped.
async fn settle(
    keys: Keys,
    mut conn: ConnectionManager,
    mut acks: mpsc::UnboundedReceiver<String>,
    mut failures: mpsc::UnboundedReceiver<String>,
    errors: mpsc::Sender<QueueError>,
) {
    let mut acks_open = true;
    let mut failures_open = true;

    while acks_open || failures_open {
        let outcome: redis::RedisResult<()> = tokio::select! {
            id = acks.recv(), if acks_open => match id {
                Some(id) => redis::pipe()
                    .atomic()
                    .lrem(&keys.doing, 1, &id)
                    .ignore()
                    .hdel(&keys.tasks, &id)
                    .ignore()
                    .query_async(&mut conn)
                    .await,
                None => {
                    acks_open = false;
                    Ok(())
                }
            },
            id = failures.recv(), if failures_open => match id {
                Some(id) => redis::pipe()
                    .atomic()
                    .lrem(&keys.doing, 1, &id)
                    .ignore()
                    .lpush(&keys.failed, &id)
                    .ignore()
                    .query_async(&mut conn)
                    .await,
                None => {
                    failures_open = false;
                    Ok(())
                }
            },
        };

        if let Err(e) = outcome {
            let _ = errors.try_send(e.into());
        }
    }
}
